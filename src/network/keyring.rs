//! Per-connection media keys
//!
//! AES-256-GCM with the media header as associated data. Each (key id, SSRC)
//! pair gets a 4-byte nonce base from HKDF-SHA256; the 12-byte nonce is the
//! nonce base followed by the packet's 64-bit counter.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use tracing::debug;

use super::error::KeyError;
use crate::protocol::AUTH_TAG_SIZE;

/// Key material size (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce (96 bits for AES-GCM)
const NONCE_SIZE: usize = 12;

const NONCE_BASE_SIZE: usize = 4;

const NONCE_BASE_LABEL: &[u8] = b"nonce-base\0";

struct KeyEntry {
    material: [u8; KEY_SIZE],
    cipher: Aes256Gcm,
}

/// Key storage for one session
pub struct KeyRing {
    room_id: String,
    keys: HashMap<u8, KeyEntry>,
    nonce_bases: HashMap<(u8, u32), [u8; NONCE_BASE_SIZE]>,
}

impl KeyRing {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            keys: HashMap::new(),
            nonce_bases: HashMap::new(),
        }
    }

    /// Install (or replace) the key for `key_id`.
    ///
    /// Replacing a key drops every nonce base derived from the old material.
    pub fn set_key(&mut self, key_id: u8, material: &[u8]) -> Result<(), KeyError> {
        let invalid = KeyError::InvalidKeySize {
            expected: KEY_SIZE,
            actual: material.len(),
        };
        let material: [u8; KEY_SIZE] = material.try_into().map_err(|_| invalid.clone())?;
        let cipher = Aes256Gcm::new_from_slice(&material).map_err(|_| invalid)?;

        self.nonce_bases.retain(|(id, _), _| *id != key_id);
        self.keys.insert(key_id, KeyEntry { material, cipher });
        debug!("Installed key id {}", key_id);
        Ok(())
    }

    pub fn has_key(&self, key_id: u8) -> bool {
        self.keys.contains_key(&key_id)
    }

    /// Drop cached nonce bases for a stream that went away
    pub fn forget_ssrc(&mut self, ssrc: u32) {
        self.nonce_bases.retain(|(_, s), _| *s != ssrc);
    }

    /// Encrypt `plaintext`, returning ciphertext followed by the 16-byte tag
    pub fn seal(
        &mut self,
        aad: &[u8],
        plaintext: &[u8],
        key_id: u8,
        ssrc: u32,
        counter: u64,
    ) -> Result<Vec<u8>, KeyError> {
        if counter == u64::MAX {
            return Err(KeyError::CounterExhausted { key_id, ssrc });
        }
        let nonce = self
            .nonce(key_id, ssrc, counter)
            .ok_or(KeyError::UnknownKeyId(key_id))?;
        let entry = self.keys.get(&key_id).ok_or(KeyError::UnknownKeyId(key_id))?;

        entry
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| KeyError::Encryption)
    }

    /// Decrypt and authenticate. Any failure yields `None`.
    pub fn open(
        &mut self,
        aad: &[u8],
        ciphertext: &[u8],
        key_id: u8,
        ssrc: u32,
        counter: u64,
    ) -> Option<Vec<u8>> {
        if ciphertext.len() < AUTH_TAG_SIZE {
            return None;
        }
        let nonce = self.nonce(key_id, ssrc, counter)?;
        let entry = self.keys.get(&key_id)?;

        entry
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .ok()
    }

    /// Nonce layout: [4 bytes nonce base][8 bytes big-endian counter]
    fn nonce(&mut self, key_id: u8, ssrc: u32, counter: u64) -> Option<[u8; NONCE_SIZE]> {
        let base = self.nonce_base(key_id, ssrc)?;
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_BASE_SIZE].copy_from_slice(&base);
        nonce[NONCE_BASE_SIZE..].copy_from_slice(&counter.to_be_bytes());
        Some(nonce)
    }

    fn nonce_base(&mut self, key_id: u8, ssrc: u32) -> Option<[u8; NONCE_BASE_SIZE]> {
        if let Some(base) = self.nonce_bases.get(&(key_id, ssrc)) {
            return Some(*base);
        }

        let entry = self.keys.get(&key_id)?;
        let hk = Hkdf::<Sha256>::new(None, &entry.material);

        let mut info = Vec::with_capacity(NONCE_BASE_LABEL.len() + self.room_id.len() + 5);
        info.extend_from_slice(NONCE_BASE_LABEL);
        info.extend_from_slice(self.room_id.as_bytes());
        info.push(key_id);
        info.extend_from_slice(&ssrc.to_be_bytes());

        let mut base = [0u8; NONCE_BASE_SIZE];
        hk.expand(&info, &mut base).ok()?;
        self.nonce_bases.insert((key_id, ssrc), base);
        Some(base)
    }
}
