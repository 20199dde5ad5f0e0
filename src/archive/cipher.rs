//! Optional payload encryption for the module archive.
//!
//! AES-128 in CTR mode. The nonce is derived from (key, entry name, payload)
//! instead of drawn from an RNG: identical inputs must produce byte-identical
//! archives, and a content-derived nonce still never repeats across distinct
//! payloads. The nonce is prepended to each encrypted payload.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Key length in bytes. A longer key string is truncated, a shorter one is
/// zero-padded.
pub const KEY_LEN: usize = 16;

const NONCE_LEN: usize = 16;

/// Block cipher wrapper used by the module archive writer and reader.
#[derive(Clone)]
pub struct ArchiveCipher {
    key: [u8; KEY_LEN],
}

impl ArchiveCipher {
    pub fn new(key: &str) -> Self {
        let mut buf = [0u8; KEY_LEN];
        let bytes = key.as_bytes();
        let n = bytes.len().min(KEY_LEN);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self { key: buf }
    }

    /// Key as lowercase hex, for the generated key module the bootstrap
    /// modules read at import time.
    pub fn key_hex(&self) -> String {
        self.key.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Encrypt one payload. Output is nonce followed by ciphertext.
    pub fn encrypt(&self, name: &str, data: &[u8]) -> Vec<u8> {
        let nonce = self.derive_nonce(name, data);
        let mut out = Vec::with_capacity(NONCE_LEN + data.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(data);
        let mut cipher = Aes128Ctr::new(&self.key.into(), &nonce.into());
        cipher.apply_keystream(&mut out[NONCE_LEN..]);
        out
    }

    /// Decrypt a payload produced by `encrypt`.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            bail!("Encrypted payload shorter than its nonce");
        }
        let nonce: [u8; NONCE_LEN] = data[..NONCE_LEN].try_into().expect("slice is 16 bytes");
        let mut out = data[NONCE_LEN..].to_vec();
        let mut cipher = Aes128Ctr::new(&self.key.into(), &nonce.into());
        cipher.apply_keystream(&mut out);
        Ok(out)
    }

    fn derive_nonce(&self, name: &str, data: &[u8]) -> [u8; NONCE_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(name.as_bytes());
        hasher.update(data);
        let digest = hasher.finalize();
        digest[..NONCE_LEN].try_into().expect("digest is 32 bytes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let cipher = ArchiveCipher::new("sixteen byte key");
        let payload = b"compiled module bytes".to_vec();
        let encrypted = cipher.encrypt("mod_a", &payload);
        assert_ne!(&encrypted[NONCE_LEN..], payload.as_slice());
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), payload);
    }

    #[test]
    fn test_deterministic() {
        let cipher = ArchiveCipher::new("k");
        let a = cipher.encrypt("mod_a", b"data");
        let b = cipher.encrypt("mod_a", b"data");
        assert_eq!(a, b);
        // A different entry name yields a different nonce and ciphertext.
        let c = cipher.encrypt("mod_b", b"data");
        assert_ne!(a, c);
    }

    #[test]
    fn test_short_key_padded() {
        let short = ArchiveCipher::new("abc");
        let padded = ArchiveCipher::new("abc\0\0");
        assert_eq!(short.key_hex(), padded.key_hex());
    }
}
