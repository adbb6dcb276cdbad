//! At-rest encryption for embedding blobs.
//!
//! AES-256-GCM with a key derived from a passphrase via SHA-256. Each
//! blob carries its own random 96-bit nonce, prepended to the
//! ciphertext, so identical embeddings never produce identical blobs.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CryptError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed — wrong passphrase or corrupted blob")]
    Decrypt,
    #[error("blob too short to carry a nonce")]
    Malformed,
}

pub struct EmbeddingCipher {
    cipher: Aes256Gcm,
}

impl EmbeddingCipher {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key_bytes: [u8; 32] = Sha256::digest(passphrase.as_bytes()).into();
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt a plaintext blob, returning `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a `nonce || ciphertext` blob.
    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, CryptError> {
        if blob.len() < NONCE_LEN {
            return Err(CryptError::Malformed);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = EmbeddingCipher::from_passphrase("correct horse");
        let plaintext = b"some embedding bytes";
        let blob = cipher.seal(plaintext).unwrap();
        assert_ne!(&blob[NONCE_LEN..], plaintext.as_slice());
        assert_eq!(cipher.open(&blob).unwrap(), plaintext);
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let cipher = EmbeddingCipher::from_passphrase("correct horse");
        let a = cipher.seal(b"same input").unwrap();
        let b = cipher.seal(b"same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let blob = EmbeddingCipher::from_passphrase("right")
            .seal(b"secret")
            .unwrap();
        let err = EmbeddingCipher::from_passphrase("wrong")
            .open(&blob)
            .unwrap_err();
        assert!(matches!(err, CryptError::Decrypt));
    }

    #[test]
    fn test_tampered_blob_fails() {
        let cipher = EmbeddingCipher::from_passphrase("key");
        let mut blob = cipher.seal(b"secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        assert!(matches!(cipher.open(&blob).unwrap_err(), CryptError::Decrypt));
    }

    #[test]
    fn test_short_blob_rejected() {
        let cipher = EmbeddingCipher::from_passphrase("key");
        assert!(matches!(
            cipher.open(&[0u8; 5]).unwrap_err(),
            CryptError::Malformed
        ));
    }
}
