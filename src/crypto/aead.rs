//! `AEAD_AES_256_CBC_HMAC_SHA256`, the cell encryption scheme the enclave
//! expects for key packages.
//!
//! Ciphertext layout: `version(1) || tag(32) || iv(16) || aes-256-cbc(pkcs7)`,
//! where `tag = HMAC-SHA256(mac_key, version || iv || ciphertext || version_len)`.
//! Encryption, MAC and IV keys are derived from the root key with
//! HMAC-SHA256 over fixed UTF-16LE labels.

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use openssl::symm::{decrypt, encrypt, Cipher};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::wire::utf16le;

pub const ALGORITHM_NAME: &str = "AEAD_AES_256_CBC_HMAC_SHA256";

const ALGORITHM_VERSION: u8 = 0x01;
const VERSION_LEN: u8 = 1;
const KEY_LEN: usize = 32;
const BLOCK_LEN: usize = 16;
const TAG_LEN: usize = 32;
const MIN_CIPHERTEXT_LEN: usize = 1 + TAG_LEN + BLOCK_LEN + BLOCK_LEN;

/// How the IV is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    /// Fresh random IV per call; equal plaintexts encrypt differently.
    Randomized,
    /// IV derived from the plaintext; equal plaintexts encrypt equally.
    Deterministic,
}

fn label(purpose: &str) -> Vec<u8> {
    utf16le(&format!(
        "Microsoft SQL Server cell {purpose} with encryption algorithm:{ALGORITHM_NAME} and key length:256"
    ))
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, CryptoError> {
    let pkey = PKey::hmac(key).map_err(|e| CryptoError::EncryptFailed(format!("hmac key: {e}")))?;
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey)
        .map_err(|e| CryptoError::EncryptFailed(format!("hmac init: {e}")))?;
    for part in parts {
        signer
            .update(part)
            .map_err(|e| CryptoError::EncryptFailed(format!("hmac update: {e}")))?;
    }
    signer
        .sign_to_vec()
        .map_err(|e| CryptoError::EncryptFailed(format!("hmac final: {e}")))
}

/// Keys derived from one 256-bit root key.
pub struct AeadAes256CbcHmac256 {
    enc_key: [u8; KEY_LEN],
    mac_key: [u8; KEY_LEN],
    iv_key: [u8; KEY_LEN],
}

impl Drop for AeadAes256CbcHmac256 {
    fn drop(&mut self) {
        self.enc_key.zeroize();
        self.mac_key.zeroize();
        self.iv_key.zeroize();
    }
}

impl AeadAes256CbcHmac256 {
    /// Derive the encryption, MAC and IV keys from `root_key`.
    pub fn new(root_key: &[u8]) -> Result<Self, CryptoError> {
        if root_key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: root_key.len(),
            });
        }
        let derive = |purpose: &str| -> Result<[u8; KEY_LEN], CryptoError> {
            let mut out = [0u8; KEY_LEN];
            out.copy_from_slice(&hmac_sha256(root_key, &[label(purpose).as_slice()])?);
            Ok(out)
        };
        Ok(Self {
            enc_key: derive("encryption key")?,
            mac_key: derive("MAC key")?,
            iv_key: derive("IV key")?,
        })
    }

    pub fn encrypt(&self, plaintext: &[u8], kind: EncryptionType) -> Result<Vec<u8>, CryptoError> {
        let mut iv = [0u8; BLOCK_LEN];
        match kind {
            EncryptionType::Randomized => rand::thread_rng().fill_bytes(&mut iv),
            EncryptionType::Deterministic => {
                iv.copy_from_slice(&hmac_sha256(&self.iv_key, &[plaintext])?[..BLOCK_LEN])
            }
        }

        let ciphertext = encrypt(Cipher::aes_256_cbc(), &self.enc_key, Some(&iv), plaintext)
            .map_err(|e| CryptoError::EncryptFailed(format!("aes-256-cbc: {e}")))?;
        let tag = self.tag(&iv, &ciphertext)?;

        let mut out = Vec::with_capacity(1 + TAG_LEN + BLOCK_LEN + ciphertext.len());
        out.push(ALGORITHM_VERSION);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < MIN_CIPHERTEXT_LEN || data[0] != ALGORITHM_VERSION {
            return Err(CryptoError::DecryptFailed);
        }
        let tag = &data[1..1 + TAG_LEN];
        let iv = &data[1 + TAG_LEN..1 + TAG_LEN + BLOCK_LEN];
        let ciphertext = &data[1 + TAG_LEN + BLOCK_LEN..];

        let expected = self.tag(iv, ciphertext)?;
        if !openssl::memcmp::eq(tag, &expected) {
            return Err(CryptoError::DecryptFailed);
        }
        decrypt(Cipher::aes_256_cbc(), &self.enc_key, Some(iv), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }

    fn tag(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        hmac_sha256(
            &self.mac_key,
            &[&[ALGORITHM_VERSION][..], iv, ciphertext, &[VERSION_LEN][..]],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: [u8; 32] = [0x5A; 32];

    #[test]
    fn randomized_roundtrip_and_layout() {
        let aead = AeadAes256CbcHmac256::new(&ROOT).unwrap();
        let ct = aead.encrypt(b"key package", EncryptionType::Randomized).unwrap();
        assert_eq!(ct[0], 0x01);
        // 11 bytes of plaintext pad to one block.
        assert_eq!(ct.len(), 1 + 32 + 16 + 16);
        assert_eq!(aead.decrypt(&ct).unwrap(), b"key package");
    }

    #[test]
    fn randomized_differs_deterministic_repeats() {
        let aead = AeadAes256CbcHmac256::new(&ROOT).unwrap();
        let a = aead.encrypt(b"same", EncryptionType::Randomized).unwrap();
        let b = aead.encrypt(b"same", EncryptionType::Randomized).unwrap();
        assert_ne!(a, b);

        let c = aead.encrypt(b"same", EncryptionType::Deterministic).unwrap();
        let d = aead.encrypt(b"same", EncryptionType::Deterministic).unwrap();
        assert_eq!(c, d);
    }

    #[test]
    fn tamper_is_detected() {
        let aead = AeadAes256CbcHmac256::new(&ROOT).unwrap();
        let mut ct = aead.encrypt(b"payload", EncryptionType::Randomized).unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(matches!(aead.decrypt(&ct), Err(CryptoError::DecryptFailed)));
    }

    #[test]
    fn wrong_key_is_detected() {
        let a = AeadAes256CbcHmac256::new(&ROOT).unwrap();
        let b = AeadAes256CbcHmac256::new(&[0x11; 32]).unwrap();
        let ct = a.encrypt(b"payload", EncryptionType::Randomized).unwrap();
        assert!(b.decrypt(&ct).is_err());
    }

    #[test]
    fn rejects_bad_root_key_length() {
        assert!(matches!(
            AeadAes256CbcHmac256::new(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn rejects_short_ciphertext() {
        let aead = AeadAes256CbcHmac256::new(&ROOT).unwrap();
        assert!(aead.decrypt(&[0x01; 10]).is_err());
    }
}
