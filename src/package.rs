//! Key packages sent to the enclave alongside a query.
//!
//! Plaintext layout:
//! `GUID(16) | counter(i64) | SHA-256(UTF-16LE query)(32) | keys...` where
//! each key is `database_id(i32) | cek_md_version(8) | cek_id(u16) |
//! key_len(u16) | key`. The plaintext is encrypted under the session key
//! with `AEAD_AES_256_CBC_HMAC_SHA256` and prefixed with the session id.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::crypto::aead::{AeadAes256CbcHmac256, EncryptionType};
use crate::error::{CryptoError, InputError, Result};
use crate::session::EnclaveSession;
use crate::wire::{concat, to_u16_field, utf16le};

/// Length of the per-package GUID.
pub const GUID_LEN: usize = 16;

/// Length of the query text hash.
pub const QUERY_HASH_LEN: usize = 32;

/// One encrypted copy of a column encryption key, wrapped by one master key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedKeyValue {
    pub encrypted_key: Vec<u8>,
    pub database_id: i32,
    pub cek_id: i32,
    pub cek_version: i32,
    pub cek_md_version: [u8; 8],
    pub key_path: String,
    pub key_store_name: String,
    pub algorithm_name: String,
}

/// A column encryption key the enclave needs, with every encrypted copy
/// the server returned for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnEncryptionKeyEntry {
    pub ordinal: i32,
    pub values: Vec<EncryptedKeyValue>,
}

/// Unwraps column encryption keys through the caller's key stores.
pub trait ColumnKeyDecryptor: Send + Sync {
    /// The plaintext key for `entry`, or `None` if no key store could
    /// produce it.
    fn decrypt(&self, entry: &ColumnEncryptionKeyEntry, server_name: &str) -> Result<Option<Vec<u8>>>;
}

/// A decrypted column encryption key ready for the enclave.
pub struct ColumnEncryptionKeyInfo {
    root_key: Vec<u8>,
    pub database_id: i32,
    pub cek_md_version: [u8; 8],
    pub cek_id: i32,
}

impl ColumnEncryptionKeyInfo {
    pub fn new(root_key: Vec<u8>, database_id: i32, cek_md_version: [u8; 8], cek_id: i32) -> Self {
        Self {
            root_key,
            database_id,
            cek_md_version,
            cek_id,
        }
    }

    pub fn root_key(&self) -> &[u8] {
        &self.root_key
    }

    fn serialize(&self, buf: &mut BytesMut, enclave_type: &str) -> Result<()> {
        let cek_id = to_u16_field("keyId", self.cek_id as i64, enclave_type)?;
        let key_len = to_u16_field("keyLength", self.root_key.len() as i64, enclave_type)?;
        buf.put_i32_le(self.database_id);
        buf.put_slice(&self.cek_md_version);
        buf.put_u16_le(cek_id);
        buf.put_u16_le(key_len);
        buf.put_slice(&self.root_key);
        Ok(())
    }
}

impl Drop for ColumnEncryptionKeyInfo {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

impl std::fmt::Debug for ColumnEncryptionKeyInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnEncryptionKeyInfo")
            .field("database_id", &self.database_id)
            .field("cek_id", &self.cek_id)
            .field("root_key", &"<redacted>")
            .finish()
    }
}

/// The bytes sent to the enclave and the session they were built for.
#[derive(Debug, Clone)]
pub struct EnclavePackage {
    pub enclave_package_bytes: Vec<u8>,
    pub session: Arc<EnclaveSession>,
}

/// Decrypt every key the enclave needs, in order.
pub fn decrypt_keys(
    entries: &[ColumnEncryptionKeyEntry],
    server_name: &str,
    decryptor: &dyn ColumnKeyDecryptor,
) -> Result<Vec<ColumnEncryptionKeyInfo>> {
    entries
        .iter()
        .map(|entry| {
            let root_key = decryptor
                .decrypt(entry, server_name)?
                .ok_or(InputError::NullArgument {
                    argument: "columnEncryptionKey",
                    operation: "decrypt_keys",
                })?;
            // Every copy shares the key id and plaintext; only the wrapping differs.
            let first = entry
                .values
                .first()
                .ok_or(InputError::ColumnEncryptionKeysNotFound)?;
            Ok(ColumnEncryptionKeyInfo::new(
                root_key,
                first.database_id,
                first.cek_md_version,
                first.cek_id,
            ))
        })
        .collect()
}

/// `SHA-256(UTF-16LE(query))`.
///
/// `None` and blank text fail with distinct errors.
pub fn compute_query_hash(query: Option<&str>) -> Result<[u8; QUERY_HASH_LEN]> {
    let query = query.ok_or(InputError::NullArgument {
        argument: "queryString",
        operation: "compute_query_hash",
    })?;
    if query.trim().is_empty() {
        return Err(InputError::EmptyArgument {
            argument: "queryString",
            operation: "compute_query_hash",
        }
        .into());
    }
    Ok(Sha256::digest(utf16le(query)).into())
}

fn new_guid() -> [u8; GUID_LEN] {
    let mut guid = [0u8; GUID_LEN];
    rand::thread_rng().fill_bytes(&mut guid);
    // Version 4, RFC 4122 variant, in the little-endian field order of a
    // Windows GUID byte array.
    guid[7] = (guid[7] & 0x0F) | 0x40;
    guid[8] = (guid[8] & 0x3F) | 0x80;
    guid
}

/// Build the plaintext key package.
pub fn generate_byte_package(
    counter: i64,
    query_hash: &[u8; QUERY_HASH_LEN],
    keys: &[ColumnEncryptionKeyInfo],
    enclave_type: &str,
) -> Result<Vec<u8>> {
    let keys_len: usize = keys.iter().map(|k| 16 + k.root_key.len()).sum();
    let mut buf = BytesMut::with_capacity(GUID_LEN + 8 + QUERY_HASH_LEN + keys_len);
    buf.put_slice(&new_guid());
    buf.put_i64_le(counter);
    buf.put_slice(query_hash);
    for key in keys {
        key.serialize(&mut buf, enclave_type)?;
    }
    Ok(buf.to_vec())
}

/// Encrypt a key package under the session key.
pub fn encrypt_byte_package(package: &[u8], session_key: &[u8]) -> Result<Vec<u8>> {
    if session_key.is_empty() {
        return Err(InputError::EmptyArgument {
            argument: "sessionKey",
            operation: "encrypt_byte_package",
        }
        .into());
    }
    let aead = AeadAes256CbcHmac256::new(session_key)
        .map_err(|e| CryptoError::EncryptFailed(e.to_string()))?;
    Ok(aead.encrypt(package, EncryptionType::Randomized)?)
}

/// Build the enclave package for `query` under an established session.
#[allow(clippy::too_many_arguments)]
pub fn build_enclave_package(
    session: Arc<EnclaveSession>,
    counter: i64,
    keys: &[ColumnEncryptionKeyEntry],
    query: Option<&str>,
    enclave_type: &str,
    server_name: &str,
    decryptor: &dyn ColumnKeyDecryptor,
) -> Result<EnclavePackage> {
    let decrypted = decrypt_keys(keys, server_name, decryptor)?;
    let query_hash = compute_query_hash(query)?;
    let mut package = generate_byte_package(counter, &query_hash, &decrypted, enclave_type)?;
    let encrypted = encrypt_byte_package(&package, session.session_key());
    package.zeroize();

    let enclave_package_bytes = concat(&[&session.session_id().to_le_bytes(), &encrypted?]);
    tracing::debug!(
        session_id = session.session_id(),
        counter,
        keys = decrypted.len(),
        "built enclave package"
    );
    Ok(EnclavePackage {
        enclave_package_bytes,
        session,
    })
}
