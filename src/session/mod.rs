pub mod cache;
pub mod gate;
pub mod retry;
pub mod scratch;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use zeroize::Zeroize;

/// An established secure session with one server's enclave.
///
/// Immutable once created. The session key is wiped when the last
/// reference is dropped.
pub struct EnclaveSession {
    session_id: i64,
    session_key: Vec<u8>,
    created_at: Instant,
}

impl EnclaveSession {
    pub fn new(session_key: Vec<u8>, session_id: i64) -> Self {
        Self {
            session_id,
            session_key,
            created_at: Instant::now(),
        }
    }

    /// Handle assigned by the enclave.
    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// Symmetric key shared with the enclave.
    pub fn session_key(&self) -> &[u8] {
        &self.session_key
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

impl Drop for EnclaveSession {
    fn drop(&mut self) {
        self.session_key.zeroize();
    }
}

impl fmt::Debug for EnclaveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnclaveSession")
            .field("session_id", &self.session_id)
            .field("session_key", &"<redacted>")
            .finish()
    }
}

/// Scope of a session lookup: one server, one attestation URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnclaveSessionParameters {
    pub server_name: String,
    pub attestation_url: String,
    pub database: String,
}

impl EnclaveSessionParameters {
    pub fn new(
        server_name: impl Into<String>,
        attestation_url: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            attestation_url: attestation_url.into(),
            database: database.into(),
        }
    }
}

/// Token tying together the calls of one logical attestation attempt.
///
/// Callers create one per attempt and pass it to get-session,
/// get-attestation-parameters and create-session in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(u64);

static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

impl CorrelationId {
    pub fn new() -> Self {
        Self(NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Result of a session lookup through the lock protocol.
#[derive(Debug, Default)]
pub struct SessionLookup {
    /// The cached session, if one exists.
    pub session: Option<std::sync::Arc<EnclaveSession>>,
    /// Replay counter for packages built with `session`.
    pub counter: i64,
    /// Nonce generated for a new attestation attempt, if requested.
    pub custom_data: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_key() {
        let session = EnclaveSession::new(vec![0x42; 32], 9);
        let out = format!("{session:?}");
        assert!(out.contains("session_id: 9"));
        assert!(!out.contains("66"));
        assert!(out.contains("<redacted>"));
    }

    #[test]
    fn correlation_ids_are_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
    }
}
