pub mod aead;
pub mod keys;

use openssl::error::ErrorStack;

use crate::error::CryptoError;

/// Length of the session key shared with the enclave (SHA-256 output).
pub const SESSION_KEY_LEN: usize = 32;

/// Coordinate length of a P-384 point.
pub const P384_COORD_LEN: usize = 48;

pub(crate) fn key_agreement_err(context: &'static str) -> impl FnOnce(ErrorStack) -> CryptoError {
    move |e| CryptoError::KeyAgreement(format!("{context}: {e}"))
}
