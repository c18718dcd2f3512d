/// Errors from the binary packing primitives.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error(
        "unable to convert {field} = {value} to an unsigned {bits}-bit integer for enclave type '{enclave_type}'"
    )]
    InvalidParameterEncoding {
        field: &'static str,
        value: i64,
        bits: u32,
        enclave_type: String,
    },

    #[error("truncated {field}: need {needed} bytes, {available} available")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("{what} size mismatch: declared {declared}, actual {actual}")]
    SizeMismatch {
        what: &'static str,
        declared: usize,
        actual: usize,
    },
}

/// Errors from key conversion, key agreement and package encryption.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid {kind} key blob: {reason}")]
    InvalidKeyBlob { kind: &'static str, reason: String },

    #[error("key agreement failed: {0}")]
    KeyAgreement(String),

    #[error("failed to encrypt enclave package: {0}")]
    EncryptFailed(String),

    #[error("authentication tag mismatch: ciphertext is invalid or tampered")]
    DecryptFailed,

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("openssl error: {0}")]
    Openssl(String),
}

/// Errors from attestation of the enclave and its host.
#[derive(Debug, thiserror::Error)]
pub enum AttestError {
    #[error("failed to parse attestation info: {0}")]
    MalformedInfo(String),

    #[error("attestation verification failed: {0}")]
    VerificationFailed(String),

    #[error("enclave policy mismatch on {property}: actual {actual}, expected {expected}")]
    PolicyMismatch {
        property: &'static str,
        actual: String,
        expected: String,
    },

    #[error("the enclave is running in debug mode and cannot be trusted")]
    DebuggableEnclave,

    #[error("request to '{url}' failed after {attempts} attempt(s): {message}")]
    FetchFailed {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("the attestation token has expired")]
    TokenExpired,

    #[error("the attestation token is not valid yet")]
    TokenNotYetValid,

    #[error("attestation token is missing claim '{0}'")]
    MissingClaim(String),

    #[error("attestation token claim '{claim}' has unexpected value '{value}'")]
    InvalidClaim { claim: String, value: String },

    #[error("failed to create enclave session: {0}")]
    SessionCreation(String),
}

/// Errors from one HTTP request to an attestation or signing-key endpoint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("invalid response body: {0}")]
    InvalidResponse(String),
}

/// Errors from configuration of providers and protocols.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("attestation protocol is not specified")]
    ProtocolNotSpecified,

    #[error("unknown attestation protocol '{0}'")]
    UnknownProtocol(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors from caller-supplied arguments.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("internal error: argument '{argument}' of {operation} is null")]
    NullArgument {
        argument: &'static str,
        operation: &'static str,
    },

    #[error("internal error: argument '{argument}' of {operation} is empty")]
    EmptyArgument {
        argument: &'static str,
        operation: &'static str,
    },

    #[error("no column encryption key values found for an entry sent to the enclave")]
    ColumnEncryptionKeysNotFound,

    #[error("column key decryption failed: {0}")]
    KeyDecryption(String),
}

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Attestation(#[from] AttestError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error("no enclave session is available for the query")]
    SessionUnavailable,

    /// The whole operation, including attestation, may be retried.
    #[error("enclave query execution failed and may be retried: {0}")]
    RetryableEnclaveQueryExecution(#[source] Box<Error>),
}

impl Error {
    /// Whether the caller may retry the whole operation, re-attesting if needed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RetryableEnclaveQueryExecution(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
