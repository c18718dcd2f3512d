//! Client-side attestation and secure sessions for SQL Server enclaves.
//!
//! Before a query touching enclave-enabled encrypted columns runs, the
//! client attests the server's enclave (through the Host Guardian Service or
//! the Azure Attestation Service), agrees a session key with it over ECDH,
//! and sends the column encryption keys the query needs encrypted under that
//! key. [`EnclaveDelegate`] is the entry point.

pub mod attestation;
pub mod crypto;
pub mod delegate;
pub mod error;
pub mod package;
pub mod session;
pub mod wire;

// Re-export key types at crate root for convenience.
pub use error::{Error, Result};

pub use attestation::{
    AttestationParameters, AttestationProtocol, AttestationProvider, AttestationRequest,
    EnclaveType, ProviderConfig,
};
pub use delegate::EnclaveDelegate;
pub use package::{ColumnEncryptionKeyEntry, ColumnKeyDecryptor, EnclavePackage, EncryptedKeyValue};
pub use session::{CorrelationId, EnclaveSession, EnclaveSessionParameters, SessionLookup};

#[cfg(feature = "mock")]
pub use attestation::mock::{MockEnclave, StaticFetcher, TokenProfile};
