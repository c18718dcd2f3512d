//! Protocol dispatch for the connection layer.
//!
//! [`EnclaveDelegate`] owns one provider per attestation protocol, created
//! on first use with the delegate's [`ProviderConfig`], and routes every
//! session operation to the provider for the connection's protocol.

use std::sync::{Arc, Mutex, OnceLock};

use crate::attestation::aas::AasProvider;
use crate::attestation::hgs::HgsProvider;
use crate::attestation::http::HttpFetcher;
use crate::attestation::none::NoneProvider;
use crate::attestation::{
    AttestationParameters, AttestationProtocol, AttestationProvider, AttestationRequest,
    ProviderConfig,
};
use crate::crypto::keys::DhKeyPair;
use crate::error::{ConfigError, Error, Result};
use crate::package::{build_enclave_package, ColumnEncryptionKeyEntry, ColumnKeyDecryptor, EnclavePackage};
use crate::session::{CorrelationId, EnclaveSession, EnclaveSessionParameters, SessionLookup};

/// Entry point for enclave sessions and enclave packages.
pub struct EnclaveDelegate {
    config: ProviderConfig,
    fetcher: Arc<dyn HttpFetcher>,
    hgs: OnceLock<HgsProvider>,
    aas: OnceLock<AasProvider>,
    none: OnceLock<NoneProvider>,
    create_lock: Mutex<()>,
}

impl std::fmt::Debug for EnclaveDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnclaveDelegate")
            .field("config", &self.config)
            .field("hgs", &self.hgs.get().is_some())
            .field("aas", &self.aas.get().is_some())
            .field("none", &self.none.get().is_some())
            .finish()
    }
}

impl EnclaveDelegate {
    /// Delegate fetching over HTTPS.
    #[cfg(feature = "http")]
    pub fn new(config: ProviderConfig) -> Self {
        Self::with_fetcher(config, Arc::new(crate::attestation::http::UreqFetcher::new()))
    }

    pub fn with_fetcher(config: ProviderConfig, fetcher: Arc<dyn HttpFetcher>) -> Self {
        Self {
            config,
            fetcher,
            hgs: OnceLock::new(),
            aas: OnceLock::new(),
            none: OnceLock::new(),
            create_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// The provider for `protocol`, created on first use.
    pub fn provider(&self, protocol: AttestationProtocol) -> Result<&dyn AttestationProvider> {
        match protocol {
            AttestationProtocol::NotSpecified => Err(ConfigError::ProtocolNotSpecified.into()),
            AttestationProtocol::Hgs => Ok(self.hgs.get_or_init(|| {
                tracing::debug!(protocol = %protocol, "creating attestation provider");
                HgsProvider::new(&self.config, Arc::clone(&self.fetcher))
            })),
            AttestationProtocol::Aas => Ok(self.aas.get_or_init(|| {
                tracing::debug!(protocol = %protocol, "creating attestation provider");
                AasProvider::new(&self.config, Arc::clone(&self.fetcher))
            })),
            AttestationProtocol::None => Ok(self.none.get_or_init(|| {
                tracing::debug!(protocol = %protocol, "creating attestation provider");
                NoneProvider::new(&self.config)
            })),
        }
    }

    /// Look up the cached session for `params`, running the lock protocol.
    pub fn get_enclave_session(
        &self,
        protocol: AttestationProtocol,
        params: &EnclaveSessionParameters,
        correlation: CorrelationId,
        generate_custom_data: bool,
    ) -> Result<SessionLookup> {
        Ok(self
            .provider(protocol)?
            .get_enclave_session(params, correlation, generate_custom_data))
    }

    pub fn get_attestation_parameters(
        &self,
        protocol: AttestationProtocol,
        correlation: CorrelationId,
        attestation_url: &str,
        custom_data: Option<&[u8]>,
    ) -> Result<AttestationRequest> {
        self.provider(protocol)?
            .get_attestation_parameters(correlation, attestation_url, custom_data)
    }

    /// Wire buffer sent to the server with the attestation request.
    pub fn serialize_attestation_parameters(
        &self,
        parameters: &AttestationParameters,
        enclave_type: &str,
    ) -> Result<Vec<u8>> {
        Ok(parameters.serialize(enclave_type)?)
    }

    /// Create a session from the server's attestation info, unless one
    /// already exists for `params`.
    pub fn create_enclave_session(
        &self,
        protocol: AttestationProtocol,
        attestation_info: &[u8],
        client_key: &DhKeyPair,
        params: &EnclaveSessionParameters,
        custom_data: Option<&[u8]>,
        correlation: CorrelationId,
    ) -> Result<Arc<EnclaveSession>> {
        let provider = self.provider(protocol)?;
        let _guard = self.create_lock.lock().unwrap_or_else(|e| e.into_inner());

        // Returns an existing session without attesting; either way the
        // pending attempt for `correlation` is cleared and the gate released.
        let (session, _counter) = provider.create_enclave_session(
            attestation_info,
            client_key,
            params,
            custom_data,
            correlation,
        )?;
        Ok(session)
    }

    pub fn invalidate_enclave_session(
        &self,
        protocol: AttestationProtocol,
        params: &EnclaveSessionParameters,
        session: &Arc<EnclaveSession>,
    ) -> Result<()> {
        self.provider(protocol)?.invalidate_enclave_session(params, session);
        Ok(())
    }

    /// Build the encrypted key package for `query` under the cached session.
    ///
    /// Failure to obtain a session is reported as
    /// [`Error::RetryableEnclaveQueryExecution`] so the caller can re-attest
    /// and run the query again.
    pub fn generate_enclave_package(
        &self,
        protocol: AttestationProtocol,
        keys: &[ColumnEncryptionKeyEntry],
        query: Option<&str>,
        enclave_type: &str,
        params: &EnclaveSessionParameters,
        decryptor: &dyn ColumnKeyDecryptor,
    ) -> Result<EnclavePackage> {
        // A plain cache read: on a miss the caller re-attests through the
        // lock protocol, so this path must not take the gate itself.
        let lookup = self.provider(protocol).and_then(|provider| {
            match provider.core().cache().get(params) {
                (Some(session), counter) => Ok((session, counter)),
                (None, _) => Err(Error::SessionUnavailable),
            }
        });
        let (session, counter) = match lookup {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(
                    server = %params.server_name,
                    error = %e,
                    "no enclave session for query"
                );
                return Err(Error::RetryableEnclaveQueryExecution(Box::new(e)));
            }
        };

        build_enclave_package(
            session,
            counter,
            keys,
            query,
            enclave_type,
            &params.server_name,
            decryptor,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;

    struct NoFetch;

    impl HttpFetcher for NoFetch {
        fn get(&self, _url: &str) -> std::result::Result<Vec<u8>, FetchError> {
            Err(FetchError::Status(404))
        }
    }

    struct NoKeys;

    impl ColumnKeyDecryptor for NoKeys {
        fn decrypt(&self, _entry: &ColumnEncryptionKeyEntry, _server: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    fn delegate() -> EnclaveDelegate {
        EnclaveDelegate::with_fetcher(ProviderConfig::default(), Arc::new(NoFetch))
    }

    #[test]
    fn unspecified_protocol_is_rejected() {
        let err = delegate()
            .provider(AttestationProtocol::NotSpecified)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(ConfigError::ProtocolNotSpecified)));
    }

    #[test]
    fn providers_are_created_once() {
        let d = delegate();
        let a = d.provider(AttestationProtocol::Hgs).unwrap() as *const dyn AttestationProvider as *const ();
        let b = d.provider(AttestationProtocol::Hgs).unwrap() as *const dyn AttestationProvider as *const ();
        assert_eq!(a, b);
        assert_eq!(
            d.provider(AttestationProtocol::Aas).unwrap().protocol(),
            AttestationProtocol::Aas
        );
    }

    #[test]
    fn package_without_session_is_retryable() {
        let d = delegate();
        let params = EnclaveSessionParameters::new("srv", "https://hgs.example/Attestation", "db");
        let err = d
            .generate_enclave_package(
                AttestationProtocol::Hgs,
                &[],
                Some("SELECT 1"),
                "VBS",
                &params,
                &NoKeys,
            )
            .unwrap_err();
        assert!(err.is_retryable());
        match err {
            Error::RetryableEnclaveQueryExecution(inner) => {
                assert!(matches!(*inner, Error::SessionUnavailable))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn package_uses_cached_session() {
        let d = delegate();
        let params = EnclaveSessionParameters::new("srv", "https://hgs.example/Attestation", "db");
        d.provider(AttestationProtocol::Hgs)
            .unwrap()
            .core()
            .cache()
            .create(&params, vec![0x22; 32], 7);
        let pkg = d
            .generate_enclave_package(
                AttestationProtocol::Hgs,
                &[],
                Some("SELECT 1"),
                "VBS",
                &params,
                &NoKeys,
            )
            .unwrap();
        assert_eq!(pkg.session.session_id(), 7);
        assert_eq!(&pkg.enclave_package_bytes[..8], &7i64.to_le_bytes());
    }
}
