//! Enclave sessions without attestation.
//!
//! The server returns only the enclave's DH key and the session id. No
//! service vouches for the enclave, so its key is used as sent and the
//! session is only as trustworthy as the server itself. Session caching and
//! the acquisition gate work as for the attested protocols.

use super::models::NoneAttestationInfo;
use super::{AttestationProtocol, AttestationProvider, ProviderConfig, ProviderCore, VerifiedEvidence};
use crate::crypto::keys::DhKeyPair;
use crate::error::{AttestError, Result};
use crate::session::EnclaveSessionParameters;

/// Sessions with an enclave that is not attested.
#[derive(Debug)]
pub struct NoneProvider {
    core: ProviderCore,
}

impl NoneProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            core: ProviderCore::new(config.lock_timeout),
        }
    }
}

impl AttestationProvider for NoneProvider {
    fn protocol(&self) -> AttestationProtocol {
        AttestationProtocol::None
    }

    fn core(&self) -> &ProviderCore {
        &self.core
    }

    fn uses_nonce(&self) -> bool {
        false
    }

    fn requires_attestation_url(&self) -> bool {
        false
    }

    fn build_attestation_url(&self, attestation_url: &str) -> Result<String> {
        Ok(attestation_url.to_string())
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        Err(AttestError::FetchFailed {
            url: url.to_string(),
            attempts: 0,
            message: "no verification material is fetched without attestation".into(),
        }
        .into())
    }

    fn protocol_input(&self, _attestation_url: &str, _nonce: Option<&[u8]>) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn verify_evidence(
        &self,
        attestation_info: &[u8],
        _params: &EnclaveSessionParameters,
        _nonce: Option<&[u8]>,
    ) -> Result<VerifiedEvidence> {
        let info = NoneAttestationInfo::parse(attestation_info)?;
        Ok(VerifiedEvidence {
            session_id: info.session_id,
            identity_key: Vec::new(),
            dh_info: info.dh_info,
        })
    }

    /// ECDH with the enclave key as sent; there is no identity key to
    /// check its signature against.
    fn derive_session_key(&self, evidence: &VerifiedEvidence, client_key: &DhKeyPair) -> Result<Vec<u8>> {
        Ok(client_key.derive_key_from_hash(&evidence.dh_info.public_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::models::EnclaveDhInfo;
    use crate::session::CorrelationId;

    fn provider() -> NoneProvider {
        NoneProvider::new(&ProviderConfig::default())
    }

    #[test]
    fn parameters_carry_no_input() {
        let request = provider()
            .get_attestation_parameters(CorrelationId::new(), "", None)
            .unwrap();
        assert_eq!(request.parameters.protocol_id, 2);
        assert!(request.parameters.protocol_input.is_empty());
        assert_eq!(request.parameters.client_dh_public_key.len(), 104);
    }

    #[test]
    fn lookups_never_generate_a_nonce() {
        let p = provider();
        let params = EnclaveSessionParameters::new("srv", "", "db");
        let lookup = p.get_enclave_session(&params, CorrelationId::new(), true);
        assert!(lookup.session.is_none());
        assert!(lookup.custom_data.is_none());
    }

    #[test]
    fn malformed_info_caches_nothing() {
        let p = provider();
        let params = EnclaveSessionParameters::new("srv", "", "db");
        let correlation = CorrelationId::new();
        p.get_enclave_session(&params, correlation, false);
        let client_key = DhKeyPair::generate().unwrap();
        let info = NoneAttestationInfo {
            dh_info: EnclaveDhInfo {
                public_key: vec![0xAB; 104],
                public_key_signature: Vec::new(),
            },
            session_id: 1,
        }
        .encode()
        .unwrap();

        assert!(p
            .create_enclave_session(&info[..10], &client_key, &params, None, correlation)
            .is_err());
        // Not a valid P-384 point.
        assert!(p
            .create_enclave_session(&info, &client_key, &params, None, correlation)
            .is_err());
        assert!(p.core().cache().get(&params).0.is_none());
        assert!(p.core().gate().is_lock_acquired());
    }
}
