//! Azure Attestation Service attestation of VBS and SGX enclaves.
//!
//! The server forwards the client's attestation URL and nonce to the
//! service and returns the signed token it received. The client checks the
//! token against the service's published signing keys and binds it to the
//! enclave identity key and the nonce.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use url::Url;

use super::http::HttpFetcher;
use super::jwt::{
    validate_claim, verify_token, JwkSet, OpenIdConfiguration, SigningKey, TokenRejection,
    VerifiedToken,
};
use super::models::AasAttestationInfo;
use super::{AttestationProtocol, AttestationProvider, EnclaveType, ProviderConfig, ProviderCore, VerifiedEvidence};
use crate::error::{AttestError, Result};
use crate::session::EnclaveSessionParameters;
use crate::wire::{put_len_prefixed, utf16le};

const OPENID_CONFIGURATION_PATH: &str = "/.well-known/openid-configuration";

/// How long token signing keys are reused.
pub const SIGNING_KEY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Attestation through the Azure Attestation Service.
pub struct AasProvider {
    core: ProviderCore,
    fetcher: Arc<dyn HttpFetcher>,
    signing_key_retry_delay: Duration,
    signing_keys: Mutex<HashMap<String, (Vec<SigningKey>, Instant)>>,
}

impl AasProvider {
    pub fn new(config: &ProviderConfig, fetcher: Arc<dyn HttpFetcher>) -> Self {
        Self {
            core: ProviderCore::new(config.lock_timeout),
            fetcher,
            signing_key_retry_delay: config.signing_key_retry_delay,
            signing_keys: Mutex::new(HashMap::new()),
        }
    }

    /// Provider fetching over HTTPS with [`super::http::UreqFetcher`].
    #[cfg(feature = "http")]
    pub fn with_default_fetcher(config: &ProviderConfig) -> Self {
        Self::new(config, Arc::new(super::http::UreqFetcher::new()))
    }

    /// Token signing keys of the service instance serving `attestation_url`.
    pub fn signing_keys(&self, attestation_url: &str, force_refresh: bool) -> Result<Vec<SigningKey>> {
        let instance = instance_url(attestation_url)?;
        if !force_refresh {
            let cache = self.signing_keys.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((keys, fetched_at)) = cache.get(&instance) {
                if fetched_at.elapsed() < SIGNING_KEY_TTL {
                    return Ok(keys.clone());
                }
            }
        }

        let keys = self.download_signing_keys(attestation_url).map_err(|e| {
            AttestError::VerificationFailed(format!(
                "failed to get the attestation token signing keys: {e}"
            ))
        })?;
        tracing::debug!(
            instance = %instance,
            count = keys.len(),
            force_refresh,
            "fetched attestation token signing keys"
        );

        let mut cache = self.signing_keys.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(instance, (keys.clone(), Instant::now()));
        Ok(keys)
    }

    fn download_signing_keys(&self, attestation_url: &str) -> Result<Vec<SigningKey>> {
        let metadata_url = self.build_attestation_url(attestation_url)?;
        let metadata = self.fetch_bytes(&metadata_url)?;
        let metadata: OpenIdConfiguration = serde_json::from_slice(&metadata).map_err(|e| {
            AttestError::VerificationFailed(format!("invalid OpenID configuration: {e}"))
        })?;

        let jwks = self.fetch_bytes(&metadata.jwks_uri)?;
        let jwks: JwkSet = serde_json::from_slice(&jwks)
            .map_err(|e| AttestError::VerificationFailed(format!("invalid JWKS: {e}")))?;
        let keys = jwks.signing_keys();
        if keys.is_empty() {
            return Err(AttestError::VerificationFailed(format!(
                "no usable RSA keys at '{}'",
                metadata.jwks_uri
            ))
            .into());
        }
        Ok(keys)
    }

    /// Verify the token against the service's signing keys, refreshing
    /// them once if no key vouches for the token or its issuer.
    fn check_token(&self, attestation_url: &str, token: &str) -> Result<VerifiedToken> {
        let issuers = valid_issuers(attestation_url)?;

        let mut force_refresh = false;
        loop {
            let keys = self.signing_keys(attestation_url, force_refresh)?;
            let reason = match verify_token(token, &keys, &issuers) {
                Ok(verified) => return Ok(verified),
                Err(TokenRejection::Invalid(e)) => return Err(e.into()),
                Err(TokenRejection::UntrustedSigner(reason)) => reason,
            };
            if force_refresh {
                return Err(AttestError::VerificationFailed(format!(
                    "attestation token signature validation failed: {reason}"
                ))
                .into());
            }
            tracing::warn!(
                reason = %reason,
                delay_ms = self.signing_key_retry_delay.as_millis() as u64,
                "attestation token failed validation, refreshing signing keys"
            );
            std::thread::sleep(self.signing_key_retry_delay);
            force_refresh = true;
        }
    }
}

impl AttestationProvider for AasProvider {
    fn protocol(&self) -> AttestationProtocol {
        AttestationProtocol::Aas
    }

    fn core(&self) -> &ProviderCore {
        &self.core
    }

    fn uses_nonce(&self) -> bool {
        true
    }

    fn build_attestation_url(&self, attestation_url: &str) -> Result<String> {
        Ok(format!("{}{OPENID_CONFIGURATION_PATH}", instance_url(attestation_url)?))
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.fetcher.get(url).map_err(|e| {
            AttestError::FetchFailed {
                url: url.to_string(),
                attempts: 1,
                message: e.to_string(),
            }
            .into()
        })
    }

    /// `u32 urlLen | UTF-16LE(url + NUL) | u32 nonceLen | nonce`.
    fn protocol_input(&self, attestation_url: &str, nonce: Option<&[u8]>) -> Result<Vec<u8>> {
        let nonce = nonce.filter(|n| !n.is_empty());
        let (false, Some(nonce)) = (attestation_url.is_empty(), nonce) else {
            return Err(AttestError::SessionCreation(
                "attestation URL and nonce are required".into(),
            )
            .into());
        };
        let url = utf16le(&format!("{attestation_url}\0"));
        let mut buf = BytesMut::with_capacity(8 + url.len() + nonce.len());
        put_len_prefixed(&mut buf, "attestationUrlLength", &url, "AAS")?;
        put_len_prefixed(&mut buf, "nonceLength", nonce, "AAS")?;
        Ok(buf.to_vec())
    }

    fn verify_evidence(
        &self,
        attestation_info: &[u8],
        params: &EnclaveSessionParameters,
        nonce: Option<&[u8]>,
    ) -> Result<VerifiedEvidence> {
        let nonce = nonce.filter(|n| !n.is_empty()).ok_or_else(|| {
            AttestError::SessionCreation("no nonce was recorded for this attestation".into())
        })?;
        let info = AasAttestationInfo::parse(attestation_info)?;

        let token = self.check_token(&params.attestation_url, &info.attestation_token)?;
        validate_claim(&token, "aas-ehd", &info.identity)?;
        if info.enclave_type == EnclaveType::Vbs {
            validate_claim(&token, "rp_data", nonce)?;
        }

        // SGX tokens carry no nonce; the server masks the identity key with it instead.
        let identity_key = match info.enclave_type {
            EnclaveType::Sgx => xor_with_nonce(&info.identity, nonce),
            _ => info.identity,
        };

        Ok(VerifiedEvidence {
            session_id: info.session_id,
            identity_key,
            dh_info: info.dh_info,
        })
    }
}

/// `scheme://host[:port]` of the attestation URL.
fn instance_url(attestation_url: &str) -> Result<String> {
    let url = Url::parse(attestation_url).map_err(|e| {
        AttestError::VerificationFailed(format!("invalid attestation URL '{attestation_url}': {e}"))
    })?;
    Ok(url.origin().ascii_serialization())
}

/// Issuers accepted for tokens from `attestation_url`: the instance URL,
/// plus the same with an explicit port when the URL uses the default one.
pub fn valid_issuers(attestation_url: &str) -> Result<Vec<String>> {
    let instance = instance_url(attestation_url)?;
    let url = Url::parse(attestation_url).map_err(|e| {
        AttestError::VerificationFailed(format!("invalid attestation URL '{attestation_url}': {e}"))
    })?;
    let mut issuers = vec![instance.clone()];
    if url.port().is_none() {
        if let Some(port) = url.port_or_known_default() {
            issuers.push(format!("{instance}:{port}"));
        }
    }
    Ok(issuers)
}

/// XOR `data` with `nonce` repeated cyclically.
pub fn xor_with_nonce(data: &[u8], nonce: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(nonce.iter().cycle())
        .map(|(d, n)| d ^ n)
        .collect()
}
