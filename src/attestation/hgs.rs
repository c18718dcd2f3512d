//! Host Guardian Service attestation of VBS enclaves.
//!
//! The server returns the host's health certificate, the enclave's signed
//! report and the enclave's DH key. The client checks the report against
//! the expected enclave identity, chains the health certificate to HGS's
//! signing certificates, and checks the report signature with the health
//! certificate key.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use openssl::asn1::Asn1Time;
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{X509StoreContext, X509};

use super::http::HttpFetcher;
use super::models::{EnclaveIdentity, EnclaveReportPackage, HgsAttestationInfo};
use super::{AttestationProtocol, AttestationProvider, ProviderConfig, ProviderCore, VerifiedEvidence};
use crate::crypto::keys::{verify_rsa_sha256, RsaSignaturePadding};
use crate::error::{AttestError, Result};
use crate::session::retry::{with_retry, RetryPolicy};
use crate::session::EnclaveSessionParameters;

const SIGNING_CERTIFICATES_PATH: &str = "/v2.0/signingCertificates";

/// How long fetched signing certificates are reused.
pub const SIGNING_CERTIFICATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Identity the SQL Server VBS enclave must report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclavePolicy {
    pub owner_id: [u8; 32],
    pub author_id: [u8; 32],
    pub family_id: [u8; 16],
    pub image_id: [u8; 16],
    pub min_enclave_svn: u32,
    pub min_secure_kernel_svn: u32,
    pub min_platform_svn: u32,
    /// Required enclave flags; any other value means the enclave is debuggable.
    pub flags: u32,
}

impl Default for EnclavePolicy {
    fn default() -> Self {
        let mut owner_id = [0u8; 32];
        owner_id[..8].copy_from_slice(&[0x10, 0x20, 0x30, 0x40, 0x41, 0x31, 0x21, 0x11]);
        let mut family_id = [0u8; 16];
        family_id[..2].copy_from_slice(&[0xFE, 0xFE]);
        Self {
            owner_id,
            author_id: [
                0x04, 0x37, 0xCA, 0xE2, 0x53, 0x7D, 0x8B, 0x9B, 0x07, 0x76, 0xB6, 0x1B, 0x11,
                0xE6, 0xCE, 0xD3, 0xD2, 0x32, 0xE9, 0x30, 0x8F, 0x60, 0xE2, 0x1A, 0xDA, 0xB2,
                0xFD, 0x91, 0xE3, 0xDA, 0x95, 0x98,
            ],
            family_id,
            image_id: [
                0x19, 0x17, 0x12, 0x00, 0x01, 0x05, 0x20, 0x13, 0x00, 0x05, 0x14, 0x03, 0x12,
                0x01, 0x22, 0x05,
            ],
            min_enclave_svn: 0,
            min_secure_kernel_svn: 0,
            min_platform_svn: 1,
            flags: 0,
        }
    }
}

impl EnclavePolicy {
    /// Check a reported identity. `UniqueId` is not pinned.
    pub fn verify(&self, identity: &EnclaveIdentity) -> std::result::Result<(), AttestError> {
        check_bytes("OwnerId", &identity.owner_id, &self.owner_id)?;
        check_bytes("AuthorId", &identity.author_id, &self.author_id)?;
        check_bytes("FamilyId", &identity.family_id, &self.family_id)?;
        check_bytes("ImageId", &identity.image_id, &self.image_id)?;
        check_min("EnclaveSvn", identity.enclave_svn, self.min_enclave_svn)?;
        check_min("SecureKernelSvn", identity.secure_kernel_svn, self.min_secure_kernel_svn)?;
        check_min("PlatformSvn", identity.platform_svn, self.min_platform_svn)?;
        if identity.flags != self.flags {
            return Err(AttestError::DebuggableEnclave);
        }
        Ok(())
    }
}

fn check_bytes(property: &'static str, actual: &[u8], expected: &[u8]) -> std::result::Result<(), AttestError> {
    if actual != expected {
        return Err(AttestError::PolicyMismatch {
            property,
            actual: hex::encode_upper(actual),
            expected: hex::encode_upper(expected),
        });
    }
    Ok(())
}

fn check_min(property: &'static str, actual: u32, expected: u32) -> std::result::Result<(), AttestError> {
    if actual < expected {
        return Err(AttestError::PolicyMismatch {
            property,
            actual: actual.to_string(),
            expected: expected.to_string(),
        });
    }
    Ok(())
}

struct CachedCertificates {
    certificates: Vec<X509>,
    fetched_at: Instant,
}

impl CachedCertificates {
    fn is_fresh(&self) -> bool {
        if self.fetched_at.elapsed() >= SIGNING_CERTIFICATE_TTL {
            return false;
        }
        let Ok(now) = Asn1Time::days_from_now(0) else {
            return false;
        };
        self.certificates.iter().all(|c| {
            c.not_after()
                .compare(&now)
                .is_ok_and(|order| order == Ordering::Greater)
        })
    }
}

/// Attestation through the Host Guardian Service.
pub struct HgsProvider {
    core: ProviderCore,
    fetcher: Arc<dyn HttpFetcher>,
    retry: RetryPolicy,
    policy: EnclavePolicy,
    certificates: Mutex<HashMap<String, CachedCertificates>>,
}

impl HgsProvider {
    pub fn new(config: &ProviderConfig, fetcher: Arc<dyn HttpFetcher>) -> Self {
        Self {
            core: ProviderCore::new(config.lock_timeout),
            fetcher,
            retry: config.retry_policy(),
            policy: EnclavePolicy::default(),
            certificates: Mutex::new(HashMap::new()),
        }
    }

    /// Provider fetching over HTTPS with [`super::http::UreqFetcher`].
    #[cfg(feature = "http")]
    pub fn with_default_fetcher(config: &ProviderConfig) -> Self {
        Self::new(config, Arc::new(super::http::UreqFetcher::new()))
    }

    /// Replace the expected enclave identity.
    pub fn with_policy(mut self, policy: EnclavePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Signing certificates for `attestation_url`, from cache when fresh.
    pub fn signing_certificates(&self, attestation_url: &str, force_refresh: bool) -> Result<Vec<X509>> {
        let url = self.build_attestation_url(attestation_url)?;
        if !force_refresh {
            let cache = self.certificates.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(&url).filter(|c| c.is_fresh()) {
                return Ok(cached.certificates.clone());
            }
        }

        let body = self.fetch_bytes(&url)?;
        let certificates = parse_signing_certificates(&body).map_err(|e| {
            AttestError::VerificationFailed(format!(
                "invalid signing certificate returned by '{url}': {e}"
            ))
        })?;
        tracing::debug!(
            url = %url,
            count = certificates.len(),
            force_refresh,
            "fetched attestation signing certificates"
        );

        let mut cache = self.certificates.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            url,
            CachedCertificates {
                certificates: certificates.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(certificates)
    }

    /// Chain the health certificate to a signing certificate, refetching
    /// the signing certificates once if the first check fails.
    fn verify_health_certificate(&self, attestation_url: &str, health_cert: &X509) -> Result<()> {
        let certificates = self.signing_certificates(attestation_url, false)?;
        if let Err(first) = verify_chain(&certificates, health_cert) {
            tracing::debug!(error = %first, "health certificate chain failed, refreshing signing certificates");
            let certificates = self.signing_certificates(attestation_url, true)?;
            verify_chain(&certificates, health_cert).map_err(|status| {
                AttestError::VerificationFailed(format!(
                    "failed to check the health certificate against the signing certificates from '{attestation_url}': {status}"
                ))
            })?;
        }
        Ok(())
    }
}

impl AttestationProvider for HgsProvider {
    fn protocol(&self) -> AttestationProtocol {
        AttestationProtocol::Hgs
    }

    fn core(&self) -> &ProviderCore {
        &self.core
    }

    fn uses_nonce(&self) -> bool {
        false
    }

    fn build_attestation_url(&self, attestation_url: &str) -> Result<String> {
        Ok(format!(
            "{}{SIGNING_CERTIFICATES_PATH}",
            attestation_url.trim_end_matches('/')
        ))
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        with_retry(&self.retry, || self.fetcher.get(url)).map_err(|e| {
            AttestError::FetchFailed {
                url: url.to_string(),
                attempts: self.retry.attempts(),
                message: e.to_string(),
            }
            .into()
        })
    }

    fn protocol_input(&self, _attestation_url: &str, _nonce: Option<&[u8]>) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn verify_evidence(
        &self,
        attestation_info: &[u8],
        params: &EnclaveSessionParameters,
        _nonce: Option<&[u8]>,
    ) -> Result<VerifiedEvidence> {
        let info = HgsAttestationInfo::parse(attestation_info)?;

        self.policy.verify(&info.report_package.report.identity)?;

        let health_cert = X509::from_der(&info.health_report).map_err(|e| {
            AttestError::MalformedInfo(format!("failed to parse health certificate: {e}"))
        })?;
        self.verify_health_certificate(&params.attestation_url, &health_cert)?;
        verify_report_signature(&info.report_package, &health_cert)?;

        Ok(VerifiedEvidence {
            session_id: info.session_id,
            identity_key: info.identity,
            dh_info: info.dh_info,
        })
    }
}

/// Decode the signing-certificate response: a JSON array of byte values
/// holding PEM or DER certificate data.
pub fn parse_signing_certificates(body: &[u8]) -> std::result::Result<Vec<X509>, String> {
    let data: Vec<u8> =
        serde_json::from_slice(body).map_err(|e| format!("response is not a JSON byte array: {e}"))?;

    let certificates = if data.starts_with(b"-----BEGIN") {
        X509::stack_from_pem(&data).map_err(|e| format!("PEM: {e}"))?
    } else {
        vec![X509::from_der(&data).map_err(|e| format!("DER: {e}"))?]
    };
    if certificates.is_empty() {
        return Err("no certificates in response".into());
    }
    Ok(certificates)
}

/// Build a chain from `leaf` to any of `anchors`.
///
/// Anchors need not be self-signed; a chain ending at any of them is
/// trusted. Revocation is not checked.
fn verify_chain(anchors: &[X509], leaf: &X509) -> std::result::Result<(), String> {
    let mut store_builder =
        X509StoreBuilder::new().map_err(|e| format!("failed to create X509 store: {e}"))?;
    for anchor in anchors {
        store_builder
            .add_cert(anchor.clone())
            .map_err(|e| format!("failed to add signing certificate to store: {e}"))?;
    }
    store_builder
        .set_flags(X509VerifyFlags::PARTIAL_CHAIN)
        .map_err(|e| format!("failed to set verify flags: {e}"))?;
    let store: X509Store = store_builder.build();

    let chain = Stack::new().map_err(|e| format!("failed to create cert stack: {e}"))?;
    let mut ctx =
        X509StoreContext::new().map_err(|e| format!("failed to create store context: {e}"))?;
    let outcome = ctx
        .init(&store, leaf, &chain, |ctx| {
            let ok = ctx.verify_cert()?;
            Ok((ok, ctx.error().error_string().to_string()))
        })
        .map_err(|e| format!("certificate chain verification error: {e}"))?;

    match outcome {
        (true, _) => Ok(()),
        (false, status) => Err(status),
    }
}

fn verify_report_signature(package: &EnclaveReportPackage, health_cert: &X509) -> Result<()> {
    if !package.is_well_formed() {
        return Err(AttestError::VerificationFailed(
            "enclave report package is not formatted correctly".into(),
        )
        .into());
    }
    let key = health_cert.public_key().map_err(|e| {
        AttestError::VerificationFailed(format!("failed to extract health certificate key: {e}"))
    })?;
    let valid = verify_rsa_sha256(
        &key,
        RsaSignaturePadding::Pss,
        &package.report_bytes,
        &package.signature,
    )?;
    if !valid {
        return Err(AttestError::VerificationFailed(
            "enclave report signature does not verify against the health certificate".into(),
        )
        .into());
    }
    Ok(())
}
