//! Software enclave and canned HTTP endpoints for tests.
//!
//! # Security Warning
//!
//! [`MockEnclave`] holds every private key it signs with in process memory
//! and must never stand in for a real enclave. Enable it only via
//! `features = ["mock"]` for development and testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::{Padding, Rsa};
use openssl::sign::{RsaPssSaltlen, Signer};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Builder, X509NameBuilder, X509};

use super::aas::xor_with_nonce;
use super::hgs::EnclavePolicy;
use super::http::HttpFetcher;
use super::models::{
    AasAttestationInfo, EnclaveDhInfo, EnclaveIdentity, EnclaveReport, EnclaveReportPackage,
    HgsAttestationInfo, NoneAttestationInfo,
};
use super::EnclaveType;
use crate::crypto::aead::AeadAes256CbcHmac256;
use crate::crypto::keys::{rsa_public_key_to_blob, DhKeyPair};
use crate::error::{CryptoError, FetchError, Result};
use crate::wire::Reader;

fn ossl(context: &'static str) -> impl FnOnce(ErrorStack) -> CryptoError {
    move |e| CryptoError::Openssl(format!("{context}: {e}"))
}

fn rsa_key() -> std::result::Result<PKey<Private>, CryptoError> {
    let rsa = Rsa::generate(2048).map_err(ossl("generate RSA key"))?;
    PKey::from_rsa(rsa).map_err(ossl("wrap RSA key"))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn certificate(
    common_name: &str,
    key: &PKey<Private>,
    issuer: Option<(&X509, &PKey<Private>)>,
) -> std::result::Result<X509, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial: openssl::asn1::Asn1Integer = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(365)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    match issuer {
        Some((issuer_cert, issuer_key)) => {
            builder.set_issuer_name(issuer_cert.subject_name())?;
            builder.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;
            builder.sign(issuer_key, MessageDigest::sha256())?;
        }
        None => {
            builder.set_issuer_name(&name)?;
            builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
            builder.append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .build()?,
            )?;
            builder.sign(key, MessageDigest::sha256())?;
        }
    }
    Ok(builder.build())
}

fn sign_sha256(
    key: &PKey<Private>,
    pss: bool,
    data: &[u8],
) -> std::result::Result<Vec<u8>, ErrorStack> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)?;
    if pss {
        signer.set_rsa_padding(Padding::PKCS1_PSS)?;
        signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
    }
    signer.update(data)?;
    signer.sign_to_vec()
}

/// Identity that satisfies the default [`EnclavePolicy`].
pub fn expected_identity() -> EnclaveIdentity {
    let policy = EnclavePolicy::default();
    EnclaveIdentity {
        owner_id: policy.owner_id,
        unique_id: [0x5A; 32],
        author_id: policy.author_id,
        family_id: policy.family_id,
        image_id: policy.image_id,
        enclave_svn: 2,
        secure_kernel_svn: 1,
        platform_svn: 1,
        flags: 0,
        signing_level: 0,
        reserved: 0,
    }
}

/// How [`MockEnclave::aas_attestation_info_with`] issues the attestation token.
#[derive(Debug, Clone)]
pub struct TokenProfile {
    /// Seconds from now until `exp`; negative for an expired token.
    pub lifetime_secs: i64,
    /// Seconds from now until `nbf`.
    pub not_before_secs: i64,
    /// Issuer other than the service instance.
    pub issuer: Option<String>,
    /// Key id other than the signing key's.
    pub kid: Option<String>,
    /// Algorithms other than RS256 sign with an HMAC secret.
    pub algorithm: Algorithm,
}

impl Default for TokenProfile {
    fn default() -> Self {
        Self {
            lifetime_secs: 600,
            not_before_secs: 0,
            issuer: None,
            kid: None,
            algorithm: Algorithm::RS256,
        }
    }
}

/// Software stand-in for the server's enclave and its attestation services.
///
/// Produces attestation info signed the way a real VBS or SGX enclave's
/// would be, and serves the matching HGS signing certificates and AAS token
/// keys through [`StaticFetcher`].
pub struct MockEnclave {
    root_cert: X509,
    health_key: PKey<Private>,
    health_cert: X509,
    identity_key: PKey<Private>,
    dh_key: DhKeyPair,
    token_key: PKey<Private>,
    token_kid: String,
    identity: EnclaveIdentity,
}

impl MockEnclave {
    pub fn new() -> Result<Self> {
        let root_key = rsa_key()?;
        let root_cert = certificate("Mock HGS Signing", &root_key, None)
            .map_err(ossl("build signing certificate"))?;
        let health_key = rsa_key()?;
        let health_cert = certificate("Mock Host Health", &health_key, Some((&root_cert, &root_key)))
            .map_err(ossl("build health certificate"))?;

        Ok(Self {
            root_cert,
            health_key,
            health_cert,
            identity_key: rsa_key()?,
            dh_key: DhKeyPair::generate()?,
            token_key: rsa_key()?,
            token_kid: "mock-1".into(),
            identity: expected_identity(),
        })
    }

    /// Report `identity` instead of the expected one.
    pub fn with_identity(mut self, identity: EnclaveIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Replace the health certificate with one no signing certificate vouches for.
    pub fn with_untrusted_host(mut self) -> Result<Self> {
        let rogue_key = rsa_key()?;
        let rogue_root = certificate("Rogue Signing", &rogue_key, None)
            .map_err(ossl("build rogue certificate"))?;
        self.health_cert = certificate("Mock Host Health", &self.health_key, Some((&rogue_root, &rogue_key)))
            .map_err(ossl("build health certificate"))?;
        Ok(self)
    }

    /// Start signing tokens with a new key.
    pub fn rotate_token_key(&mut self) -> Result<()> {
        self.token_key = rsa_key()?;
        self.token_kid = format!("{}-next", self.token_kid);
        Ok(())
    }

    fn identity_blob(&self) -> Result<Vec<u8>> {
        let rsa = self.identity_key.rsa().map_err(ossl("identity key"))?;
        Ok(rsa_public_key_to_blob(&rsa)?)
    }

    fn dh_info(&self) -> Result<EnclaveDhInfo> {
        let public_key = self.dh_key.public_blob()?;
        let public_key_signature =
            sign_sha256(&self.identity_key, false, &public_key).map_err(ossl("sign DH key"))?;
        Ok(EnclaveDhInfo {
            public_key,
            public_key_signature,
        })
    }

    /// Body of the HGS signing-certificate endpoint.
    pub fn signing_certificates_body(&self) -> Result<Vec<u8>> {
        let pem = self.root_cert.to_pem().map_err(ossl("encode signing certificate"))?;
        serde_json::to_vec(&pem)
            .map_err(|e| CryptoError::Openssl(format!("encode certificate body: {e}")).into())
    }

    /// Attestation info as returned by a VBS enclave attested through HGS.
    pub fn hgs_attestation_info(&self, session_id: i64) -> Result<Vec<u8>> {
        let report = EnclaveReport {
            report_size: EnclaveReport::SIZE as u32,
            report_version: 1,
            enclave_data: [0u8; 64],
            identity: self.identity.clone(),
        }
        .encode();
        let signature =
            sign_sha256(&self.health_key, true, &report).map_err(ossl("sign enclave report"))?;
        let package = EnclaveReportPackage::encode(&report, &signature)?;
        let health = self.health_cert.to_der().map_err(ossl("encode health certificate"))?;

        Ok(HgsAttestationInfo::encode(
            &self.identity_blob()?,
            &health,
            &package,
            session_id,
            &self.dh_info()?,
        )?)
    }

    /// Attestation info as returned when attestation is disabled.
    pub fn none_attestation_info(&self, session_id: i64) -> Result<Vec<u8>> {
        let info = NoneAttestationInfo {
            dh_info: self.dh_info()?,
            session_id,
        };
        Ok(info.encode()?)
    }

    /// Attestation info as returned by an enclave attested through AAS.
    ///
    /// The token expires `token_lifetime_secs` from now; a negative value
    /// issues an already expired token.
    pub fn aas_attestation_info(
        &self,
        attestation_url: &str,
        enclave_type: EnclaveType,
        nonce: &[u8],
        session_id: i64,
        token_lifetime_secs: i64,
    ) -> Result<Vec<u8>> {
        let profile = TokenProfile {
            lifetime_secs: token_lifetime_secs,
            ..TokenProfile::default()
        };
        self.aas_attestation_info_with(attestation_url, enclave_type, nonce, session_id, &profile)
    }

    /// Attestation info whose token is issued according to `profile`.
    pub fn aas_attestation_info_with(
        &self,
        attestation_url: &str,
        enclave_type: EnclaveType,
        nonce: &[u8],
        session_id: i64,
        profile: &TokenProfile,
    ) -> Result<Vec<u8>> {
        let identity = match enclave_type {
            EnclaveType::Sgx => xor_with_nonce(&self.identity_blob()?, nonce),
            _ => self.identity_blob()?,
        };

        let now = unix_now();
        let issuer = profile
            .issuer
            .clone()
            .unwrap_or_else(|| instance_url(attestation_url));
        let mut claims = serde_json::json!({
            "iss": issuer,
            "iat": now,
            "nbf": now + profile.not_before_secs,
            "exp": now + profile.lifetime_secs,
            "aas-ehd": URL_SAFE_NO_PAD.encode(&identity),
        });
        if enclave_type == EnclaveType::Vbs {
            claims["rp_data"] = URL_SAFE_NO_PAD.encode(nonce).into();
        }
        let token = self.sign_token(&claims, profile)?;

        Ok(AasAttestationInfo::encode(
            enclave_type,
            &identity,
            &format!("\"{token}\""),
            session_id,
            &self.dh_info()?,
        )?)
    }

    fn sign_token(&self, claims: &serde_json::Value, profile: &TokenProfile) -> Result<String> {
        let mut header = Header::new(profile.algorithm);
        header.kid = Some(profile.kid.clone().unwrap_or_else(|| self.token_kid.clone()));
        let key = match profile.algorithm {
            Algorithm::RS256 => {
                let rsa = self.token_key.rsa().map_err(ossl("token key"))?;
                let pem = rsa.private_key_to_pem().map_err(ossl("encode token key"))?;
                EncodingKey::from_rsa_pem(&pem)
                    .map_err(|e| CryptoError::Openssl(format!("load token key: {e}")))?
            }
            _ => EncodingKey::from_secret(self.token_kid.as_bytes()),
        };
        encode(&header, claims, &key)
            .map_err(|e| CryptoError::Openssl(format!("sign token: {e}")).into())
    }

    /// OpenID metadata and JWKS for the service behind `attestation_url`.
    pub fn token_endpoints(&self, attestation_url: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let instance = instance_url(attestation_url);
        let jwks_uri = format!("{instance}/certs");
        let metadata = serde_json::json!({"issuer": instance, "jwks_uri": jwks_uri});

        let rsa = self.token_key.rsa().map_err(ossl("token key"))?;
        let jwks = serde_json::json!({"keys": [{
            "kty": "RSA",
            "kid": self.token_kid,
            "n": URL_SAFE_NO_PAD.encode(rsa.n().to_vec()),
            "e": URL_SAFE_NO_PAD.encode(rsa.e().to_vec()),
        }]});

        Ok(vec![
            (
                format!("{instance}/.well-known/openid-configuration"),
                metadata.to_string().into_bytes(),
            ),
            (jwks_uri, jwks.to_string().into_bytes()),
        ])
    }

    /// Fetcher serving this enclave's HGS certificates and AAS token keys.
    pub fn fetcher(&self, attestation_url: &str) -> Result<StaticFetcher> {
        let fetcher = StaticFetcher::new();
        self.publish(&fetcher, attestation_url)?;
        Ok(fetcher)
    }

    /// (Re)publish the current certificates and keys on `fetcher`.
    pub fn publish(&self, fetcher: &StaticFetcher, attestation_url: &str) -> Result<()> {
        fetcher.insert(
            format!(
                "{}/v2.0/signingCertificates",
                attestation_url.trim_end_matches('/')
            ),
            self.signing_certificates_body()?,
        );
        for (url, body) in self.token_endpoints(attestation_url)? {
            fetcher.insert(url, body);
        }
        Ok(())
    }

    /// Session key the enclave derives for a client DH public key.
    pub fn session_key(&self, client_public_blob: &[u8]) -> Result<Vec<u8>> {
        Ok(self.dh_key.derive_key_from_hash(client_public_blob)?)
    }
}

fn instance_url(attestation_url: &str) -> String {
    url::Url::parse(attestation_url)
        .map(|u| u.origin().ascii_serialization())
        .unwrap_or_else(|_| attestation_url.to_string())
}

/// Split an enclave package into its session id and decrypted key package.
pub fn open_enclave_package(session_key: &[u8], envelope: &[u8]) -> Result<(i64, Vec<u8>)> {
    let mut r = Reader::new(envelope);
    let session_id = r.read_i64("sessionId")?;
    let plaintext = AeadAes256CbcHmac256::new(session_key)?.decrypt(r.rest())?;
    Ok((session_id, plaintext))
}

/// [`HttpFetcher`] answering from a URL map. Unknown URLs get a 404.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    responses: Mutex<HashMap<String, Vec<u8>>>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, body: Vec<u8>) {
        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        responses.insert(url.into(), body);
    }

    /// Number of requests served or refused so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HttpFetcher for StaticFetcher {
    fn get(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        responses.get(url).cloned().ok_or(FetchError::Status(404))
    }
}

/// [`HttpFetcher`] that fails every request, numbering its failures.
#[derive(Debug, Default)]
pub struct FailingFetcher {
    calls: AtomicUsize,
}

impl FailingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HttpFetcher for FailingFetcher {
    fn get(&self, _url: &str) -> std::result::Result<Vec<u8>, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(FetchError::Transport(format!("connection refused (attempt {n})")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://hgs.example/Attestation";

    #[test]
    fn hgs_info_parses() {
        let enclave = MockEnclave::new().unwrap();
        let info = HgsAttestationInfo::parse(&enclave.hgs_attestation_info(11).unwrap()).unwrap();
        assert_eq!(info.session_id, 11);
        assert_eq!(info.report_package.report.identity, expected_identity());
        assert!(info.report_package.is_well_formed());
    }

    #[test]
    fn fetcher_serves_published_urls() {
        let enclave = MockEnclave::new().unwrap();
        let fetcher = enclave.fetcher(URL).unwrap();
        assert!(fetcher
            .get("https://hgs.example/Attestation/v2.0/signingCertificates")
            .is_ok());
        assert!(fetcher
            .get("https://hgs.example/.well-known/openid-configuration")
            .is_ok());
        assert!(matches!(
            fetcher.get("https://other.example"),
            Err(FetchError::Status(404))
        ));
        assert_eq!(fetcher.calls(), 3);
    }

    #[test]
    fn failing_fetcher_counts() {
        let f = FailingFetcher::new();
        let err = f.get("x").unwrap_err();
        assert!(err.to_string().contains("attempt 1"));
        assert_eq!(f.calls(), 1);
    }
}
