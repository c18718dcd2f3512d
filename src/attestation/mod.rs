pub mod aas;
pub mod hgs;
pub mod http;
pub mod jwt;
pub mod models;
pub mod none;

#[cfg(feature = "mock")]
pub mod mock;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use openssl::pkey::PKey;
use rand::RngCore;

use crate::crypto::keys::{rsa_public_blob_to_key, verify_rsa_sha256, DhKeyPair, RsaSignaturePadding};
use crate::error::{AttestError, ConfigError, CryptoError, Error, Result, WireError};
use crate::session::cache::SessionCache;
use crate::session::gate::{SessionGate, DEFAULT_LOCK_TIMEOUT};
use crate::session::retry::RetryPolicy;
use crate::session::scratch::{AttestationInfoItem, ScratchStore};
use crate::session::{CorrelationId, EnclaveSession, EnclaveSessionParameters, SessionLookup};
use crate::wire::{put_len_prefixed, to_u32_field, Reader};
use models::EnclaveDhInfo;

/// Size of the random nonce bound into an attestation attempt.
pub const NONCE_LEN: usize = 256;

/// Which attestation service vouches for the enclave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttestationProtocol {
    NotSpecified,
    /// Azure Attestation Service.
    Aas,
    /// No attestation: the enclave's DH key is used without any service
    /// vouching for it.
    None,
    /// Host Guardian Service.
    Hgs,
}

impl AttestationProtocol {
    /// Protocol id carried in the attestation parameters.
    pub fn id(self) -> i32 {
        match self {
            AttestationProtocol::NotSpecified => 0,
            AttestationProtocol::Aas => 1,
            AttestationProtocol::None => 2,
            AttestationProtocol::Hgs => 3,
        }
    }
}

impl FromStr for AttestationProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "notspecified" => Ok(AttestationProtocol::NotSpecified),
            "aas" => Ok(AttestationProtocol::Aas),
            "none" => Ok(AttestationProtocol::None),
            "hgs" => Ok(AttestationProtocol::Hgs),
            _ => Err(ConfigError::UnknownProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for AttestationProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttestationProtocol::NotSpecified => "NotSpecified",
            AttestationProtocol::Aas => "AAS",
            AttestationProtocol::None => "None",
            AttestationProtocol::Hgs => "HGS",
        })
    }
}

/// Kind of enclave technology reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EnclaveType {
    None = 0,
    Vbs = 1,
    Sgx = 2,
}

impl EnclaveType {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(EnclaveType::None),
            1 => Some(EnclaveType::Vbs),
            2 => Some(EnclaveType::Sgx),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnclaveType::None => "NONE",
            EnclaveType::Vbs => "VBS",
            EnclaveType::Sgx => "SGX",
        }
    }
}

impl fmt::Display for EnclaveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the client sends the server to request attestation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationParameters {
    pub protocol_id: i32,
    pub protocol_input: Vec<u8>,
    /// Client ECDH public key as a `BCRYPT_ECCKEY_BLOB`.
    pub client_dh_public_key: Vec<u8>,
}

impl AttestationParameters {
    /// `u32 protocolId | u32 inputLen | input | u32 dhLen | dhKey`.
    ///
    /// `enclave_type` only names the enclave in conversion errors.
    pub fn serialize(&self, enclave_type: &str) -> std::result::Result<Vec<u8>, WireError> {
        let mut buf = BytesMut::with_capacity(
            12 + self.protocol_input.len() + self.client_dh_public_key.len(),
        );
        buf.put_u32_le(to_u32_field("protocolId", self.protocol_id as i64, enclave_type)?);
        put_len_prefixed(&mut buf, "protocolInputLength", &self.protocol_input, enclave_type)?;
        put_len_prefixed(
            &mut buf,
            "clientDHPublicKeyLength",
            &self.client_dh_public_key,
            enclave_type,
        )?;
        Ok(buf.to_vec())
    }

    pub fn deserialize(buf: &[u8]) -> std::result::Result<Self, WireError> {
        let mut r = Reader::new(buf);
        let protocol_id = r.read_i32("protocolId")?;
        let protocol_input = r.read_len_prefixed("protocolInput")?.to_vec();
        let client_dh_public_key = r.read_len_prefixed("clientDHPublicKey")?.to_vec();
        r.finish("attestation parameters")?;
        Ok(Self {
            protocol_id,
            protocol_input,
            client_dh_public_key,
        })
    }
}

/// Attestation parameters together with the private half of the client key.
#[derive(Debug)]
pub struct AttestationRequest {
    pub parameters: AttestationParameters,
    pub client_key: DhKeyPair,
}

/// Evidence that passed verification, ready for key derivation.
#[derive(Debug, Clone)]
pub struct VerifiedEvidence {
    pub session_id: i64,
    /// Enclave identity key as a `BCRYPT_RSAKEY_BLOB`, unmasked.
    pub identity_key: Vec<u8>,
    pub dh_info: EnclaveDhInfo,
}

/// Configuration applied to every attestation provider.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ProviderConfig {
    /// Retries after the first signing-certificate request (default: 0).
    pub max_num_retries: u32,

    /// Pause between signing-certificate requests (default: 3s).
    pub retry_sleep: Duration,

    /// Bound on waiting for another caller's attestation (default: 15s).
    pub lock_timeout: Duration,

    /// Pause before refreshing token signing keys after a signature
    /// mismatch (default: 3s).
    pub signing_key_retry_delay: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            max_num_retries: 0,
            retry_sleep: Duration::from_secs(3),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            signing_key_retry_delay: Duration::from_secs(3),
        }
    }
}

impl ProviderConfig {
    pub fn builder() -> ProviderConfigBuilder {
        ProviderConfigBuilder::default()
    }

    /// Retry policy for signing-certificate requests.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_num_retries,
            delay: self.retry_sleep,
        }
    }
}

/// Builder for [`ProviderConfig`].
#[derive(Debug, Clone)]
pub struct ProviderConfigBuilder {
    config: ProviderConfig,
    retry_sleep_secs: Option<i64>,
}

impl Default for ProviderConfigBuilder {
    fn default() -> Self {
        Self {
            config: ProviderConfig::default(),
            retry_sleep_secs: None,
        }
    }
}

impl ProviderConfigBuilder {
    pub fn max_num_retries(mut self, retries: u32) -> Self {
        self.config.max_num_retries = retries;
        self
    }

    /// Pause between attempts in whole seconds; must be at least 1.
    pub fn enclave_retry_sleep_secs(mut self, secs: i64) -> Self {
        self.retry_sleep_secs = Some(secs);
        self
    }

    pub fn retry_sleep(mut self, sleep: Duration) -> Self {
        self.config.retry_sleep = sleep;
        self.retry_sleep_secs = None;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn signing_key_retry_delay(mut self, delay: Duration) -> Self {
        self.config.signing_key_retry_delay = delay;
        self
    }

    /// Build the `ProviderConfig`, validating the retry settings.
    pub fn build(self) -> std::result::Result<ProviderConfig, ConfigError> {
        let mut config = self.config;
        if let Some(secs) = self.retry_sleep_secs {
            if secs < 1 {
                return Err(ConfigError::Invalid(format!(
                    "enclave retry sleep must be at least 1 second, got {secs}"
                )));
            }
            config.retry_sleep = Duration::from_secs(secs as u64);
        }
        Ok(config)
    }
}

/// State shared by every thread using one provider: the session cache,
/// the attestation gate and pending attempt data.
#[derive(Debug)]
pub struct ProviderCore {
    cache: SessionCache,
    gate: SessionGate,
    scratch: ScratchStore,
}

impl ProviderCore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            cache: SessionCache::new(),
            gate: SessionGate::new(lock_timeout),
            scratch: ScratchStore::new(),
        }
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    pub fn scratch(&self) -> &ScratchStore {
        &self.scratch
    }

    /// Look up a session, queueing behind any attestation in flight.
    ///
    /// Without a cached session, at most one caller per release of the gate
    /// becomes the attester; the rest wait for its result up to the shared
    /// timeout. A miss records the attestation URL and, if requested, a
    /// fresh nonce under `correlation` and returns the nonce.
    pub fn get_session_helper(
        &self,
        params: &EnclaveSessionParameters,
        correlation: CorrelationId,
        generate_nonce: bool,
    ) -> SessionLookup {
        let (session, counter) = self.cache.get(params);
        if session.is_some() {
            return SessionLookup {
                session,
                counter,
                custom_data: None,
            };
        }

        // A pending item means this attempt already passed the gate.
        let same_attempt_retry = self.scratch.contains(correlation);
        let acquired = !same_attempt_retry && self.gate.try_acquire();

        let (session, counter) = self.cache.get(params);
        if session.is_some() {
            if acquired {
                self.gate.abandon();
            }
            return SessionLookup {
                session,
                counter,
                custom_data: None,
            };
        }

        let nonce = generate_nonce.then(|| {
            let mut nonce = vec![0u8; NONCE_LEN];
            rand::thread_rng().fill_bytes(&mut nonce);
            nonce
        });
        self.scratch.insert(
            correlation,
            AttestationInfoItem {
                attestation_url: params.attestation_url.clone(),
                nonce: nonce.clone(),
            },
        );
        tracing::debug!(
            %correlation,
            acquired,
            same_attempt_retry,
            "no cached enclave session, attestation required"
        );
        SessionLookup {
            session: None,
            counter: 0,
            custom_data: nonce,
        }
    }

    /// Completion protocol: release the gate only if a session was produced.
    pub fn update_session_lock_status(&self, session: Option<&Arc<EnclaveSession>>) {
        self.gate.complete(session.is_some());
    }
}

/// An attestation protocol able to establish enclave sessions.
///
/// Implementors supply the variant hooks; the capability operations are
/// provided and share the lock protocol in [`ProviderCore`].
pub trait AttestationProvider: Send + Sync {
    fn protocol(&self) -> AttestationProtocol;

    fn core(&self) -> &ProviderCore;

    /// Whether attempts bind a client-generated nonce.
    fn uses_nonce(&self) -> bool;

    /// Whether sessions can only be created for a non-empty attestation URL.
    fn requires_attestation_url(&self) -> bool {
        true
    }

    /// Endpoint the provider fetches verification material from.
    fn build_attestation_url(&self, attestation_url: &str) -> Result<String>;

    /// Fetch the body of `url` under the provider's retry rules.
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;

    /// Protocol-specific input sent inside the attestation parameters.
    fn protocol_input(&self, attestation_url: &str, nonce: Option<&[u8]>) -> Result<Vec<u8>>;

    /// Parse and verify the attestation info returned by the server.
    fn verify_evidence(
        &self,
        attestation_info: &[u8],
        params: &EnclaveSessionParameters,
        nonce: Option<&[u8]>,
    ) -> Result<VerifiedEvidence>;

    /// Derive the session key from verified evidence.
    fn derive_session_key(&self, evidence: &VerifiedEvidence, client_key: &DhKeyPair) -> Result<Vec<u8>> {
        derive_shared_secret(evidence, client_key)
    }

    fn get_enclave_session(
        &self,
        params: &EnclaveSessionParameters,
        correlation: CorrelationId,
        generate_custom_data: bool,
    ) -> SessionLookup {
        self.core()
            .get_session_helper(params, correlation, generate_custom_data && self.uses_nonce())
    }

    /// Build attestation parameters with a fresh client key.
    ///
    /// Without explicit `custom_data`, the nonce stashed for `correlation`
    /// is used.
    fn get_attestation_parameters(
        &self,
        correlation: CorrelationId,
        attestation_url: &str,
        custom_data: Option<&[u8]>,
    ) -> Result<AttestationRequest> {
        let stashed = match custom_data {
            Some(_) => None,
            None => self.core().scratch().get(correlation).and_then(|item| item.nonce),
        };
        let nonce = custom_data.or(stashed.as_deref());
        let protocol_input = self.protocol_input(attestation_url, nonce)?;
        let client_key = DhKeyPair::generate()?;
        let parameters = AttestationParameters {
            protocol_id: self.protocol().id(),
            protocol_input,
            client_dh_public_key: client_key.public_blob()?,
        };
        Ok(AttestationRequest {
            parameters,
            client_key,
        })
    }

    fn create_enclave_session(
        &self,
        attestation_info: &[u8],
        client_key: &DhKeyPair,
        params: &EnclaveSessionParameters,
        custom_data: Option<&[u8]>,
        correlation: CorrelationId,
    ) -> Result<(Arc<EnclaveSession>, i64)> {
        establish_session(self, attestation_info, client_key, params, custom_data, correlation)
    }

    fn invalidate_enclave_session(
        &self,
        params: &EnclaveSessionParameters,
        session: &Arc<EnclaveSession>,
    ) {
        self.core().cache().invalidate(params, session);
    }
}

/// Verify, derive and cache a session from the server's attestation info.
///
/// Returns an already cached session without attesting. The completion
/// protocol runs whatever the outcome; a failure caches nothing and leaves
/// the gate closed.
pub fn establish_session<P>(
    provider: &P,
    attestation_info: &[u8],
    client_key: &DhKeyPair,
    params: &EnclaveSessionParameters,
    custom_data: Option<&[u8]>,
    correlation: CorrelationId,
) -> Result<(Arc<EnclaveSession>, i64)>
where
    P: AttestationProvider + ?Sized,
{
    let core = provider.core();
    let stashed = core.scratch().remove(correlation).and_then(|item| item.nonce);
    let nonce = custom_data.or(stashed.as_deref());

    let result = (|| -> Result<(Arc<EnclaveSession>, i64)> {
        let (cached, counter) = core.cache().get(params);
        if let Some(session) = cached {
            return Ok((session, counter));
        }
        if provider.requires_attestation_url() && params.attestation_url.trim().is_empty() {
            return Err(Error::from(AttestError::SessionCreation(
                "attestation URL is empty".into(),
            )));
        }

        let evidence = provider.verify_evidence(attestation_info, params, nonce)?;
        let session_key = provider.derive_session_key(&evidence, client_key)?;
        let (session, counter) = core.cache().create(params, session_key, evidence.session_id);
        tracing::info!(
            protocol = %provider.protocol(),
            server = %params.server_name,
            session_id = evidence.session_id,
            "enclave session established"
        );
        Ok((session, counter))
    })();

    if let Err(e) = &result {
        tracing::warn!(protocol = %provider.protocol(), error = %e, "enclave attestation failed");
    }
    core.update_session_lock_status(result.as_ref().ok().map(|(session, _)| session));
    result
}

/// Check the enclave's signature over its DH key, then run ECDH.
pub fn derive_shared_secret(evidence: &VerifiedEvidence, client_key: &DhKeyPair) -> Result<Vec<u8>> {
    let identity = rsa_public_blob_to_key(&evidence.identity_key)?;
    let identity = PKey::from_rsa(identity).map_err(|e| {
        CryptoError::InvalidKeyBlob {
            kind: "RSA",
            reason: e.to_string(),
        }
    })?;
    let valid = verify_rsa_sha256(
        &identity,
        RsaSignaturePadding::Pkcs1,
        &evidence.dh_info.public_key,
        &evidence.dh_info.public_key_signature,
    )?;
    if !valid {
        return Err(AttestError::VerificationFailed(
            "signature over the enclave DH public key is invalid".into(),
        )
        .into());
    }
    Ok(client_key.derive_key_from_hash(&evidence.dh_info.public_key)?)
}
