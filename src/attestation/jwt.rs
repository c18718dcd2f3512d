//! Attestation token validation: signing key discovery documents and RS256
//! token checks.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use openssl::x509::X509;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::AttestError;

/// Allowed difference between our clock and the issuer's, in seconds.
pub const CLOCK_SKEW_SECS: u64 = 300;

/// `/.well-known/openid-configuration` document.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenIdConfiguration {
    #[serde(default)]
    pub issuer: Option<String>,
    pub jwks_uri: String,
}

/// One entry of a JSON Web Key Set.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub kty: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
    #[serde(default)]
    pub x5c: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// An RSA verification key taken from a JWKS.
#[derive(Clone)]
pub struct SigningKey {
    pub kid: Option<String>,
    key: DecodingKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").field("kid", &self.kid).finish()
    }
}

impl JwkSet {
    /// RSA keys of the set. Keys that cannot be decoded are skipped.
    pub fn signing_keys(&self) -> Vec<SigningKey> {
        self.keys
            .iter()
            .filter_map(|jwk| match jwk.to_decoding_key() {
                Ok(key) => Some(SigningKey {
                    kid: jwk.kid.clone(),
                    key,
                }),
                Err(e) => {
                    tracing::debug!(kid = ?jwk.kid, error = %e, "skipping unusable signing key");
                    None
                }
            })
            .collect()
    }
}

impl Jwk {
    /// Key from the `n`/`e` components, else from the first `x5c` certificate.
    fn to_decoding_key(&self) -> Result<DecodingKey, String> {
        if let (Some(n), Some(e)) = (&self.n, &self.e) {
            return DecodingKey::from_rsa_components(n, e).map_err(|e| format!("n/e: {e}"));
        }
        let der = self
            .x5c
            .as_ref()
            .and_then(|chain| chain.first())
            .ok_or("key has neither n/e nor x5c")?;
        let der = STANDARD.decode(der).map_err(|e| format!("x5c: {e}"))?;
        let cert = X509::from_der(&der).map_err(|e| format!("x5c certificate: {e}"))?;
        let rsa = cert
            .public_key()
            .and_then(|key| key.rsa())
            .map_err(|e| format!("x5c key is not RSA: {e}"))?;
        let pkcs1 = rsa.public_key_to_der_pkcs1().map_err(|e| e.to_string())?;
        Ok(DecodingKey::from_rsa_der(&pkcs1))
    }
}

/// Claims of an attestation token whose signature, issuer and lifetime
/// have been checked.
#[derive(Debug)]
pub struct VerifiedToken {
    claims: Map<String, Value>,
}

impl VerifiedToken {
    /// String value of a claim.
    pub fn claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }
}

/// Why an attestation token was refused.
#[derive(Debug)]
pub enum TokenRejection {
    /// No signing key verifies the token, or it names another issuer. A
    /// fresh copy of the service's keys may still accept it.
    UntrustedSigner(String),
    /// The token itself is unacceptable whatever the keys.
    Invalid(AttestError),
}

/// RS256 with a required `exp`, `nbf` honored when present, both within
/// [`CLOCK_SKEW_SECS`], and `iss` one of `valid_issuers`.
pub fn token_validation(valid_issuers: &[String]) -> Validation {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_required_spec_claims(&["exp"]);
    validation.leeway = CLOCK_SKEW_SECS;
    validation.validate_exp = true;
    validation.validate_nbf = true;
    validation.validate_aud = false;
    validation.set_issuer(valid_issuers);
    validation
}

/// Check `token` against `keys`. Keys whose `kid` matches the header are
/// tried first, then the rest.
pub fn verify_token(
    token: &str,
    keys: &[SigningKey],
    valid_issuers: &[String],
) -> Result<VerifiedToken, TokenRejection> {
    let header = decode_header(token).map_err(|e| TokenRejection::Invalid(malformed(&e)))?;
    if header.alg != Algorithm::RS256 {
        return Err(TokenRejection::Invalid(AttestError::VerificationFailed(format!(
            "unsupported attestation token algorithm {:?}",
            header.alg
        ))));
    }

    let validation = token_validation(valid_issuers);
    let (matching, others): (Vec<&SigningKey>, Vec<&SigningKey>) = keys
        .iter()
        .partition(|k| header.kid.is_some() && k.kid == header.kid);

    let mut last_error = String::from("no signing keys");
    for key in matching.into_iter().chain(others) {
        let err = match decode::<Map<String, Value>>(token, &key.key, &validation) {
            Ok(data) => return Ok(VerifiedToken { claims: data.claims }),
            Err(err) => err,
        };
        match err.kind() {
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidKeyFormat
            | ErrorKind::Crypto(_) => last_error = err.to_string(),
            ErrorKind::InvalidIssuer => {
                return Err(TokenRejection::UntrustedSigner(
                    "issuer is not the attestation service".into(),
                ))
            }
            ErrorKind::MissingRequiredClaim(claim) if claim == "iss" => {
                return Err(TokenRejection::UntrustedSigner("token names no issuer".into()))
            }
            _ => return Err(TokenRejection::Invalid(claim_error(&err))),
        }
    }
    Err(TokenRejection::UntrustedSigner(format!(
        "no signing key verifies the signature ({last_error})"
    )))
}

fn claim_error(err: &jsonwebtoken::errors::Error) -> AttestError {
    match err.kind() {
        ErrorKind::ExpiredSignature => AttestError::TokenExpired,
        ErrorKind::ImmatureSignature => AttestError::TokenNotYetValid,
        ErrorKind::MissingRequiredClaim(claim) => AttestError::MissingClaim(claim.clone()),
        _ => malformed(err),
    }
}

fn malformed(err: &jsonwebtoken::errors::Error) -> AttestError {
    AttestError::VerificationFailed(format!("failed to parse attestation token: {err}"))
}

/// Check that `claim` equals the base64url encoding of `expected`.
pub fn validate_claim(token: &VerifiedToken, claim: &str, expected: &[u8]) -> Result<(), AttestError> {
    let actual = token
        .claim(claim)
        .ok_or_else(|| AttestError::MissingClaim(claim.to_string()))?;
    if actual != URL_SAFE_NO_PAD.encode(expected) {
        return Err(AttestError::InvalidClaim {
            claim: claim.to_string(),
            value: actual.to_string(),
        });
    }
    Ok(())
}
