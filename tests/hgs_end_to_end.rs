#![cfg(feature = "mock")]
//! Full HGS flow against the software enclave: attest, derive the session
//! key, and build an enclave package the enclave can open.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use enclave_attestation::attestation::mock::{expected_identity, open_enclave_package, MockEnclave};
use enclave_attestation::error::AttestError;
use enclave_attestation::wire::utf16le;
use enclave_attestation::{
    AttestationProtocol, ColumnEncryptionKeyEntry, ColumnKeyDecryptor, CorrelationId,
    EnclaveDelegate, EnclaveSessionParameters, EncryptedKeyValue, Error, ProviderConfig, Result,
};

const URL: &str = "https://hgs.contoso.com/Attestation";
const HGS: AttestationProtocol = AttestationProtocol::Hgs;

struct FixedKeys;

impl ColumnKeyDecryptor for FixedKeys {
    fn decrypt(&self, _entry: &ColumnEncryptionKeyEntry, _server: &str) -> Result<Option<Vec<u8>>> {
        Ok(Some(vec![0x11; 32]))
    }
}

fn key_entry() -> ColumnEncryptionKeyEntry {
    ColumnEncryptionKeyEntry {
        ordinal: 0,
        values: vec![EncryptedKeyValue {
            encrypted_key: vec![0xEE; 64],
            database_id: 5,
            cek_id: 3,
            cek_version: 1,
            cek_md_version: [0; 8],
            key_path: "CurrentUser/My/0123".into(),
            key_store_name: "MSSQL_CERTIFICATE_STORE".into(),
            algorithm_name: "RSA_OAEP".into(),
        }],
    }
}

fn params() -> EnclaveSessionParameters {
    EnclaveSessionParameters::new("sql1.contoso.com", URL, "Clinic")
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[test]
fn attest_and_build_package() {
    let enclave = MockEnclave::new().unwrap();
    let fetcher = Arc::new(enclave.fetcher(URL).unwrap());
    let delegate = EnclaveDelegate::with_fetcher(ProviderConfig::default(), fetcher.clone());
    let params = params();
    let correlation = CorrelationId::new();

    let lookup = delegate
        .get_enclave_session(HGS, &params, correlation, true)
        .unwrap();
    assert!(lookup.session.is_none());
    assert!(lookup.custom_data.is_none(), "HGS does not use a nonce");

    let request = delegate
        .get_attestation_parameters(HGS, correlation, URL, None)
        .unwrap();
    assert_eq!(request.parameters.protocol_id, 3);
    assert!(request.parameters.protocol_input.is_empty());
    assert_eq!(request.parameters.client_dh_public_key.len(), 104);
    let wire = delegate
        .serialize_attestation_parameters(&request.parameters, "VBS")
        .unwrap();
    assert_eq!(&wire[..4], &[3, 0, 0, 0]);

    let info = enclave.hgs_attestation_info(7).unwrap();
    let session = delegate
        .create_enclave_session(HGS, &info, &request.client_key, &params, None, correlation)
        .unwrap();
    assert_eq!(session.session_id(), 7);
    let enclave_key = enclave
        .session_key(&request.parameters.client_dh_public_key)
        .unwrap();
    assert_eq!(session.session_key(), &enclave_key[..]);
    assert_eq!(fetcher.calls(), 1);

    let package = delegate
        .generate_enclave_package(HGS, &[key_entry()], Some("SELECT 1"), "VBS", &params, &FixedKeys)
        .unwrap();
    assert_eq!(&package.enclave_package_bytes[..8], &[7, 0, 0, 0, 0, 0, 0, 0]);

    let (session_id, plaintext) =
        open_enclave_package(&enclave_key, &package.enclave_package_bytes).unwrap();
    assert_eq!(session_id, 7);
    assert_eq!(plaintext.len(), 16 + 8 + 32 + 16 + 32);
    let counter = i64::from_le_bytes(plaintext[16..24].try_into().unwrap());
    assert!(counter > 0);
    assert_eq!(&plaintext[24..56], Sha256::digest(utf16le("SELECT 1")).as_slice());
    assert_eq!(&plaintext[56..60], &5i32.to_le_bytes());
    assert_eq!(&plaintext[60..68], &[0; 8]);
    assert_eq!(&plaintext[68..72], &[3, 0, 32, 0]);
    assert_eq!(&plaintext[72..], &[0x11; 32]);
}

#[test]
fn existing_session_is_reused_without_fetching() {
    let enclave = MockEnclave::new().unwrap();
    let fetcher = Arc::new(enclave.fetcher(URL).unwrap());
    let delegate = EnclaveDelegate::with_fetcher(ProviderConfig::default(), fetcher.clone());
    let params = params();

    let first = CorrelationId::new();
    delegate.get_enclave_session(HGS, &params, first, false).unwrap();
    let request = delegate.get_attestation_parameters(HGS, first, URL, None).unwrap();
    let info = enclave.hgs_attestation_info(21).unwrap();
    let session = delegate
        .create_enclave_session(HGS, &info, &request.client_key, &params, None, first)
        .unwrap();

    let second = CorrelationId::new();
    let lookup = delegate.get_enclave_session(HGS, &params, second, false).unwrap();
    assert!(Arc::ptr_eq(lookup.session.as_ref().unwrap(), &session));

    // A late create for the same server hands back the cached session.
    let request = delegate.get_attestation_parameters(HGS, second, URL, None).unwrap();
    let again = delegate
        .create_enclave_session(HGS, &info, &request.client_key, &params, None, second)
        .unwrap();
    assert!(Arc::ptr_eq(&again, &session));
    assert_eq!(fetcher.calls(), 1);
}

#[test]
fn invalidated_session_forces_reattestation() {
    let enclave = MockEnclave::new().unwrap();
    let fetcher = Arc::new(enclave.fetcher(URL).unwrap());
    let delegate = EnclaveDelegate::with_fetcher(ProviderConfig::default(), fetcher);
    let params = params();

    let correlation = CorrelationId::new();
    delegate.get_enclave_session(HGS, &params, correlation, false).unwrap();
    let request = delegate.get_attestation_parameters(HGS, correlation, URL, None).unwrap();
    let session = delegate
        .create_enclave_session(
            HGS,
            &enclave.hgs_attestation_info(1).unwrap(),
            &request.client_key,
            &params,
            None,
            correlation,
        )
        .unwrap();

    delegate.invalidate_enclave_session(HGS, &params, &session).unwrap();
    let err = delegate
        .generate_enclave_package(HGS, &[key_entry()], Some("SELECT 1"), "VBS", &params, &FixedKeys)
        .unwrap_err();
    assert!(err.is_retryable());
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

fn attest(enclave: &MockEnclave, delegate: &EnclaveDelegate) -> Result<Arc<enclave_attestation::EnclaveSession>> {
    let params = params();
    let correlation = CorrelationId::new();
    delegate.get_enclave_session(HGS, &params, correlation, false)?;
    let request = delegate.get_attestation_parameters(HGS, correlation, URL, None)?;
    let info = enclave.hgs_attestation_info(99)?;
    delegate.create_enclave_session(HGS, &info, &request.client_key, &params, None, correlation)
}

#[test]
fn untrusted_host_fails_after_one_refresh() {
    let trusted = MockEnclave::new().unwrap();
    let fetcher = Arc::new(trusted.fetcher(URL).unwrap());
    let rogue = MockEnclave::new().unwrap().with_untrusted_host().unwrap();
    let delegate = EnclaveDelegate::with_fetcher(ProviderConfig::default(), fetcher.clone());

    let err = attest(&rogue, &delegate).unwrap_err();
    assert!(
        matches!(err, Error::Attestation(AttestError::VerificationFailed(_))),
        "{err}"
    );
    assert_eq!(fetcher.calls(), 2);

    let provider = delegate.provider(HGS).unwrap();
    assert!(provider.core().cache().get(&params()).0.is_none());
    assert!(provider.core().gate().is_lock_acquired());
}

#[test]
fn unexpected_author_is_a_policy_mismatch() {
    let mut identity = expected_identity();
    identity.author_id[0] ^= 0xFF;
    let enclave = MockEnclave::new().unwrap().with_identity(identity);
    let fetcher = Arc::new(enclave.fetcher(URL).unwrap());
    let delegate = EnclaveDelegate::with_fetcher(ProviderConfig::default(), fetcher.clone());

    match attest(&enclave, &delegate).unwrap_err() {
        Error::Attestation(AttestError::PolicyMismatch { property, .. }) => {
            assert_eq!(property, "AuthorId")
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fetcher.calls(), 0, "policy is checked before fetching certificates");
}

#[test]
fn debuggable_enclave_is_rejected() {
    let mut identity = expected_identity();
    identity.flags = 1;
    let enclave = MockEnclave::new().unwrap().with_identity(identity);
    let delegate =
        EnclaveDelegate::with_fetcher(ProviderConfig::default(), Arc::new(enclave.fetcher(URL).unwrap()));

    assert!(matches!(
        attest(&enclave, &delegate).unwrap_err(),
        Error::Attestation(AttestError::DebuggableEnclave)
    ));
}

#[test]
fn tampered_dh_signature_is_rejected() {
    let enclave = MockEnclave::new().unwrap();
    let delegate =
        EnclaveDelegate::with_fetcher(ProviderConfig::default(), Arc::new(enclave.fetcher(URL).unwrap()));
    let params = params();
    let correlation = CorrelationId::new();
    delegate.get_enclave_session(HGS, &params, correlation, false).unwrap();
    let request = delegate.get_attestation_parameters(HGS, correlation, URL, None).unwrap();

    let mut info = enclave.hgs_attestation_info(5).unwrap();
    let last = info.len() - 1;
    info[last] ^= 0x01;
    let err = delegate
        .create_enclave_session(HGS, &info, &request.client_key, &params, None, correlation)
        .unwrap_err();
    assert!(matches!(err, Error::Attestation(AttestError::VerificationFailed(_))), "{err}");
}
