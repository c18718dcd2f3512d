#![cfg(feature = "mock")]
//! Retry behavior of the HGS signing-certificate fetch.

use std::sync::Arc;
use std::time::Duration;

use enclave_attestation::attestation::hgs::HgsProvider;
use enclave_attestation::attestation::mock::{FailingFetcher, MockEnclave};
use enclave_attestation::error::AttestError;
use enclave_attestation::session::retry::{with_retry, RetryPolicy};
use enclave_attestation::{AttestationProvider, Error, ProviderConfig};

const URL: &str = "https://hgs.contoso.com/Attestation/";

fn config(retries: u32) -> ProviderConfig {
    ProviderConfig::builder()
        .max_num_retries(retries)
        .retry_sleep(Duration::ZERO)
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Exhaustion
// ---------------------------------------------------------------------------

#[test]
fn exhausted_retries_report_last_error() {
    let fetcher = Arc::new(FailingFetcher::new());
    let provider = HgsProvider::new(&config(2), fetcher.clone());

    let err = provider.signing_certificates(URL, false).unwrap_err();
    assert_eq!(fetcher.calls(), 3);
    match err {
        Error::Attestation(AttestError::FetchFailed { url, attempts, message }) => {
            assert_eq!(url, "https://hgs.contoso.com/Attestation/v2.0/signingCertificates");
            assert_eq!(attempts, 3);
            assert!(message.contains("attempt 3"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn default_config_makes_a_single_attempt() {
    let fetcher = Arc::new(FailingFetcher::new());
    let provider = HgsProvider::new(&ProviderConfig::default(), fetcher.clone());
    assert!(provider.fetch_bytes("https://hgs.contoso.com/x").is_err());
    assert_eq!(fetcher.calls(), 1);
}

#[test]
fn retry_sleeps_between_attempts() {
    let policy = RetryPolicy {
        max_retries: 2,
        delay: Duration::from_millis(20),
    };
    let start = std::time::Instant::now();
    let result: Result<(), String> = with_retry(&policy, || Err("down".to_string()));
    assert!(result.is_err());
    assert!(start.elapsed() >= Duration::from_millis(40));
}

#[test]
fn retry_sleep_below_one_second_is_rejected_in_seconds() {
    assert!(ProviderConfig::builder().enclave_retry_sleep_secs(0).build().is_err());
    assert!(ProviderConfig::builder().enclave_retry_sleep_secs(-5).build().is_err());
    let config = ProviderConfig::builder().enclave_retry_sleep_secs(2).build().unwrap();
    assert_eq!(config.retry_sleep, Duration::from_secs(2));
}

// ---------------------------------------------------------------------------
// Caching
// ---------------------------------------------------------------------------

#[test]
fn certificates_are_cached_until_forced() {
    let enclave = MockEnclave::new().unwrap();
    let fetcher = Arc::new(enclave.fetcher(URL.trim_end_matches('/')).unwrap());
    let provider = HgsProvider::new(&config(0), fetcher.clone());

    let first = provider.signing_certificates(URL, false).unwrap();
    let second = provider.signing_certificates(URL, false).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(
        first[0].to_der().unwrap(),
        second[0].to_der().unwrap()
    );
    assert_eq!(fetcher.calls(), 1);

    provider.signing_certificates(URL, true).unwrap();
    assert_eq!(fetcher.calls(), 2);
}
