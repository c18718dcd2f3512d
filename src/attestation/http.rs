//! Blocking HTTP GET used to fetch signing certificates and token keys.

use crate::error::FetchError;

/// Fetches the body of a URL.
///
/// Implementations must be usable from many threads at once. Providers
/// hold one behind an `Arc` so tests can substitute canned responses.
pub trait HttpFetcher: Send + Sync {
    fn get(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// [`HttpFetcher`] backed by a shared `ureq` agent.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct UreqFetcher {
    agent: ureq::Agent,
}

#[cfg(feature = "http")]
impl UreqFetcher {
    /// Default per-request timeout.
    pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    pub fn new() -> Self {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: std::time::Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { agent }
    }
}

#[cfg(feature = "http")]
impl Default for UreqFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "http")]
impl HttpFetcher for UreqFetcher {
    fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut resp = self.agent.get(url).call().map_err(|e| match e {
            ureq::Error::StatusCode(code) => FetchError::Status(code),
            other => FetchError::Transport(other.to_string()),
        })?;
        resp.body_mut()
            .read_to_vec()
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))
    }
}
