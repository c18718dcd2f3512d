use std::time::Duration;

/// Policy for retrying a failed request with a fixed pause between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (excludes the initial attempt).
    pub max_retries: u32,
    /// Pause before each retry.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// A policy that performs no retries (single attempt only).
    pub fn none() -> Self {
        Self::default()
    }

    /// Total number of attempts, including the first.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Run `f` with retry logic according to the given policy.
///
/// Calls `f` up to `policy.max_retries + 1` times, sleeping `policy.delay`
/// before every attempt after the first. Returns the first success or the
/// last error.
pub fn with_retry<F, T, E>(policy: &RetryPolicy, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) => {
                if attempt >= policy.max_retries {
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "final request attempt failed"
                    );
                    return Err(e);
                }
                tracing::warn!(
                    attempt = attempt + 1,
                    max = policy.attempts(),
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %e,
                    "request attempt failed, retrying"
                );
                std::thread::sleep(policy.delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn success_on_first_attempt() {
        let mut calls = 0;
        let out: Result<u32, String> = with_retry(&fast(3), || {
            calls += 1;
            Ok(5)
        });
        assert_eq!(out.unwrap(), 5);
        assert_eq!(calls, 1);
    }

    #[test]
    fn succeeds_after_failures() {
        let mut calls = 0;
        let out: Result<u32, String> = with_retry(&fast(3), || {
            calls += 1;
            if calls < 3 {
                Err(format!("fail {calls}"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(out.unwrap(), 3);
    }

    #[test]
    fn returns_last_error_after_exhaustion() {
        let mut calls = 0;
        let out: Result<(), String> = with_retry(&fast(2), || {
            calls += 1;
            Err(format!("fail {calls}"))
        });
        assert_eq!(out.unwrap_err(), "fail 3");
        assert_eq!(calls, 3);
    }

    #[test]
    fn none_makes_one_attempt() {
        let mut calls = 0;
        let _: Result<(), &str> = with_retry(&RetryPolicy::none(), || {
            calls += 1;
            Err("nope")
        });
        assert_eq!(calls, 1);
        assert_eq!(RetryPolicy::none().attempts(), 1);
    }
}
