use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::{EnclaveSession, EnclaveSessionParameters};

/// Sessions older than this are treated as absent.
pub const SESSION_TTL: Duration = Duration::from_secs(8 * 60 * 60);

#[derive(Debug)]
struct Entry {
    session: Arc<EnclaveSession>,
    expires_at: Instant,
}

/// Keyed store of active enclave sessions.
///
/// The key is the attestation URL and server name, compared
/// case-insensitively. A single counter, shared by all keys, is bumped on
/// every hit and every insert; it is the replay counter handed to the
/// package builder.
#[derive(Debug)]
pub struct SessionCache {
    entries: RwLock<HashMap<String, Entry>>,
    counter: AtomicI64,
    ttl: Duration,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::with_ttl(SESSION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            counter: AtomicI64::new(0),
            ttl,
        }
    }

    fn cache_key(params: &EnclaveSessionParameters) -> String {
        format!("{}{}", params.attestation_url, params.server_name).to_lowercase()
    }

    fn next_counter(&self) -> i64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Look up the session for `params`. A miss returns `(None, 0)`.
    pub fn get(&self, params: &EnclaveSessionParameters) -> (Option<Arc<EnclaveSession>>, i64) {
        let key = Self::cache_key(params);
        let found = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries
                .get(&key)
                .map(|entry| (Arc::clone(&entry.session), entry.expires_at))
        };

        match found {
            Some((session, expires_at)) if expires_at > Instant::now() => {
                tracing::debug!(session_id = session.session_id(), "enclave session cache hit");
                return (Some(session), self.next_counter());
            }
            Some(_) => {
                let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
                if entries
                    .get(&key)
                    .is_some_and(|entry| entry.expires_at <= Instant::now())
                {
                    entries.remove(&key);
                    tracing::debug!("evicted expired enclave session");
                }
            }
            None => {}
        }
        (None, 0)
    }

    /// Insert or replace the session for `params`.
    pub fn create(
        &self,
        params: &EnclaveSessionParameters,
        shared_secret: Vec<u8>,
        session_id: i64,
    ) -> (Arc<EnclaveSession>, i64) {
        let session = Arc::new(EnclaveSession::new(shared_secret, session_id));
        let key = Self::cache_key(params);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            Entry {
                session: Arc::clone(&session),
                expires_at: Instant::now() + self.ttl,
            },
        );
        let counter = self.next_counter();
        drop(entries);
        tracing::debug!(session_id, "enclave session cached");
        (session, counter)
    }

    /// Remove the entry for `params` only if it still holds `session`.
    pub fn invalidate(&self, params: &EnclaveSessionParameters, session: &Arc<EnclaveSession>) {
        let key = Self::cache_key(params);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let matches = entries
            .get(&key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.session, session));
        if matches {
            entries.remove(&key);
            tracing::debug!(
                session_id = session.session_id(),
                "enclave session invalidated"
            );
        }
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(server: &str) -> EnclaveSessionParameters {
        EnclaveSessionParameters::new(server, "https://hgs.contoso.com/Attestation", "db")
    }

    #[test]
    fn miss_returns_none_and_zero() {
        let cache = SessionCache::new();
        let (session, counter) = cache.get(&params("srv"));
        assert!(session.is_none());
        assert_eq!(counter, 0);
    }

    #[test]
    fn create_then_get_returns_same_session_with_higher_counter() {
        let cache = SessionCache::new();
        let p = params("srv");
        let (created, c1) = cache.create(&p, vec![1; 32], 7);
        let (found, c2) = cache.get(&p);
        let found = found.expect("session should be cached");
        assert!(Arc::ptr_eq(&created, &found));
        assert!(c2 > c1);
        let (_, c3) = cache.get(&p);
        assert!(c3 > c2);
    }

    #[test]
    fn key_is_case_insensitive() {
        let cache = SessionCache::new();
        cache.create(&params("MyServer"), vec![1; 32], 1);
        let upper = EnclaveSessionParameters::new(
            "MYSERVER",
            "HTTPS://HGS.CONTOSO.COM/ATTESTATION",
            "db",
        );
        assert!(cache.get(&upper).0.is_some());
    }

    #[test]
    fn keys_are_independent() {
        let cache = SessionCache::new();
        cache.create(&params("a"), vec![1; 32], 1);
        assert!(cache.get(&params("b")).0.is_none());
    }

    #[test]
    fn invalidate_removes_matching_session() {
        let cache = SessionCache::new();
        let p = params("srv");
        let (s1, _) = cache.create(&p, vec![1; 32], 1);
        cache.invalidate(&p, &s1);
        assert!(cache.get(&p).0.is_none());
    }

    #[test]
    fn stale_invalidate_keeps_newer_session() {
        let cache = SessionCache::new();
        let p = params("srv");
        let (s1, _) = cache.create(&p, vec![1; 32], 1);
        let (s2, _) = cache.create(&p, vec![2; 32], 2);
        cache.invalidate(&p, &s1);
        let (found, _) = cache.get(&p);
        assert!(Arc::ptr_eq(&found.unwrap(), &s2));
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = SessionCache::with_ttl(Duration::ZERO);
        let p = params("srv");
        cache.create(&p, vec![1; 32], 1);
        let (session, counter) = cache.get(&p);
        assert!(session.is_none());
        assert_eq!(counter, 0);
    }
}
