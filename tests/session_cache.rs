//! Session cache: counters, conditional invalidation and concurrent access.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use enclave_attestation::session::cache::SessionCache;
use enclave_attestation::EnclaveSessionParameters;

fn params(server: &str) -> EnclaveSessionParameters {
    EnclaveSessionParameters::new(server, "https://hgs.contoso.com/Attestation", "Clinic")
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[test]
fn counter_increases_across_creates_and_gets() {
    let cache = SessionCache::new();
    let p = params("sql1");

    let (_, c_create) = cache.create(&p, vec![1; 32], 10);
    let mut last = c_create;
    for _ in 0..5 {
        let (session, counter) = cache.get(&p);
        assert_eq!(session.unwrap().session_id(), 10);
        assert!(counter > last, "{counter} <= {last}");
        last = counter;
    }
}

#[test]
fn counter_is_shared_between_keys() {
    let cache = SessionCache::new();
    let (_, a) = cache.create(&params("sql1"), vec![1; 32], 1);
    let (_, b) = cache.create(&params("sql2"), vec![2; 32], 2);
    let (_, c) = cache.get(&params("sql1"));
    assert!(a < b && b < c);
}

#[test]
fn replacing_a_session_returns_the_new_one() {
    let cache = SessionCache::new();
    let p = params("sql1");
    cache.create(&p, vec![1; 32], 1);
    let (newer, _) = cache.create(&p, vec![2; 32], 2);
    let (found, _) = cache.get(&p);
    assert!(Arc::ptr_eq(&found.unwrap(), &newer));
}

// ---------------------------------------------------------------------------
// Invalidation
// ---------------------------------------------------------------------------

#[test]
fn invalidating_a_replaced_session_keeps_the_replacement() {
    let cache = SessionCache::new();
    let p = params("sql1");
    let (old, _) = cache.create(&p, vec![1; 32], 1);
    let (new, _) = cache.create(&p, vec![2; 32], 2);

    cache.invalidate(&p, &old);
    let (found, _) = cache.get(&p);
    assert!(Arc::ptr_eq(&found.unwrap(), &new));

    cache.invalidate(&p, &new);
    assert!(cache.get(&p).0.is_none());
}

#[test]
fn invalidated_session_stays_usable_by_holders() {
    let cache = SessionCache::new();
    let p = params("sql1");
    let (session, _) = cache.create(&p, vec![0x5A; 32], 3);
    cache.invalidate(&p, &session);
    assert_eq!(session.session_key(), &[0x5A; 32]);
}

#[test]
fn short_ttl_expires_sessions() {
    let cache = SessionCache::with_ttl(Duration::from_millis(20));
    let p = params("sql1");
    cache.create(&p, vec![1; 32], 1);
    thread::sleep(Duration::from_millis(40));
    let (session, counter) = cache.get(&p);
    assert!(session.is_none());
    assert_eq!(counter, 0);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn concurrent_gets_see_unique_counters() {
    let cache = Arc::new(SessionCache::new());
    let p = params("sql1");
    cache.create(&p, vec![1; 32], 1);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let p = p.clone();
            thread::spawn(move || (0..50).map(|_| cache.get(&p).1).collect::<Vec<_>>())
        })
        .collect();

    let mut counters: Vec<i64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let total = counters.len();
    counters.sort_unstable();
    counters.dedup();
    assert_eq!(counters.len(), total);
}
