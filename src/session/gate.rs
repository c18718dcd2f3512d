use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Default bound on how long a caller waits for another thread's attestation.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(15);

/// Auto-reset gate that lets one caller at a time run attestation.
///
/// The gate starts open. A successful [`SessionGate::try_acquire`] closes it
/// again, so only one waiter passes per release. The wait is bounded by a
/// timeout shared by every caller; a caller that times out drops it to zero
/// so later callers stop queueing, and a successful attestation restores the
/// default.
///
/// The timeout is shared across all servers using this gate, not per key.
#[derive(Debug)]
pub struct SessionGate {
    open: Mutex<bool>,
    signal: Condvar,
    timeout_ms: AtomicU64,
    default_timeout_ms: u64,
    lock_acquired: Mutex<bool>,
}

impl SessionGate {
    pub fn new(default_timeout: Duration) -> Self {
        let default_timeout_ms = default_timeout.as_millis() as u64;
        Self {
            open: Mutex::new(true),
            signal: Condvar::new(),
            timeout_ms: AtomicU64::new(default_timeout_ms),
            default_timeout_ms,
            lock_acquired: Mutex::new(false),
        }
    }

    /// The wait bound currently in force.
    pub fn current_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::SeqCst))
    }

    /// Whether some caller currently holds the gate as the attester.
    pub fn is_lock_acquired(&self) -> bool {
        *self.lock_acquired.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for the gate up to the current timeout.
    ///
    /// On success the gate is closed and the caller is recorded as the
    /// attester. On timeout the shared timeout drops to zero.
    pub fn try_acquire(&self) -> bool {
        let timeout = self.current_timeout();
        let guard = self.open.lock().unwrap_or_else(|e| e.into_inner());
        let (mut open, _) = self
            .signal
            .wait_timeout_while(guard, timeout, |open| !*open)
            .unwrap_or_else(|e| e.into_inner());

        if *open {
            *open = false;
            drop(open);
            *self.lock_acquired.lock().unwrap_or_else(|e| e.into_inner()) = true;
            tracing::debug!("session gate acquired");
            true
        } else {
            drop(open);
            self.timeout_ms.swap(0, Ordering::SeqCst);
            tracing::warn!(
                waited_ms = timeout.as_millis() as u64,
                "timed out waiting for in-flight attestation, attesting independently"
            );
            false
        }
    }

    /// Give the gate back without producing a session.
    ///
    /// Used when the attester finds a session already cached.
    pub fn abandon(&self) {
        let mut acquired = self.lock_acquired.lock().unwrap_or_else(|e| e.into_inner());
        *acquired = false;
        self.open_gate();
    }

    /// Completion protocol after an attestation attempt.
    ///
    /// Opens the gate and restores the default timeout only when a session
    /// was produced and some caller held the gate. Returns whether the gate
    /// was released.
    pub fn complete(&self, session_produced: bool) -> bool {
        if !session_produced {
            return false;
        }
        let mut acquired = self.lock_acquired.lock().unwrap_or_else(|e| e.into_inner());
        if !*acquired {
            return false;
        }
        *acquired = false;
        self.timeout_ms
            .swap(self.default_timeout_ms, Ordering::SeqCst);
        self.open_gate();
        tracing::debug!("session gate released after attestation");
        true
    }

    fn open_gate(&self) {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        *open = true;
        self.signal.notify_one();
    }
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn first_caller_acquires_immediately() {
        let gate = SessionGate::new(Duration::from_secs(5));
        assert!(gate.try_acquire());
        assert!(gate.is_lock_acquired());
    }

    #[test]
    fn second_caller_times_out_and_degrades() {
        let gate = SessionGate::new(Duration::from_millis(50));
        assert!(gate.try_acquire());

        let start = Instant::now();
        assert!(!gate.try_acquire());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(gate.current_timeout(), Duration::ZERO);

        // Degraded: further callers fail fast.
        let start = Instant::now();
        assert!(!gate.try_acquire());
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn complete_restores_timeout_and_reopens() {
        let gate = SessionGate::new(Duration::from_millis(50));
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        assert_eq!(gate.current_timeout(), Duration::ZERO);

        assert!(gate.complete(true));
        assert_eq!(gate.current_timeout(), Duration::from_millis(50));
        assert!(!gate.is_lock_acquired());
        assert!(gate.try_acquire());
    }

    #[test]
    fn failed_attempt_keeps_gate_closed() {
        let gate = SessionGate::new(Duration::from_millis(20));
        assert!(gate.try_acquire());
        assert!(!gate.complete(false));
        assert!(gate.is_lock_acquired());
        assert!(!gate.try_acquire());
    }

    #[test]
    fn complete_without_holder_is_noop() {
        let gate = SessionGate::new(Duration::from_millis(20));
        assert!(!gate.complete(true));
        assert!(gate.try_acquire());
    }

    #[test]
    fn abandon_reopens_gate() {
        let gate = SessionGate::new(Duration::from_millis(20));
        assert!(gate.try_acquire());
        gate.abandon();
        assert!(!gate.is_lock_acquired());
        assert!(gate.try_acquire());
    }

    #[test]
    fn release_wakes_a_waiter() {
        let gate = Arc::new(SessionGate::new(Duration::from_secs(10)));
        assert!(gate.try_acquire());

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.try_acquire())
        };
        thread::sleep(Duration::from_millis(50));
        gate.complete(true);
        assert!(waiter.join().unwrap());
    }
}
