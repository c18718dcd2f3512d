use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::CorrelationId;

/// How long a pending attestation item survives if its attempt is abandoned.
pub const ITEM_TTL: Duration = Duration::from_secs(10 * 60);

/// Attestation URL and nonce carried between the calls of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationInfoItem {
    pub attestation_url: String,
    pub nonce: Option<Vec<u8>>,
}

/// Short-lived store of [`AttestationInfoItem`]s keyed by correlation id.
#[derive(Debug)]
pub struct ScratchStore {
    items: Mutex<HashMap<CorrelationId, (AttestationInfoItem, Instant)>>,
    ttl: Duration,
}

impl ScratchStore {
    pub fn new() -> Self {
        Self::with_ttl(ITEM_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Insert or replace the item for `id`, expiring after the store's TTL.
    pub fn insert(&self, id: CorrelationId, item: AttestationInfoItem) {
        let now = Instant::now();
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.retain(|_, (_, expires_at)| *expires_at > now);
        items.insert(id, (item, now + self.ttl));
    }

    pub fn get(&self, id: CorrelationId) -> Option<AttestationInfoItem> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items
            .get(&id)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(item, _)| item.clone())
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&self, id: CorrelationId) -> Option<AttestationInfoItem> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items
            .remove(&id)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(item, _)| item)
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.values().filter(|(_, exp)| *exp > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ScratchStore {
    fn default() -> Self {
        Self::new()
    }
}
