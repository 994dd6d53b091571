// In-memory work queue with the same semantics as the Redis queue

use super::{
    is_superseded, pending_state, repeat_field, single_id, EntryState, OverlapPolicy, QueueEntry,
    RepeatRecord, StoredEntry, WorkQueue, DEFAULT_CLAIM_LEASE_SECS,
};
use crate::errors::QueueError;
use crate::schedule::RepeatSpec;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct QueueState {
    /// Repeat field -> record
    repeats: HashMap<String, RepeatRecord>,
    /// Entry id -> entry, pending and active
    entries: HashMap<String, StoredEntry>,
    /// Claimed entry id -> lease expiry
    active: HashMap<String, DateTime<Utc>>,
}

impl QueueState {
    fn state_of(&self, entry: &StoredEntry, now: DateTime<Utc>) -> EntryState {
        if self.active.contains_key(&entry.id) {
            EntryState::Active
        } else {
            pending_state(entry.fire_at, now)
        }
    }

    fn key_is_active(&self, key: &str) -> bool {
        self.active
            .keys()
            .filter_map(|id| self.entries.get(id))
            .any(|entry| entry.key == key)
    }

    fn insert_if_absent(&mut self, entry: StoredEntry) {
        self.entries.entry(entry.id.clone()).or_insert(entry);
    }

    /// Release claims whose lease ran out; their entries become pending again
    fn recover_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|(_, lease)| **lease <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.active.remove(id);
            warn!(entry_id = %id, "Claim lease expired, entry returned to pending");
        }
        expired.len()
    }

    /// Whether the claim `entry` was handed out with is still held
    fn holds_claim(&self, entry: &StoredEntry) -> bool {
        self.active.contains_key(&entry.id)
            && self
                .entries
                .get(&entry.id)
                .is_some_and(|stored| stored.processed_on == entry.processed_on)
    }
}

/// Work queue held in process memory
#[derive(Clone)]
pub struct InMemoryWorkQueue {
    state: Arc<Mutex<QueueState>>,
    overlap_policy: OverlapPolicy,
    lease: Duration,
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new(OverlapPolicy::default())
    }
}

impl InMemoryWorkQueue {
    pub fn new(overlap_policy: OverlapPolicy) -> Self {
        Self {
            state: Arc::default(),
            overlap_policy,
            lease: Duration::seconds(DEFAULT_CLAIM_LEASE_SECS as i64),
        }
    }

    pub fn with_claim_lease(mut self, lease: std::time::Duration) -> Self {
        self.lease = Duration::from_std(lease).unwrap_or(self.lease);
        self
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn add_repeating(
        &self,
        key: &str,
        spec: &RepeatSpec,
        payload: serde_json::Value,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let field = repeat_field(key, spec);

        let record = match state.repeats.remove(&field) {
            Some(mut existing) => {
                existing.payload = payload;
                existing
            }
            None => RepeatRecord::new(key, spec, payload, Utc::now())?,
        };

        if let Some(instance) = record.current_instance() {
            state.insert_if_absent(instance);
        }
        state.repeats.insert(field, record);
        Ok(())
    }

    async fn add_delayed(
        &self,
        key: &str,
        delay_ms: u64,
        payload: serde_json::Value,
    ) -> Result<(), QueueError> {
        let fire_at = Utc::now() + Duration::milliseconds(delay_ms as i64);
        self.state
            .lock()
            .await
            .insert_if_absent(StoredEntry::single(key, fire_at, payload));
        Ok(())
    }

    async fn remove_repeating(&self, key: &str, spec: &RepeatSpec) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.repeats.remove(&repeat_field(key, spec)) else {
            return Ok(false);
        };

        if let Some(instance) = record.current_instance() {
            if !state.active.contains_key(&instance.id) {
                state.entries.remove(&instance.id);
            }
        }
        Ok(true)
    }

    async fn remove_delayed(&self, key: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let id = single_id(key);
        if state.active.contains_key(&id) {
            return Ok(false);
        }
        Ok(state.entries.remove(&id).is_some())
    }

    async fn list_repeating(&self) -> Result<Vec<RepeatRecord>, QueueError> {
        Ok(self.state.lock().await.repeats.values().cloned().collect())
    }

    async fn list_entries(&self, states: &[EntryState]) -> Result<Vec<QueueEntry>, QueueError> {
        let state = self.state.lock().await;
        let now = Utc::now();
        Ok(state
            .entries
            .values()
            .map(|entry| entry.clone().with_state(state.state_of(entry, now)))
            .filter(|entry| states.contains(&entry.state))
            .collect())
    }

    async fn get_entry(&self, key: &str) -> Result<Option<QueueEntry>, QueueError> {
        let state = self.state.lock().await;
        let now = Utc::now();
        Ok(state
            .entries
            .get(&single_id(key))
            .map(|entry| entry.clone().with_state(state.state_of(entry, now))))
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        let mut state = self.state.lock().await;
        state.recover_expired(now);

        let mut due: Vec<(DateTime<Utc>, String)> = state
            .entries
            .values()
            .filter(|entry| !state.active.contains_key(&entry.id) && entry.fire_at <= now)
            .map(|entry| (entry.fire_at, entry.id.clone()))
            .collect();
        due.sort();

        let mut claimed = Vec::new();
        for (_, id) in due {
            if claimed.len() >= limit {
                break;
            }
            let Some(mut entry) = state.entries.remove(&id) else {
                continue;
            };

            if let Some(spec) = entry.repeat.clone() {
                let field = repeat_field(&entry.key, &spec);
                let mut record = state.repeats.remove(&field);

                if is_superseded(record.as_ref(), &entry) {
                    debug!(entry_id = %entry.id, "Dropping stalled fire superseded by its chain");
                    if let Some(record) = record {
                        state.repeats.insert(field, record);
                    }
                    continue;
                }

                if let Some(record) = record.as_mut() {
                    if record.is_current(&entry) {
                        if let Some(next) = record.advance(now)? {
                            state.insert_if_absent(next);
                        }
                    }
                }
                if let Some(record) = record {
                    state.repeats.insert(field, record);
                }

                if self.overlap_policy == OverlapPolicy::Skip && state.key_is_active(&entry.key) {
                    debug!(entry_id = %entry.id, key = %entry.key, "Skipping overlapping fire");
                    continue;
                }
            }

            entry.processed_on = Some(now);
            state.active.insert(entry.id.clone(), now + self.lease);
            state.entries.insert(entry.id.clone(), entry.clone());
            claimed.push(entry.with_state(EntryState::Active));
        }

        Ok(claimed)
    }

    async fn renew_lease(&self, entry: &StoredEntry, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if !state.holds_claim(entry) {
            return Ok(false);
        }
        state.active.insert(entry.id.clone(), now + self.lease);
        Ok(true)
    }

    async fn recover_stalled(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        Ok(self.state.lock().await.recover_expired(now))
    }

    async fn finish(&self, entry: &StoredEntry) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.holds_claim(entry) {
            state.active.remove(&entry.id);
            state.entries.remove(&entry.id);
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.state.lock().await.entries.len())
    }
}
