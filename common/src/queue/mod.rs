// Work queue: repeating and delayed entries keyed by job id
//
// A repeating entry is a repeat record plus exactly one materialized
// instance for its next fire time. Claiming an instance schedules the
// following one before the handler runs.
//
// Every claim holds a lease. A claim whose lease runs out without being
// renewed or finished goes back to pending and is handed out again; a
// stalled repeating fire whose chain has already moved on is dropped
// instead, since the next fire supersedes it.

pub mod memory;
pub mod redis;
pub mod worker;

pub use memory::InMemoryWorkQueue;
pub use redis::RedisWorkQueue;
pub use worker::{DispatchHandler, QueueWorker, WorkerConfig};

use crate::errors::QueueError;
use crate::schedule::RepeatSpec;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lease of a claimed entry unless configured otherwise
pub const DEFAULT_CLAIM_LEASE_SECS: u64 = 300;

/// What happens when a repeating fire becomes due while a dispatch for the
/// same key is still running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Drop the overlapping fire; the repeat chain still advances
    #[default]
    Skip,
    /// Dispatch it anyway
    Allow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Due but not yet claimed
    Waiting,
    /// Not yet due
    Delayed,
    /// Claimed by a worker
    Active,
}

impl EntryState {
    pub const ALL: [EntryState; 3] = [EntryState::Waiting, EntryState::Delayed, EntryState::Active];
}

/// Entry stored in the queue backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub id: String,
    pub key: String,
    /// Set for instances of a repeating entry
    pub repeat: Option<RepeatSpec>,
    pub payload: serde_json::Value,
    pub fire_at: DateTime<Utc>,
    pub processed_on: Option<DateTime<Utc>>,
}

impl StoredEntry {
    pub fn instance(key: &str, spec: &RepeatSpec, fire_at: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            id: instance_id(key, spec, fire_at),
            key: key.to_string(),
            repeat: Some(spec.clone()),
            payload,
            fire_at,
            processed_on: None,
        }
    }

    pub fn single(key: &str, fire_at: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            id: single_id(key),
            key: key.to_string(),
            repeat: None,
            payload,
            fire_at,
            processed_on: None,
        }
    }

    pub fn with_state(self, state: EntryState) -> QueueEntry {
        QueueEntry { entry: self, state }
    }
}

/// An entry together with its current state
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub entry: StoredEntry,
    pub state: EntryState,
}

impl std::ops::Deref for QueueEntry {
    type Target = StoredEntry;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

/// Repeat record kept for each repeating entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatRecord {
    pub key: String,
    pub spec: RepeatSpec,
    pub payload: serde_json::Value,
    /// Fire time of the currently materialized instance
    pub next: Option<DateTime<Utc>>,
}

impl RepeatRecord {
    /// New record with its first instance scheduled after `now`
    pub fn new(
        key: &str,
        spec: &RepeatSpec,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Self, QueueError> {
        let mut record = Self {
            key: key.to_string(),
            spec: spec.clone(),
            payload,
            next: None,
        };
        record.advance(now)?;
        Ok(record)
    }

    pub fn field(&self) -> String {
        repeat_field(&self.key, &self.spec)
    }

    /// Move the chain to the first fire time after `now`
    pub fn advance(&mut self, now: DateTime<Utc>) -> Result<Option<StoredEntry>, QueueError> {
        self.next = self
            .spec
            .next_after(now)
            .map_err(|e| QueueError::InvalidRepeat(e.to_string()))?;
        Ok(self.current_instance())
    }

    /// The instance for the current fire time, if the chain has one
    pub fn current_instance(&self) -> Option<StoredEntry> {
        self.next
            .map(|fire_at| StoredEntry::instance(&self.key, &self.spec, fire_at, self.payload.clone()))
    }

    /// Whether claiming `entry` should advance this chain
    pub fn is_current(&self, entry: &StoredEntry) -> bool {
        self.next == Some(entry.fire_at)
    }
}

/// Instance ids are derived from key, spec and fire time, so re-adding the
/// same instance coalesces with the existing one
pub fn instance_id(key: &str, spec: &RepeatSpec, fire_at: DateTime<Utc>) -> String {
    format!("{}:{}:{}", key, spec.id(), fire_at.timestamp_millis())
}

pub fn single_id(key: &str) -> String {
    format!("{}:once", key)
}

pub fn repeat_field(key: &str, spec: &RepeatSpec) -> String {
    format!("{}::{}", key, spec.id())
}

/// A previously claimed repeating instance that is no longer the current
/// fire of its chain
pub fn is_superseded(record: Option<&RepeatRecord>, entry: &StoredEntry) -> bool {
    entry.repeat.is_some()
        && entry.processed_on.is_some()
        && !record.is_some_and(|record| record.is_current(entry))
}

/// State of an unclaimed entry at `now`
pub fn pending_state(fire_at: DateTime<Utc>, now: DateTime<Utc>) -> EntryState {
    if fire_at <= now {
        EntryState::Waiting
    } else {
        EntryState::Delayed
    }
}

/// Durable at-least-once work queue
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Register a repeating entry. Adding an existing (key, spec) pair only
    /// refreshes its payload.
    async fn add_repeating(
        &self,
        key: &str,
        spec: &RepeatSpec,
        payload: serde_json::Value,
    ) -> Result<(), QueueError>;

    /// Register a one-shot entry firing after `delay_ms`
    async fn add_delayed(
        &self,
        key: &str,
        delay_ms: u64,
        payload: serde_json::Value,
    ) -> Result<(), QueueError>;

    /// Remove a repeating entry and its pending instance. Only an identical
    /// spec matches; returns whether anything was removed.
    async fn remove_repeating(&self, key: &str, spec: &RepeatSpec) -> Result<bool, QueueError>;

    /// Remove a pending one-shot entry
    async fn remove_delayed(&self, key: &str) -> Result<bool, QueueError>;

    async fn list_repeating(&self) -> Result<Vec<RepeatRecord>, QueueError>;

    async fn list_entries(&self, states: &[EntryState]) -> Result<Vec<QueueEntry>, QueueError>;

    /// The one-shot entry for a key, in any state
    async fn get_entry(&self, key: &str) -> Result<Option<QueueEntry>, QueueError>;

    /// Claim up to `limit` due entries, marking them active under a fresh
    /// lease. Stalled claims are recovered first.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueEntry>, QueueError>;

    /// Extend the lease of a claim still held by `entry`; false if the claim
    /// was lost
    async fn renew_lease(&self, entry: &StoredEntry, now: DateTime<Utc>) -> Result<bool, QueueError>;

    /// Return claims whose lease expired at or before `now` to pending
    async fn recover_stalled(&self, now: DateTime<Utc>) -> Result<usize, QueueError>;

    /// Drop a claimed entry after its handlers ran. A claim whose lease
    /// expired in the meantime is left in place and runs again.
    async fn finish(&self, entry: &StoredEntry) -> Result<(), QueueError>;

    /// Number of pending and active entries
    async fn len(&self) -> Result<usize, QueueError>;
}
