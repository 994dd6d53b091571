// Redis-backed work queue
//
// Keys, all under the configured prefix:
// - `{prefix}:repeat`  hash, repeat field -> RepeatRecord JSON
// - `{prefix}:entries` hash, entry id -> StoredEntry JSON (pending and active)
// - `{prefix}:delayed` sorted set of pending entry ids scored by fire time (ms)
// - `{prefix}:active`  hash, claimed entry id -> ActiveClaim JSON
// - `{prefix}:leases`  sorted set of claimed entry ids scored by lease expiry (ms)
//
// A claim is owned by whoever removes the id from the sorted set; the
// removal, the active mark and the lease are written by one script.

use super::{
    is_superseded, pending_state, repeat_field, single_id, EntryState, OverlapPolicy, QueueEntry,
    RepeatRecord, StoredEntry, WorkQueue, DEFAULT_CLAIM_LEASE_SECS,
};
use crate::db::RedisPool;
use crate::errors::QueueError;
use crate::schedule::RepeatSpec;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument, warn};

/// KEYS: entries, delayed. ARGV: id, entry JSON, fire time
const INSERT_SCRIPT: &str = r#"
    if redis.call("hsetnx", KEYS[1], ARGV[1], ARGV[2]) == 1 then
        redis.call("zadd", KEYS[2], ARGV[3], ARGV[1])
        return 1
    end
    return 0
"#;

/// KEYS: entries, delayed. ARGV: id
const REMOVE_PENDING_SCRIPT: &str = r#"
    if redis.call("zrem", KEYS[2], ARGV[1]) == 1 then
        redis.call("hdel", KEYS[1], ARGV[1])
        return 1
    end
    return 0
"#;

/// KEYS: delayed, active, leases. ARGV: id, claim JSON, lease expiry
const CLAIM_SCRIPT: &str = r#"
    if redis.call("zrem", KEYS[1], ARGV[1]) == 0 then
        return 0
    end
    redis.call("hset", KEYS[2], ARGV[1], ARGV[2])
    redis.call("zadd", KEYS[3], ARGV[3], ARGV[1])
    return 1
"#;

/// KEYS: active, leases. ARGV: id, claim JSON, lease expiry
const RENEW_SCRIPT: &str = r#"
    if redis.call("hget", KEYS[1], ARGV[1]) == ARGV[2] then
        redis.call("zadd", KEYS[2], ARGV[3], ARGV[1])
        return 1
    end
    return 0
"#;

/// KEYS: entries, active, leases. ARGV: id, claim JSON
const RELEASE_SCRIPT: &str = r#"
    if redis.call("hget", KEYS[2], ARGV[1]) == ARGV[2] then
        redis.call("hdel", KEYS[2], ARGV[1])
        redis.call("zrem", KEYS[3], ARGV[1])
        redis.call("hdel", KEYS[1], ARGV[1])
        return 1
    end
    return 0
"#;

/// KEYS: leases, active, entries, delayed. ARGV: now
const RECOVER_SCRIPT: &str = r#"
    local stalled = redis.call("zrangebyscore", KEYS[1], "-inf", ARGV[1])
    for _, id in ipairs(stalled) do
        redis.call("zrem", KEYS[1], id)
        redis.call("hdel", KEYS[2], id)
        if redis.call("hexists", KEYS[3], id) == 1 then
            redis.call("zadd", KEYS[4], ARGV[1], id)
        end
    end
    return #stalled
"#;

/// Value of the active hash; identifies one particular claim of an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ActiveClaim {
    key: String,
    claimed_at: i64,
}

impl ActiveClaim {
    fn of(entry: &StoredEntry) -> Option<Self> {
        entry.processed_on.map(|at| Self {
            key: entry.key.clone(),
            claimed_at: at.timestamp_millis(),
        })
    }
}

/// Work queue stored in Redis
#[derive(Clone)]
pub struct RedisWorkQueue {
    pool: RedisPool,
    prefix: String,
    overlap_policy: OverlapPolicy,
    lease: Duration,
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, QueueError> {
    serde_json::from_str(raw).map_err(|e| QueueError::DeserializationFailed(e.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, QueueError> {
    Ok(serde_json::to_string(value)?)
}

impl RedisWorkQueue {
    pub fn new(pool: RedisPool, prefix: impl Into<String>, overlap_policy: OverlapPolicy) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            overlap_policy,
            lease: Duration::seconds(DEFAULT_CLAIM_LEASE_SECS as i64),
        }
    }

    pub fn with_claim_lease(mut self, lease: std::time::Duration) -> Self {
        self.lease = Duration::from_std(lease).unwrap_or(self.lease);
        self
    }

    fn repeat_key(&self) -> String {
        format!("{}:repeat", self.prefix)
    }

    fn entries_key(&self) -> String {
        format!("{}:entries", self.prefix)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.prefix)
    }

    fn leases_key(&self) -> String {
        format!("{}:leases", self.prefix)
    }

    fn lease_expiry(&self, now: DateTime<Utc>) -> i64 {
        (now + self.lease).timestamp_millis()
    }

    /// Store a pending entry unless one with the same id already exists
    async fn insert_if_absent(
        &self,
        conn: &mut ConnectionManager,
        entry: &StoredEntry,
    ) -> Result<(), QueueError> {
        let _: i32 = redis::Script::new(INSERT_SCRIPT)
            .key(self.entries_key())
            .key(self.delayed_key())
            .arg(&entry.id)
            .arg(encode(entry)?)
            .arg(entry.fire_at.timestamp_millis())
            .invoke_async(conn)
            .await?;
        Ok(())
    }

    /// Remove a pending entry; active entries are left alone
    async fn remove_pending(&self, conn: &mut ConnectionManager, id: &str) -> Result<bool, QueueError> {
        let removed: i32 = redis::Script::new(REMOVE_PENDING_SCRIPT)
            .key(self.entries_key())
            .key(self.delayed_key())
            .arg(id)
            .invoke_async(conn)
            .await?;
        Ok(removed == 1)
    }

    /// Drop a claimed entry if `claim` still identifies its holder
    async fn release(
        &self,
        conn: &mut ConnectionManager,
        id: &str,
        claim: &ActiveClaim,
    ) -> Result<bool, QueueError> {
        let released: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.entries_key())
            .key(self.active_key())
            .key(self.leases_key())
            .arg(id)
            .arg(encode(claim)?)
            .invoke_async(conn)
            .await?;
        Ok(released == 1)
    }

    async fn load_record(
        &self,
        conn: &mut ConnectionManager,
        field: &str,
    ) -> Result<Option<RepeatRecord>, QueueError> {
        let raw: Option<String> = conn.hget(self.repeat_key(), field).await?;
        raw.as_deref().map(decode).transpose()
    }

    async fn save_record(
        &self,
        conn: &mut ConnectionManager,
        record: &RepeatRecord,
    ) -> Result<(), QueueError> {
        let _: i64 = conn
            .hset(self.repeat_key(), record.field(), encode(record)?)
            .await?;
        Ok(())
    }

    async fn active_ids(&self, conn: &mut ConnectionManager) -> Result<HashSet<String>, QueueError> {
        let ids: Vec<String> = conn.hkeys(self.active_key()).await?;
        Ok(ids.into_iter().collect())
    }

    /// Whether another claim for the same key is still held
    async fn key_is_active(
        &self,
        conn: &mut ConnectionManager,
        entry: &StoredEntry,
    ) -> Result<bool, QueueError> {
        let claims: HashMap<String, String> = conn.hgetall(self.active_key()).await?;
        for (id, raw) in &claims {
            if *id != entry.id && decode::<ActiveClaim>(raw)?.key == entry.key {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Advance the repeat chain past a claimed instance
    async fn advance_chain(
        &self,
        conn: &mut ConnectionManager,
        mut record: RepeatRecord,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let next = record.advance(now)?;
        self.save_record(conn, &record).await?;
        if let Some(next) = next {
            self.insert_if_absent(conn, &next).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    #[instrument(skip(self, spec, payload), fields(spec = %spec))]
    async fn add_repeating(
        &self,
        key: &str,
        spec: &RepeatSpec,
        payload: serde_json::Value,
    ) -> Result<(), QueueError> {
        let mut conn = self.pool.get_connection();
        let field = repeat_field(key, spec);

        let record = match self.load_record(&mut conn, &field).await? {
            Some(mut existing) => {
                existing.payload = payload;
                existing
            }
            None => RepeatRecord::new(key, spec, payload, Utc::now())?,
        };

        self.save_record(&mut conn, &record).await?;
        if let Some(instance) = record.current_instance() {
            self.insert_if_absent(&mut conn, &instance).await?;
        }

        debug!(next = ?record.next, "Repeating entry registered");
        Ok(())
    }

    #[instrument(skip(self, payload))]
    async fn add_delayed(
        &self,
        key: &str,
        delay_ms: u64,
        payload: serde_json::Value,
    ) -> Result<(), QueueError> {
        let mut conn = self.pool.get_connection();
        let fire_at = Utc::now() + Duration::milliseconds(delay_ms as i64);
        self.insert_if_absent(&mut conn, &StoredEntry::single(key, fire_at, payload))
            .await
    }

    #[instrument(skip(self, spec), fields(spec = %spec))]
    async fn remove_repeating(&self, key: &str, spec: &RepeatSpec) -> Result<bool, QueueError> {
        let mut conn = self.pool.get_connection();
        let field = repeat_field(key, spec);

        let Some(record) = self.load_record(&mut conn, &field).await? else {
            debug!("No repeating entry matches the given spec");
            return Ok(false);
        };

        let _: i64 = conn.hdel(self.repeat_key(), &field).await?;
        if let Some(instance) = record.current_instance() {
            self.remove_pending(&mut conn, &instance.id).await?;
        }
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn remove_delayed(&self, key: &str) -> Result<bool, QueueError> {
        let mut conn = self.pool.get_connection();
        self.remove_pending(&mut conn, &single_id(key)).await
    }

    async fn list_repeating(&self) -> Result<Vec<RepeatRecord>, QueueError> {
        let mut conn = self.pool.get_connection();
        let raw: Vec<String> = conn.hvals(self.repeat_key()).await?;
        raw.iter().map(|r| decode(r)).collect()
    }

    async fn list_entries(&self, states: &[EntryState]) -> Result<Vec<QueueEntry>, QueueError> {
        let mut conn = self.pool.get_connection();
        let raw: HashMap<String, String> = conn.hgetall(self.entries_key()).await?;
        let active = self.active_ids(&mut conn).await?;
        let now = Utc::now();

        let mut entries = Vec::new();
        for value in raw.values() {
            let entry: StoredEntry = decode(value)?;
            let state = if active.contains(&entry.id) {
                EntryState::Active
            } else {
                pending_state(entry.fire_at, now)
            };
            if states.contains(&state) {
                entries.push(entry.with_state(state));
            }
        }
        Ok(entries)
    }

    async fn get_entry(&self, key: &str) -> Result<Option<QueueEntry>, QueueError> {
        let mut conn = self.pool.get_connection();
        let id = single_id(key);
        let raw: Option<String> = conn.hget(self.entries_key(), &id).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let entry: StoredEntry = decode(&raw)?;
        let is_active: bool = conn.hexists(self.active_key(), &id).await?;
        let state = if is_active {
            EntryState::Active
        } else {
            pending_state(entry.fire_at, Utc::now())
        };
        Ok(Some(entry.with_state(state)))
    }

    #[instrument(skip(self))]
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        self.recover_stalled(now).await?;

        let mut conn = self.pool.get_connection();
        let due: Vec<String> = conn
            .zrangebyscore_limit(
                self.delayed_key(),
                "-inf",
                now.timestamp_millis(),
                0,
                limit as isize,
            )
            .await?;

        let mut claimed = Vec::new();
        for id in due {
            let raw: Option<String> = conn.hget(self.entries_key(), &id).await?;
            let Some(raw) = raw else {
                let _: i64 = conn.zrem(self.delayed_key(), &id).await?;
                continue;
            };
            let stored: StoredEntry = decode(&raw)?;

            let mut entry = stored.clone();
            entry.processed_on = Some(now);
            let claim = ActiveClaim {
                key: entry.key.clone(),
                claimed_at: now.timestamp_millis(),
            };

            let won: i32 = redis::Script::new(CLAIM_SCRIPT)
                .key(self.delayed_key())
                .key(self.active_key())
                .key(self.leases_key())
                .arg(&id)
                .arg(encode(&claim)?)
                .arg(self.lease_expiry(now))
                .invoke_async(&mut conn)
                .await?;
            if won == 0 {
                // Claimed by another worker
                continue;
            }

            if let Some(spec) = entry.repeat.clone() {
                let record = self
                    .load_record(&mut conn, &repeat_field(&entry.key, &spec))
                    .await?;

                if is_superseded(record.as_ref(), &stored) {
                    debug!(entry_id = %entry.id, "Dropping stalled fire superseded by its chain");
                    self.release(&mut conn, &id, &claim).await?;
                    continue;
                }

                // Stored before advancing so a crash in between is seen as a
                // claimed instance that is still current
                let _: i64 = conn.hset(self.entries_key(), &id, encode(&entry)?).await?;
                if let Some(record) = record.filter(|r| r.is_current(&entry)) {
                    self.advance_chain(&mut conn, record, now).await?;
                }

                if self.overlap_policy == OverlapPolicy::Skip && self.key_is_active(&mut conn, &entry).await? {
                    debug!(entry_id = %entry.id, key = %entry.key, "Skipping overlapping fire");
                    self.release(&mut conn, &id, &claim).await?;
                    continue;
                }
            } else {
                let _: i64 = conn.hset(self.entries_key(), &id, encode(&entry)?).await?;
            }

            claimed.push(entry.with_state(EntryState::Active));
        }

        Ok(claimed)
    }

    async fn renew_lease(&self, entry: &StoredEntry, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let Some(claim) = ActiveClaim::of(entry) else {
            return Ok(false);
        };
        let mut conn = self.pool.get_connection();
        let renewed: i32 = redis::Script::new(RENEW_SCRIPT)
            .key(self.active_key())
            .key(self.leases_key())
            .arg(&entry.id)
            .arg(encode(&claim)?)
            .arg(self.lease_expiry(now))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn recover_stalled(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.pool.get_connection();
        let recovered: usize = redis::Script::new(RECOVER_SCRIPT)
            .key(self.leases_key())
            .key(self.active_key())
            .key(self.entries_key())
            .key(self.delayed_key())
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        if recovered > 0 {
            warn!(recovered, "Claim leases expired, entries returned to pending");
        }
        Ok(recovered)
    }

    async fn finish(&self, entry: &StoredEntry) -> Result<(), QueueError> {
        let Some(claim) = ActiveClaim::of(entry) else {
            return Ok(());
        };
        let mut conn = self.pool.get_connection();
        if !self.release(&mut conn, &entry.id, &claim).await? {
            debug!(entry_id = %entry.id, "Claim no longer held, entry left in place");
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.pool.get_connection();
        let len: usize = conn.hlen(self.entries_key()).await?;
        Ok(len)
    }
}
