use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use handoff_model::SessionId;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;

/// Well-known slot names shared by the coordinator and the workers.
pub mod slots {
    /// Caller-supplied workflow input.
    pub const INPUT: &str = "input";
    /// Output of the PREDICT step.
    pub const PREDICTION_RESULT: &str = "prediction_result";
    /// Location of the rendered report.
    pub const REPORT_PATH: &str = "report_path";
}

#[derive(Debug)]
struct SessionEntry {
    slots: HashMap<String, Value>,
    last_touched_at: DateTime<Utc>,
    // Set under the entry lock once the entry leaves the map so that a writer
    // holding a stale handle retries against a fresh entry.
    evicted: bool,
}

impl SessionEntry {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            slots: HashMap::new(),
            last_touched_at: now,
            evicted: false,
        }
    }
}

type EntryCell = Arc<Mutex<SessionEntry>>;

/// Keyed scratch space that lets workflow steps share intermediate data.
///
/// Sessions are created lazily on first write and disappear either through
/// [`SessionCache::close`] or after `ttl` without a write or successful read.
pub struct SessionCache {
    entries: DashMap<SessionId, EntryCell>,
    ttl: Duration,
}

impl fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCache")
            .field("sessions", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entry(&self, session_id: &SessionId) -> EntryCell {
        let now = Utc::now();
        Arc::clone(
            self.entries
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(SessionEntry::new(now))))
                .value(),
        )
    }

    fn existing(&self, session_id: &SessionId) -> Option<EntryCell> {
        self.entries
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Writes `value` under `slot`, creating the session when absent.
    pub async fn put(&self, session_id: &SessionId, slot: &str, value: Value) {
        loop {
            let cell = self.entry(session_id);
            let mut entry = cell.lock().await;
            if entry.evicted {
                continue;
            }
            entry.slots.insert(slot.to_string(), value);
            entry.last_touched_at = Utc::now();
            return;
        }
    }

    /// Reads `slot`. Only a hit refreshes the idle timer.
    pub async fn get(&self, session_id: &SessionId, slot: &str) -> Option<Value> {
        let cell = self.existing(session_id)?;
        let mut entry = cell.lock().await;
        if entry.evicted {
            return None;
        }
        let value = entry.slots.get(slot).cloned()?;
        entry.last_touched_at = Utc::now();
        Some(value)
    }

    pub async fn put_json<T: Serialize>(
        &self,
        session_id: &SessionId,
        slot: &str,
        value: &T,
    ) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.put(session_id, slot, value).await;
        Ok(())
    }

    /// Typed read of `slot`; a missing slot is `Ok(None)`, a slot of the
    /// wrong shape is a serialization error.
    pub async fn get_as<T: DeserializeOwned>(
        &self,
        session_id: &SessionId,
        slot: &str,
    ) -> Result<Option<T>> {
        match self.get(session_id, slot).await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Slot names currently held for `session_id`, sorted.
    pub async fn slots(&self, session_id: &SessionId) -> Vec<String> {
        let Some(cell) = self.existing(session_id) else {
            return Vec::new();
        };
        let entry = cell.lock().await;
        if entry.evicted {
            return Vec::new();
        }
        let mut names: Vec<String> = entry.slots.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drops a single slot, keeping the rest of the session.
    pub async fn remove(&self, session_id: &SessionId, slot: &str) -> Option<Value> {
        let cell = self.existing(session_id)?;
        let mut entry = cell.lock().await;
        if entry.evicted {
            return None;
        }
        entry.slots.remove(slot)
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.entries.contains_key(session_id)
    }

    /// Removes the whole session. Returns whether anything was removed.
    pub async fn close(&self, session_id: &SessionId) -> bool {
        let Some((_, cell)) = self.entries.remove(session_id) else {
            return false;
        };
        cell.lock().await.evicted = true;
        debug!(target: "handoff::sessions", session_id = %session_id, "session closed");
        true
    }

    /// Evicts sessions idle for longer than the configured TTL.
    pub async fn evict_expired(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.evict_idle_before(cutoff).await
    }

    /// Evicts sessions whose last touch is at or before `cutoff`. Entries that
    /// are locked by an in-flight access are left for the next pass.
    pub async fn evict_idle_before(&self, cutoff: DateTime<Utc>) -> usize {
        let candidates: Vec<SessionId> =
            self.entries.iter().map(|entry| entry.key().clone()).collect();

        let mut evicted = 0;
        for session_id in candidates {
            let removed = self.entries.remove_if(&session_id, |_, cell| {
                match cell.try_lock() {
                    Ok(mut entry) if entry.last_touched_at <= cutoff => {
                        entry.evicted = true;
                        true
                    }
                    _ => false,
                }
            });
            if removed.is_some() {
                evicted += 1;
                debug!(target: "handoff::sessions", session_id = %session_id, "session evicted");
            }
        }

        if evicted > 0 {
            info!(target: "handoff::sessions", evicted, "evicted idle sessions");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
