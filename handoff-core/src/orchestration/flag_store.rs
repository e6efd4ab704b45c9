use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use handoff_model::{
    ActionFlag, FlagEvent, FlagId, FlagStatus, FlagType, LifecycleKind, SessionId, WorkerId,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::events::FlagEventPublisher;

type FlagCell = Arc<Mutex<ActionFlag>>;

/// Per-status counts at a single instant.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FlagStoreSnapshot {
    pub sampled_at: Option<DateTime<Utc>>,
    pub by_status: HashMap<FlagStatus, usize>,
}

impl FlagStoreSnapshot {
    pub fn count(&self, status: FlagStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.by_status.values().sum()
    }
}

/// Authoritative owner of every action flag.
///
/// Each flag lives behind its own mutex, so transitions on one flag are
/// strictly serialized while unrelated flags never contend. Callers only ever
/// receive snapshot copies. Transition methods return `false` instead of
/// erroring when the state machine rejects them: racing a worker against the
/// sweeper is expected.
pub struct ActionFlagStore {
    flags: DashMap<FlagId, FlagCell>,
    events: Arc<dyn FlagEventPublisher>,
}

impl fmt::Debug for ActionFlagStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionFlagStore")
            .field("flag_count", &self.flags.len())
            .finish()
    }
}

impl ActionFlagStore {
    pub fn new(events: Arc<dyn FlagEventPublisher>) -> Self {
        Self {
            flags: DashMap::new(),
            events,
        }
    }

    fn cell(&self, flag_id: FlagId) -> Option<FlagCell> {
        self.flags.get(&flag_id).map(|entry| Arc::clone(entry.value()))
    }

    fn cells(&self) -> Vec<FlagCell> {
        self.flags.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Registers a new pending flag and announces it on `created_{type}`.
    pub fn create(
        &self,
        flag_type: FlagType,
        session_id: SessionId,
        payload: Value,
        priority: i32,
        ttl: Duration,
    ) -> FlagId {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let flag = ActionFlag::new(flag_type, session_id, payload, priority, ttl);
        let flag_id = flag.id;
        let event = FlagEvent::from_flag(
            LifecycleKind::Created,
            &flag,
            json!({ "priority": flag.priority, "expires_at": flag.expires_at }),
        );

        debug!(
            target: "handoff::store",
            flag_id = %flag_id,
            flag_type = %flag_type,
            session_id = %flag.session_id,
            priority,
            "flag created"
        );
        self.flags.insert(flag_id, Arc::new(Mutex::new(flag)));
        self.events.publish(event);
        flag_id
    }

    pub async fn get(&self, flag_id: FlagId) -> Option<ActionFlag> {
        let cell = self.cell(flag_id)?;
        let flag = cell.lock().await;
        Some(flag.clone())
    }

    /// Pending flags of `flag_type` that are still within their deadline,
    /// highest priority first, then oldest first.
    pub async fn list_pending(&self, flag_type: FlagType) -> Vec<ActionFlag> {
        let now = Utc::now();
        let mut pending = Vec::new();
        for cell in self.cells() {
            let flag = cell.lock().await;
            if flag.flag_type == flag_type
                && flag.status == FlagStatus::Pending
                && !flag.is_past_deadline(now)
            {
                pending.push(flag.clone());
            }
        }
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        pending
    }

    /// All flags spawned for `session_id`, oldest first.
    pub async fn flags_for_session(&self, session_id: &SessionId) -> Vec<ActionFlag> {
        let mut flags = Vec::new();
        for cell in self.cells() {
            let flag = cell.lock().await;
            if &flag.session_id == session_id {
                flags.push(flag.clone());
            }
        }
        flags.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        flags
    }

    /// Atomically moves a pending flag to `claimed`. Under any number of
    /// concurrent callers exactly one succeeds; the claimant is recorded once
    /// and never overwritten.
    pub async fn claim(&self, flag_id: FlagId, claimant: &WorkerId) -> bool {
        let Some(cell) = self.cell(flag_id) else {
            debug!(target: "handoff::store", flag_id = %flag_id, "claim on unknown flag");
            return false;
        };

        let event = {
            let mut flag = cell.lock().await;
            let now = Utc::now();
            if !flag.status.can_transition_to(FlagStatus::Claimed) {
                debug!(
                    target: "handoff::store",
                    flag_id = %flag_id,
                    claimant = %claimant,
                    status = %flag.status,
                    "claim conflict"
                );
                return false;
            }
            if flag.is_past_deadline(now) {
                debug!(
                    target: "handoff::store",
                    flag_id = %flag_id,
                    claimant = %claimant,
                    "claim rejected; flag is past its deadline"
                );
                return false;
            }

            flag.status = FlagStatus::Claimed;
            flag.claimant_id = Some(claimant.clone());
            flag.claimed_at = Some(now);
            FlagEvent::from_flag(
                LifecycleKind::Claimed,
                &flag,
                json!({ "claimant_id": claimant }),
            )
        };

        debug!(target: "handoff::store", flag_id = %flag_id, claimant = %claimant, "flag claimed");
        self.events.publish(event);
        true
    }

    /// Advisory `claimed -> in_progress` transition.
    pub async fn begin_processing(&self, flag_id: FlagId) -> bool {
        self.transition(flag_id, FlagStatus::InProgress, |_| Value::Null)
            .await
    }

    /// Records `result` and resolves the flag as completed. Rejected when the
    /// flag was expired or already resolved in the meantime.
    pub async fn complete(&self, flag_id: FlagId, result: Value) -> bool {
        let mut result = Some(result);
        self.transition(flag_id, FlagStatus::Completed, |flag| {
            flag.result = result.take();
            flag.resolved_at = Some(Utc::now());
            json!({ "result": flag.result })
        })
        .await
    }

    /// Records `error` and resolves the flag as failed.
    pub async fn fail(&self, flag_id: FlagId, error: impl Into<String>) -> bool {
        let mut error = Some(error.into());
        self.transition(flag_id, FlagStatus::Failed, |flag| {
            flag.error = error.take();
            flag.resolved_at = Some(Utc::now());
            json!({ "error": flag.error })
        })
        .await
    }

    /// Moves a non-terminal flag to `expired`. Reserved for the sweeper;
    /// completed and failed flags are left untouched.
    pub async fn expire(&self, flag_id: FlagId) -> bool {
        self.transition(flag_id, FlagStatus::Expired, |flag| {
            flag.resolved_at = Some(Utc::now());
            json!({ "expires_at": flag.expires_at, "claimant_id": flag.claimant_id })
        })
        .await
    }

    async fn transition<F>(&self, flag_id: FlagId, next: FlagStatus, apply: F) -> bool
    where
        F: FnOnce(&mut ActionFlag) -> Value,
    {
        let kind = match next {
            FlagStatus::InProgress => LifecycleKind::InProgress,
            FlagStatus::Completed => LifecycleKind::Completed,
            FlagStatus::Failed => LifecycleKind::Failed,
            FlagStatus::Expired => LifecycleKind::Expired,
            // Claims carry a claimant and go through `claim`.
            FlagStatus::Pending | FlagStatus::Claimed => return false,
        };
        let Some(cell) = self.cell(flag_id) else {
            debug!(
                target: "handoff::store",
                flag_id = %flag_id,
                next = %next,
                "transition on unknown flag"
            );
            return false;
        };

        let event = {
            let mut flag = cell.lock().await;
            let current = flag.status;
            if !current.can_transition_to(next) {
                if current == FlagStatus::Expired
                    && matches!(next, FlagStatus::Completed | FlagStatus::Failed)
                {
                    warn!(
                        target: "handoff::store",
                        flag_id = %flag_id,
                        flag_type = %flag.flag_type,
                        session_id = %flag.session_id,
                        attempted = %next,
                        "flag expired before completion; discarding outcome"
                    );
                } else {
                    debug!(
                        target: "handoff::store",
                        flag_id = %flag_id,
                        current = %current,
                        attempted = %next,
                        "transition rejected"
                    );
                }
                return false;
            }

            flag.status = next;
            let payload = apply(&mut *flag);
            FlagEvent::from_flag(kind, &flag, payload)
        };

        debug!(target: "handoff::store", flag_id = %flag_id, status = %next, "flag transitioned");
        self.events.publish(event);
        true
    }

    /// Ids of non-terminal flags whose deadline is at or before `now`.
    pub async fn expired_candidates(&self, now: DateTime<Utc>) -> Vec<FlagId> {
        let mut due = Vec::new();
        for cell in self.cells() {
            let flag = cell.lock().await;
            if !flag.is_terminal() && flag.is_past_deadline(now) {
                due.push(flag.id);
            }
        }
        due
    }

    /// Drops terminal flags resolved before `cutoff`. Returns how many were
    /// removed.
    pub async fn purge_resolved(&self, cutoff: DateTime<Utc>) -> usize {
        let mut stale = Vec::new();
        for cell in self.cells() {
            let flag = cell.lock().await;
            if flag.is_terminal() && flag.resolved_at.is_some_and(|at| at < cutoff) {
                stale.push(flag.id);
            }
        }

        let purged = stale
            .into_iter()
            .filter(|id| self.flags.remove(id).is_some())
            .count();
        if purged > 0 {
            info!(target: "handoff::store", purged, "purged resolved flags");
        }
        purged
    }

    pub async fn snapshot(&self) -> FlagStoreSnapshot {
        let mut snapshot = FlagStoreSnapshot {
            sampled_at: Some(Utc::now()),
            by_status: HashMap::new(),
        };
        for cell in self.cells() {
            let status = cell.lock().await.status;
            *snapshot.by_status.entry(status).or_default() += 1;
        }
        snapshot
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}
