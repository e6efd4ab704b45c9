use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::MIN_TICK;
use super::coordinator::Coordinator;
use super::flag_store::ActionFlagStore;
use super::session_cache::SessionCache;

/// Outcome of a single sweep pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Flags moved to `expired` by this pass.
    pub flags_expired: usize,
    /// Candidates that resolved between the scan and the expiry attempt.
    pub flags_raced: usize,
    /// Resolved flags dropped after the retention window.
    pub flags_purged: usize,
    pub sessions_evicted: usize,
    /// Finished workflow statuses dropped after their retention window.
    pub workflows_pruned: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Periodically expires overdue flags and evicts idle sessions.
///
/// At most one pass runs at a time; a tick that arrives while another pass
/// holds the guard is skipped rather than queued.
#[derive(Debug)]
pub struct ExpirySweeper {
    store: Arc<ActionFlagStore>,
    sessions: Arc<SessionCache>,
    coordinator: Option<Arc<Coordinator>>,
    interval: Duration,
    retain_resolved: Duration,
    running: Mutex<()>,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<ActionFlagStore>,
        sessions: Arc<SessionCache>,
        interval: Duration,
        retain_resolved: Duration,
    ) -> Self {
        Self {
            store,
            sessions,
            coordinator: None,
            interval: interval.max(MIN_TICK),
            retain_resolved,
            running: Mutex::new(()),
        }
    }

    /// Also prunes finished workflow statuses held by `coordinator`.
    pub fn with_coordinator(mut self, coordinator: Arc<Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn tick(&self) -> Option<SweepReport> {
        self.tick_at(Utc::now()).await
    }

    /// Runs one pass against `now`. Returns `None` when another pass is in
    /// flight.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Option<SweepReport> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!(target: "handoff::sweeper", "sweep already in progress; skipping tick");
            return None;
        };

        let mut report = SweepReport::default();
        for flag_id in self.store.expired_candidates(now).await {
            if self.store.expire(flag_id).await {
                report.flags_expired += 1;
            } else {
                report.flags_raced += 1;
            }
        }

        let retain = chrono::Duration::from_std(self.retain_resolved)
            .unwrap_or(chrono::Duration::MAX);
        if let Some(cutoff) = now.checked_sub_signed(retain) {
            report.flags_purged = self.store.purge_resolved(cutoff).await;
        }
        report.sessions_evicted = self.sessions.evict_expired().await;
        if let Some(coordinator) = &self.coordinator {
            report.workflows_pruned = coordinator.prune_finished(now);
        }

        if report.flags_expired > 0 {
            warn!(
                target: "handoff::sweeper",
                expired = report.flags_expired,
                "expired overdue flags"
            );
        }
        if !report.is_empty() {
            info!(
                target: "handoff::sweeper",
                expired = report.flags_expired,
                raced = report.flags_raced,
                purged = report.flags_purged,
                sessions_evicted = report.sessions_evicted,
                workflows_pruned = report.workflows_pruned,
                "sweep finished"
            );
        }
        Some(report)
    }

    /// Runs [`ExpirySweeper::tick`] every `interval` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of an interval completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(target: "handoff::sweeper", "sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handoff_model::{FlagId, FlagStatus, FlagType, SessionId, WorkerId};
    use serde_json::json;

    use crate::orchestration::collaborators::InMemoryPersistence;
    use crate::orchestration::config::{CoordinatorConfig, FlagConfig};
    use crate::orchestration::coordinator::{SubmitRequest, WorkflowStatus};
    use crate::orchestration::events::NoopPublisher;
    use crate::orchestration::runtime::event_bus::EventBus;
    use crate::orchestration::session_cache::slots;

    fn fixture() -> (Arc<ActionFlagStore>, Arc<SessionCache>, ExpirySweeper) {
        let store = Arc::new(ActionFlagStore::new(Arc::new(NoopPublisher)));
        let sessions = Arc::new(SessionCache::new(Duration::from_secs(60)));
        let sweeper = ExpirySweeper::new(
            Arc::clone(&store),
            Arc::clone(&sessions),
            Duration::from_millis(10),
            Duration::from_secs(600),
        );
        (store, sessions, sweeper)
    }

    fn create(store: &ActionFlagStore, flag_type: FlagType, ttl_secs: u64) -> FlagId {
        store.create(
            flag_type,
            SessionId::from("S1"),
            json!({}),
            0,
            Duration::from_secs(ttl_secs),
        )
    }

    #[tokio::test]
    async fn expires_overdue_flags_in_any_open_state() {
        let (store, _, sweeper) = fixture();
        let pending = create(&store, FlagType::Predict, 1);
        let claimed = create(&store, FlagType::Predict, 1);
        let fresh = create(&store, FlagType::Predict, 3600);
        assert!(store.claim(claimed, &WorkerId::from("w1")).await);

        let later = Utc::now() + chrono::Duration::seconds(5);
        let report = sweeper.tick_at(later).await.expect("guard free");
        assert_eq!(report.flags_expired, 2);
        assert_eq!(report.flags_raced, 0);

        assert_eq!(store.get(pending).await.unwrap().status, FlagStatus::Expired);
        assert_eq!(store.get(claimed).await.unwrap().status, FlagStatus::Expired);
        assert_eq!(store.get(fresh).await.unwrap().status, FlagStatus::Pending);
        assert!(!store.complete(claimed, json!({})).await);
    }

    #[tokio::test]
    async fn resolved_flags_are_never_expired() {
        let (store, _, sweeper) = fixture();
        let id = create(&store, FlagType::GenerateReport, 1);
        assert!(store.claim(id, &WorkerId::from("w1")).await);
        assert!(store.complete(id, json!({ "path": "/r.pdf" })).await);

        let report = sweeper
            .tick_at(Utc::now() + chrono::Duration::seconds(5))
            .await
            .expect("guard free");
        assert_eq!(report.flags_expired, 0);
        assert_eq!(store.get(id).await.unwrap().status, FlagStatus::Completed);
    }

    #[tokio::test]
    async fn concurrent_tick_is_skipped() {
        let (_, _, sweeper) = fixture();
        let _held = sweeper.running.lock().await;
        assert!(sweeper.tick().await.is_none());
    }

    #[tokio::test]
    async fn evicts_idle_sessions() {
        let store = Arc::new(ActionFlagStore::new(Arc::new(NoopPublisher)));
        let sessions = Arc::new(SessionCache::new(Duration::ZERO));
        let sweeper = ExpirySweeper::new(
            store,
            Arc::clone(&sessions),
            Duration::from_millis(10),
            Duration::from_secs(600),
        );
        sessions.put(&SessionId::from("S1"), slots::INPUT, json!(1)).await;
        tokio::time::sleep(Duration::from_millis(2)).await;

        let report = sweeper.tick().await.expect("guard free");
        assert_eq!(report.sessions_evicted, 1);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_cancel() {
        let (_, _, sweeper) = fixture();
        let token = CancellationToken::new();
        let handle = Arc::new(sweeper).spawn(token.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits")
            .expect("no panic");
    }

    #[tokio::test]
    async fn prunes_finished_workflow_statuses() {
        let bus = Arc::new(EventBus::new(16));
        let store = Arc::new(ActionFlagStore::new(bus.clone()));
        let sessions = Arc::new(SessionCache::new(Duration::from_secs(60)));
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&store),
            bus,
            Arc::clone(&sessions),
            Arc::new(InMemoryPersistence::new()),
            FlagConfig::default(),
            CoordinatorConfig {
                recheck_interval_ms: 10,
                retain_finished_secs: 60,
                ..CoordinatorConfig::default()
            },
            CancellationToken::new(),
        ));
        let sweeper = ExpirySweeper::new(
            Arc::clone(&store),
            sessions,
            Duration::from_millis(10),
            Duration::from_secs(600),
        )
        .with_coordinator(Arc::clone(&coordinator));

        for n in 0..5 {
            let session = coordinator
                .submit(SubmitRequest::new(json!({})).with_session(format!("S{n}")))
                .await
                .expect("submit");
            let flag = loop {
                if let Some(flag) = store.flags_for_session(&session).await.first() {
                    break flag.id;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            };
            assert!(store.expire(flag).await);
            let status = coordinator.await_status(&session).await.expect("status");
            assert!(matches!(status, WorkflowStatus::Error { .. }));
        }
        assert_eq!(coordinator.tracked(), 5);

        let report = sweeper.tick().await.expect("guard free");
        assert_eq!(report.workflows_pruned, 0);

        let report = sweeper
            .tick_at(Utc::now() + chrono::Duration::seconds(61))
            .await
            .expect("guard free");
        assert_eq!(report.workflows_pruned, 5);
        assert_eq!(report.flags_purged, 0);
        assert_eq!(coordinator.tracked(), 0);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let (store, sessions, _) = fixture();
        let sweeper = ExpirySweeper::new(store, sessions, Duration::ZERO, Duration::ZERO);
        assert_eq!(sweeper.interval(), MIN_TICK);
    }
}
