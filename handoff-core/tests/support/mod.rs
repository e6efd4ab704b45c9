//! Shared wiring and scripted collaborators for core integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use handoff_core::HandoffError;
use handoff_core::model::{FlagId, FlagType};
use handoff_core::orchestration::{
    ActionFlagStore, Coordinator, CoordinatorConfig, EventBus, ExpirySweeper, FlagConfig,
    InMemoryPersistence, InferenceCollaborator, SessionCache, SynthesisCollaborator,
};

/// Store, bus, cache, sweeper and coordinator wired the way the runtime wires
/// them, without any workers running.
pub struct Fixture {
    pub bus: Arc<EventBus>,
    pub store: Arc<ActionFlagStore>,
    pub sessions: Arc<SessionCache>,
    pub sweeper: Arc<ExpirySweeper>,
    pub persistence: Arc<InMemoryPersistence>,
    pub coordinator: Arc<Coordinator>,
    pub shutdown: CancellationToken,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let shutdown = CancellationToken::new();
        let bus = Arc::new(EventBus::new(capacity));
        let store = Arc::new(ActionFlagStore::new(bus.clone()));
        let sessions = Arc::new(SessionCache::new(Duration::from_secs(60)));
        let persistence = Arc::new(InMemoryPersistence::new());
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&sessions),
            persistence.clone(),
            FlagConfig::default(),
            CoordinatorConfig {
                recheck_interval_ms: 25,
                ..CoordinatorConfig::default()
            },
            shutdown.child_token(),
        ));
        let sweeper = Arc::new(
            ExpirySweeper::new(
                Arc::clone(&store),
                Arc::clone(&sessions),
                Duration::from_millis(20),
                Duration::from_secs(600),
            )
            .with_coordinator(Arc::clone(&coordinator)),
        );

        Self {
            bus,
            store,
            sessions,
            sweeper,
            persistence,
            coordinator,
            shutdown,
        }
    }

    /// Polls until a pending flag of `flag_type` shows up.
    pub async fn wait_for_pending(&self, flag_type: FlagType) -> Result<FlagId> {
        for _ in 0..400 {
            if let Some(flag) = self.store.list_pending(flag_type).await.into_iter().next() {
                return Ok(flag.id);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        bail!("no pending {flag_type} flag appeared")
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Inference collaborator that answers every call with the same outcome.
pub struct ScriptedInference {
    outcome: std::result::Result<Value, String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedInference {
    pub fn ok(result: Value) -> Self {
        Self {
            outcome: Ok(result),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            outcome: Err(reason.to_string()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceCollaborator for ScriptedInference {
    async fn run(&self, _input: &Value) -> handoff_core::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome
            .clone()
            .map_err(HandoffError::Collaborator)
    }
}

/// Synthesis collaborator that renders to `{dir}/{session_id}.pdf`.
pub struct ScriptedSynthesis {
    dir: String,
    calls: AtomicUsize,
}

impl ScriptedSynthesis {
    pub fn new(dir: &str) -> Self {
        Self {
            dir: dir.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisCollaborator for ScriptedSynthesis {
    async fn render(&self, inputs: &Value) -> handoff_core::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let session = inputs["session_id"].as_str().unwrap_or("unknown");
        Ok(format!("{}/{session}.pdf", self.dir))
    }
}
