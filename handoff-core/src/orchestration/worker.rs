use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use handoff_model::{ActionFlag, FlagId, FlagType, LifecycleKind, WorkerId};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::collaborators::{InferenceCollaborator, SynthesisCollaborator};
use super::config::MIN_TICK;
use super::flag_store::ActionFlagStore;
use super::retry::RetryPolicy;
use super::runtime::event_bus::EventBus;
use super::session_cache::{SessionCache, slots};
use crate::error::{HandoffError, Result};

/// The unit of work a worker performs once it owns a flag.
///
/// Implementations invoke a collaborator with the flag payload, park large
/// artefacts in the session cache and return a small summary that becomes the
/// flag's `result`.
#[async_trait]
pub trait FlagTask: Send + Sync {
    fn flag_type(&self) -> FlagType;

    async fn execute(&self, flag: &ActionFlag, sessions: &SessionCache) -> Result<Value>;
}

/// Runs inference over the workflow input carried by a PREDICT flag.
pub struct PredictionTask {
    inference: Arc<dyn InferenceCollaborator>,
}

impl PredictionTask {
    pub fn new(inference: Arc<dyn InferenceCollaborator>) -> Self {
        Self { inference }
    }
}

impl fmt::Debug for PredictionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictionTask").finish_non_exhaustive()
    }
}

#[async_trait]
impl FlagTask for PredictionTask {
    fn flag_type(&self) -> FlagType {
        FlagType::Predict
    }

    async fn execute(&self, flag: &ActionFlag, sessions: &SessionCache) -> Result<Value> {
        let prediction = self.inference.run(&flag.payload).await?;
        sessions
            .put(&flag.session_id, slots::PREDICTION_RESULT, prediction.clone())
            .await;
        Ok(prediction)
    }
}

/// Renders the report for a GENERATE_REPORT flag.
pub struct ReportTask {
    synthesis: Arc<dyn SynthesisCollaborator>,
}

impl ReportTask {
    pub fn new(synthesis: Arc<dyn SynthesisCollaborator>) -> Self {
        Self { synthesis }
    }

    /// Prediction and input for the renderer. The session cache is
    /// authoritative; the values the coordinator carried forward in the
    /// payload cover sessions the sweeper already evicted.
    async fn inputs(flag: &ActionFlag, sessions: &SessionCache) -> Value {
        let prediction = match sessions.get(&flag.session_id, slots::PREDICTION_RESULT).await {
            Some(value) => value,
            None => flag.payload["previous"]["result"].clone(),
        };
        let input = match sessions.get(&flag.session_id, slots::INPUT).await {
            Some(value) => value,
            None => flag.payload["input"].clone(),
        };
        json!({
            "session_id": flag.session_id,
            "prediction": prediction,
            "input": input,
        })
    }
}

impl fmt::Debug for ReportTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportTask").finish_non_exhaustive()
    }
}

#[async_trait]
impl FlagTask for ReportTask {
    fn flag_type(&self) -> FlagType {
        FlagType::GenerateReport
    }

    async fn execute(&self, flag: &ActionFlag, sessions: &SessionCache) -> Result<Value> {
        let inputs = Self::inputs(flag, sessions).await;
        let path = self.synthesis.render(&inputs).await?;
        sessions
            .put(&flag.session_id, slots::REPORT_PATH, Value::String(path.clone()))
            .await;
        Ok(json!({ "path": path }))
    }
}

/// What happened to a single flag a worker tried to process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkOutcome {
    Completed,
    Failed,
    /// Another worker won the claim.
    Conflict,
    /// The flag expired while this worker held it; the outcome was dropped.
    Discarded,
}

impl WorkOutcome {
    /// Whether this worker resolved the flag.
    pub fn resolved(&self) -> bool {
        matches!(self, WorkOutcome::Completed | WorkOutcome::Failed)
    }
}

/// A single worker instance bound to one flag type.
///
/// Discovery is redundant on purpose: `created_{type}` events give low latency
/// and a timer-driven rescan of `list_pending` recovers anything the bus
/// dropped.
pub struct FlagWorker {
    id: WorkerId,
    task: Arc<dyn FlagTask>,
    store: Arc<ActionFlagStore>,
    bus: Arc<EventBus>,
    sessions: Arc<SessionCache>,
    retry: RetryPolicy,
    poll_interval: Duration,
}

impl fmt::Debug for FlagWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlagWorker")
            .field("id", &self.id)
            .field("flag_type", &self.task.flag_type())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl FlagWorker {
    pub fn new(
        id: WorkerId,
        task: Arc<dyn FlagTask>,
        store: Arc<ActionFlagStore>,
        bus: Arc<EventBus>,
        sessions: Arc<SessionCache>,
    ) -> Self {
        Self {
            id,
            task,
            store,
            bus,
            sessions,
            retry: RetryPolicy::none(),
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_TICK);
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn flag_type(&self) -> FlagType {
        self.task.flag_type()
    }

    /// Claims and processes `flag_id`. Never errors: conflicts and lost work
    /// are reported through the outcome.
    pub async fn try_process(&self, flag_id: FlagId) -> WorkOutcome {
        if !self.store.claim(flag_id, &self.id).await {
            return WorkOutcome::Conflict;
        }
        if !self.store.begin_processing(flag_id).await {
            debug!(
                target: "handoff::worker",
                worker = %self.id,
                flag_id = %flag_id,
                "flag left claimed state before processing started"
            );
            return WorkOutcome::Discarded;
        }
        let Some(flag) = self.store.get(flag_id).await else {
            return WorkOutcome::Discarded;
        };

        let sessions = self.sessions.as_ref();
        let task = self.task.as_ref();
        let outcome = self
            .retry
            .run(|_| task.execute(&flag, sessions))
            .await;

        match outcome {
            Ok(result) => {
                if self.store.complete(flag_id, result).await {
                    info!(
                        target: "handoff::worker",
                        worker = %self.id,
                        flag_id = %flag_id,
                        flag_type = %flag.flag_type,
                        session_id = %flag.session_id,
                        "flag completed"
                    );
                    WorkOutcome::Completed
                } else {
                    WorkOutcome::Discarded
                }
            }
            Err(err) => {
                let reason = failure_reason(&err);
                warn!(
                    target: "handoff::worker",
                    worker = %self.id,
                    flag_id = %flag_id,
                    flag_type = %flag.flag_type,
                    session_id = %flag.session_id,
                    error = %reason,
                    "task failed"
                );
                if self.store.fail(flag_id, reason).await {
                    WorkOutcome::Failed
                } else {
                    WorkOutcome::Discarded
                }
            }
        }
    }

    /// One rescan of pending flags of this worker's type. Returns how many
    /// flags this worker resolved.
    pub async fn poll_once(&self) -> usize {
        let mut resolved = 0;
        for flag in self.store.list_pending(self.flag_type()).await {
            if self.try_process(flag.id).await.resolved() {
                resolved += 1;
            }
        }
        resolved
    }

    /// Starts the event-driven loop and the poll loop. The subscription is in
    /// place before this returns.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let topic = LifecycleKind::Created.topic(self.flag_type());
        let mut subscription = self.bus.subscribe([topic]);

        let events = {
            let worker = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = subscription.recv() => match event {
                            Some(event) => {
                                worker.try_process(event.flag_id).await;
                            }
                            None => break,
                        }
                    }
                }
                worker.bus.unsubscribe(subscription.id());
                debug!(target: "handoff::worker", worker = %worker.id, "event loop stopped");
            })
        };

        let poll = {
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(worker.poll_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            let resolved = worker.poll_once().await;
                            if resolved > 0 {
                                debug!(
                                    target: "handoff::worker",
                                    worker = %worker.id,
                                    resolved,
                                    "poll picked up flags"
                                );
                            }
                        }
                    }
                }
                debug!(target: "handoff::worker", worker = %worker.id, "poll loop stopped");
            })
        };

        vec![events, poll]
    }
}

/// Collaborator failures carry their own message; anything else is prefixed
/// by its category.
fn failure_reason(err: &HandoffError) -> String {
    match err {
        HandoffError::Collaborator(message) => message.clone(),
        other => other.to_string(),
    }
}
