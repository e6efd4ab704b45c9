use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use handoff_model::{FlagType, SessionId, WorkerId};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{HandoffError, Result};
use crate::orchestration::collaborators::{
    Collaborators, InferenceCollaborator, PersistenceCollaborator, SynthesisCollaborator,
};
use crate::orchestration::config::HandoffConfig;
use crate::orchestration::coordinator::{
    Coordinator, SubmitRequest, WorkflowPlan, WorkflowStatus,
};
use crate::orchestration::flag_store::ActionFlagStore;
use crate::orchestration::retry::RetryPolicy;
use crate::orchestration::session_cache::SessionCache;
use crate::orchestration::sweeper::ExpirySweeper;
use crate::orchestration::worker::{FlagTask, FlagWorker, PredictionTask, ReportTask};

use super::event_bus::EventBus;

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns every coordination component inside a single process and supervises
/// the background tasks that drive them.
pub struct HandoffRuntime {
    config: HandoffConfig,
    bus: Arc<EventBus>,
    store: Arc<ActionFlagStore>,
    sessions: Arc<SessionCache>,
    sweeper: Arc<ExpirySweeper>,
    coordinator: Arc<Coordinator>,
    collaborators: Collaborators,
    shutdown_token: CancellationToken,
    started: AtomicBool,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for HandoffRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task_count = self
            .task_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("HandoffRuntime")
            .field("config", &self.config)
            .field("flag_count", &self.store.len())
            .field("session_count", &self.sessions.len())
            .field("task_count", &task_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl HandoffRuntime {
    pub fn new(config: HandoffConfig, collaborators: Collaborators) -> Result<Self> {
        Self::with_plan(config, collaborators, WorkflowPlan::default())
    }

    pub fn with_plan(
        config: HandoffConfig,
        collaborators: Collaborators,
        plan: WorkflowPlan,
    ) -> Result<Self> {
        let warnings = config.validate().map_err(HandoffError::InvalidRequest)?;
        for warning in warnings {
            warn!(target: "handoff::runtime", "{warning}");
        }

        let shutdown_token = CancellationToken::new();
        let bus = Arc::new(EventBus::new(config.bus.subscriber_capacity));
        let store = Arc::new(ActionFlagStore::new(bus.clone()));
        let sessions = Arc::new(SessionCache::new(config.sessions.ttl()));
        let coordinator = Arc::new(
            Coordinator::new(
                Arc::clone(&store),
                Arc::clone(&bus),
                Arc::clone(&sessions),
                Arc::clone(&collaborators.persistence),
                config.flags,
                config.coordinator,
                shutdown_token.child_token(),
            )
            .with_plan(plan),
        );
        let sweeper = Arc::new(
            ExpirySweeper::new(
                Arc::clone(&store),
                Arc::clone(&sessions),
                config.sweeper.interval(),
                config.flags.retain_resolved(),
            )
            .with_coordinator(Arc::clone(&coordinator)),
        );

        Ok(Self {
            config,
            bus,
            store,
            sessions,
            sweeper,
            coordinator,
            collaborators,
            shutdown_token,
            started: AtomicBool::new(false),
            task_handles: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn store(&self) -> Arc<ActionFlagStore> {
        Arc::clone(&self.store)
    }

    pub fn sessions(&self) -> Arc<SessionCache> {
        Arc::clone(&self.sessions)
    }

    pub fn sweeper(&self) -> Arc<ExpirySweeper> {
        Arc::clone(&self.sweeper)
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Spawns the worker pools and the expiry sweeper. Only the first call
    /// spawns anything.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(HandoffError::Shutdown("runtime already shut down".into()));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(HandoffError::Internal("runtime already started".into()));
        }

        let prediction: Arc<dyn FlagTask> = Arc::new(PredictionTask::new(Arc::clone(
            &self.collaborators.inference,
        )));
        let report: Arc<dyn FlagTask> = Arc::new(ReportTask::new(Arc::clone(
            &self.collaborators.synthesis,
        )));

        let mut handles = Vec::new();
        handles.extend(self.spawn_worker_pool(prediction));
        handles.extend(self.spawn_worker_pool(report));
        handles.push(
            Arc::clone(&self.sweeper).spawn(self.shutdown_token.child_token()),
        );

        let task_count = handles.len();
        self.task_handles.lock().await.extend(handles);
        info!(
            target: "handoff::runtime",
            tasks = task_count,
            prediction_workers = self.config.workers.parallelism_for(FlagType::Predict),
            report_workers = self.config.workers.parallelism_for(FlagType::GenerateReport),
            "handoff runtime started"
        );
        Ok(())
    }

    fn spawn_worker_pool(&self, task: Arc<dyn FlagTask>) -> Vec<JoinHandle<()>> {
        let flag_type = task.flag_type();
        let workers = &self.config.workers;
        let retry = RetryPolicy::from_config(&workers.retry);
        let prefix = match flag_type {
            FlagType::Predict => "prediction",
            FlagType::GenerateReport => "report",
        };

        (0..workers.parallelism_for(flag_type))
            .flat_map(|slot| {
                let worker = FlagWorker::new(
                    WorkerId::new(format!("{prefix}-worker-{slot}")),
                    Arc::clone(&task),
                    Arc::clone(&self.store),
                    Arc::clone(&self.bus),
                    Arc::clone(&self.sessions),
                )
                .with_retry(retry)
                .with_poll_interval(workers.poll_interval());
                Arc::new(worker).spawn(self.shutdown_token.child_token())
            })
            .collect()
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SessionId> {
        self.coordinator.submit(request).await
    }

    pub fn status(&self, session_id: &SessionId) -> Option<WorkflowStatus> {
        self.coordinator.status(session_id)
    }

    pub async fn await_status(&self, session_id: &SessionId) -> Result<WorkflowStatus> {
        self.coordinator.await_status(session_id).await
    }

    /// Cancels every background task and waits for them to wind down.
    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "handoff::runtime", "initiating graceful shutdown of handoff runtime");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.task_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let joined = tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, join_all(handles)).await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(err) = result {
                        warn!(
                            target: "handoff::runtime",
                            error = %err,
                            "task failed during shutdown"
                        );
                    }
                }
            }
            Err(_) => {
                warn!(target: "handoff::runtime", "timed out waiting for tasks during shutdown");
            }
        }

        info!(target: "handoff::runtime", "handoff runtime shut down");
        Ok(())
    }
}

/// Assembles a [`HandoffRuntime`] from individually supplied collaborators.
pub struct HandoffRuntimeBuilder {
    config: HandoffConfig,
    plan: WorkflowPlan,
    inference: Option<Arc<dyn InferenceCollaborator>>,
    synthesis: Option<Arc<dyn SynthesisCollaborator>>,
    persistence: Option<Arc<dyn PersistenceCollaborator>>,
}

impl fmt::Debug for HandoffRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffRuntimeBuilder")
            .field("config", &self.config)
            .field("plan", &self.plan)
            .field("has_inference", &self.inference.is_some())
            .field("has_synthesis", &self.synthesis.is_some())
            .field("has_persistence", &self.persistence.is_some())
            .finish()
    }
}

impl HandoffRuntimeBuilder {
    pub fn new(config: HandoffConfig) -> Self {
        Self {
            config,
            plan: WorkflowPlan::default(),
            inference: None,
            synthesis: None,
            persistence: None,
        }
    }

    pub fn with_inference(mut self, inference: Arc<dyn InferenceCollaborator>) -> Self {
        self.inference = Some(inference);
        self
    }

    pub fn with_synthesis(mut self, synthesis: Arc<dyn SynthesisCollaborator>) -> Self {
        self.synthesis = Some(synthesis);
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceCollaborator>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_plan(mut self, plan: WorkflowPlan) -> Self {
        self.plan = plan;
        self
    }

    /// Persistence falls back to
    /// [`InMemoryPersistence`](crate::orchestration::collaborators::InMemoryPersistence)
    /// when none was given.
    pub fn build(self) -> Result<HandoffRuntime> {
        let inference = self
            .inference
            .ok_or_else(|| HandoffError::Internal("inference collaborator missing".into()))?;
        let synthesis = self
            .synthesis
            .ok_or_else(|| HandoffError::Internal("synthesis collaborator missing".into()))?;
        let collaborators = match self.persistence {
            Some(persistence) => Collaborators::new(inference, synthesis, persistence),
            None => Collaborators::in_memory(inference, synthesis),
        };

        HandoffRuntime::with_plan(self.config, collaborators, self.plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::orchestration::collaborators::{
        MockInferenceCollaborator, MockSynthesisCollaborator,
    };

    fn config() -> HandoffConfig {
        let mut config = HandoffConfig::default();
        config.workers.poll_interval_ms = 20;
        config.coordinator.recheck_interval_ms = 20;
        config.sweeper.interval_ms = 50;
        config
    }

    #[test]
    fn builder_requires_inference_and_synthesis() {
        let err = HandoffRuntimeBuilder::new(config()).build().unwrap_err();
        assert!(matches!(err, HandoffError::Internal(_)));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = config();
        config.bus.subscriber_capacity = 0;
        let err = HandoffRuntimeBuilder::new(config)
            .with_inference(Arc::new(MockInferenceCollaborator::new()))
            .with_synthesis(Arc::new(MockSynthesisCollaborator::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, HandoffError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let runtime = HandoffRuntimeBuilder::new(config())
            .with_inference(Arc::new(MockInferenceCollaborator::new()))
            .with_synthesis(Arc::new(MockSynthesisCollaborator::new()))
            .build()
            .expect("runtime");
        runtime.start().await.expect("first start");
        let spawned = runtime.task_handles.lock().await.len();

        let err = runtime.start().await.unwrap_err();
        assert!(matches!(err, HandoffError::Internal(_)));
        assert_eq!(runtime.task_handles.lock().await.len(), spawned);

        runtime.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn runs_the_default_workflow_end_to_end() {
        let mut inference = MockInferenceCollaborator::new();
        inference
            .expect_run()
            .times(1)
            .returning(|_| Ok(json!({ "label": "positive" })));
        let mut synthesis = MockSynthesisCollaborator::new();
        synthesis
            .expect_render()
            .times(1)
            .returning(|inputs| {
                let session = inputs["session_id"].as_str().unwrap_or("x");
                Ok(format!("/tmp/{session}.pdf"))
            });

        let runtime = HandoffRuntimeBuilder::new(config())
            .with_inference(Arc::new(inference))
            .with_synthesis(Arc::new(synthesis))
            .build()
            .expect("runtime");
        runtime.start().await.expect("start");

        let session = runtime
            .submit(SubmitRequest::new(json!({ "scan": "mri-7" })).with_session("S7"))
            .await
            .expect("submit");
        let status = tokio::time::timeout(Duration::from_secs(5), runtime.await_status(&session))
            .await
            .expect("workflow finished in time")
            .expect("status");

        let result = status.result().expect("done");
        assert_eq!(result.report_path.as_deref(), Some("/tmp/S7.pdf"));
        assert_eq!(result.prediction, Some(json!({ "label": "positive" })));
        // No persistence was supplied, so the in-memory fallback stored it.
        assert!(result.record_id.is_some());

        runtime.shutdown().await.expect("shutdown");
        assert!(runtime.is_shutting_down());
        assert!(runtime.submit(SubmitRequest::new(json!({}))).await.is_err());
        assert!(runtime.start().await.is_err());
    }
}
