use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use handoff_model::{FlagId, FlagStatus, FlagType, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::collaborators::{EntityId, PersistedEntity, PersistenceCollaborator, ReportRecord};
use super::config::{CoordinatorConfig, FlagConfig, MIN_TICK};
use super::events::resolution_topics;
use super::flag_store::ActionFlagStore;
use super::runtime::event_bus::{EventBus, Subscription};
use super::session_cache::{SessionCache, slots};
use crate::error::{HandoffError, Result, WorkflowErrorKind};

/// External request accepted by [`Coordinator::submit`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Reuse an existing session; a fresh id is generated when absent.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Workflow input. Must be a JSON object.
    pub payload: Value,
    #[serde(default)]
    pub priority: Option<i32>,
}

impl SubmitRequest {
    pub fn new(payload: Value) -> Self {
        Self {
            session_id: None,
            payload,
            priority: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.payload.is_object() {
            return Err(HandoffError::InvalidRequest(
                "payload must be a JSON object".into(),
            ));
        }
        if self.session_id.as_ref().is_some_and(SessionId::is_blank) {
            return Err(HandoffError::InvalidRequest(
                "session id must not be blank".into(),
            ));
        }
        Ok(())
    }
}

/// Ordered flag types a workflow walks through.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowPlan {
    steps: Vec<FlagType>,
}

impl Default for WorkflowPlan {
    fn default() -> Self {
        Self {
            steps: vec![FlagType::Predict, FlagType::GenerateReport],
        }
    }
}

impl WorkflowPlan {
    pub fn new(steps: Vec<FlagType>) -> Result<Self> {
        if steps.is_empty() {
            return Err(HandoffError::InvalidRequest(
                "workflow plan needs at least one step".into(),
            ));
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[FlagType] {
        &self.steps
    }
}

/// One resolved step of a workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub flag_type: FlagType,
    pub flag_id: FlagId,
    pub result: Value,
}

/// Final response assembled once every step completed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub session_id: SessionId,
    pub prediction: Option<Value>,
    pub report_path: Option<String>,
    pub steps: Vec<StepRecord>,
    /// Persistence id of the stored report, when one was produced.
    pub record_id: Option<EntityId>,
}

/// Caller-visible state of a submitted workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending {
        /// Step currently awaited; `None` before the first flag exists.
        step: Option<FlagType>,
    },
    Done {
        result: WorkflowResult,
    },
    Error {
        kind: WorkflowErrorKind,
        message: String,
    },
}

impl WorkflowStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, WorkflowStatus::Pending { .. })
    }

    pub fn result(&self) -> Option<&WorkflowResult> {
        match self {
            WorkflowStatus::Done { result } => Some(result),
            _ => None,
        }
    }

    fn from_error(err: &HandoffError) -> Self {
        WorkflowStatus::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug)]
struct WorkflowSlot {
    status: watch::Sender<WorkflowStatus>,
    /// Set when the status leaves `Pending`; drives retention pruning.
    finished_at: Option<DateTime<Utc>>,
}

impl WorkflowSlot {
    fn new(status: WorkflowStatus) -> Self {
        Self {
            status: watch::channel(status).0,
            finished_at: None,
        }
    }

    fn is_pending(&self) -> bool {
        self.status.borrow().is_pending()
    }
}

/// Turns external requests into chains of action flags.
///
/// The coordinator is the only component that creates flags and the only one
/// that reports errors to callers. Each submitted workflow is driven by its
/// own task that waits on resolution events for the flag it just created,
/// re-reading the store on a timer in case an event was dropped.
pub struct Coordinator {
    store: Arc<ActionFlagStore>,
    bus: Arc<EventBus>,
    sessions: Arc<SessionCache>,
    persistence: Arc<dyn PersistenceCollaborator>,
    flags: FlagConfig,
    workflow_timeout: Duration,
    recheck_interval: Duration,
    retain_finished: Duration,
    plan: WorkflowPlan,
    workflows: DashMap<SessionId, WorkflowSlot>,
    shutdown: CancellationToken,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("plan", &self.plan)
            .field("workflow_timeout", &self.workflow_timeout)
            .field("workflows", &self.workflows.len())
            .finish()
    }
}

impl Coordinator {
    pub fn new(
        store: Arc<ActionFlagStore>,
        bus: Arc<EventBus>,
        sessions: Arc<SessionCache>,
        persistence: Arc<dyn PersistenceCollaborator>,
        flags: FlagConfig,
        config: CoordinatorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            bus,
            sessions,
            persistence,
            flags,
            workflow_timeout: config.workflow_timeout(),
            recheck_interval: config.recheck_interval().max(MIN_TICK),
            retain_finished: config.retain_finished(),
            plan: WorkflowPlan::default(),
            workflows: DashMap::new(),
            shutdown,
        }
    }

    pub fn with_plan(mut self, plan: WorkflowPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_workflow_timeout(mut self, timeout: Duration) -> Self {
        self.workflow_timeout = timeout;
        self
    }

    pub fn plan(&self) -> &WorkflowPlan {
        &self.plan
    }

    /// Validates `request`, stores its input in the session cache and starts
    /// driving the workflow in the background.
    pub async fn submit(self: &Arc<Self>, request: SubmitRequest) -> Result<SessionId> {
        if self.shutdown.is_cancelled() {
            return Err(HandoffError::Shutdown("coordinator is stopping".into()));
        }
        request.validate()?;

        let session_id = request.session_id.unwrap_or_else(SessionId::generate);
        let pending = WorkflowStatus::Pending { step: None };
        let reused = match self.workflows.entry(session_id.clone()) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                if slot.is_pending() {
                    return Err(HandoffError::InvalidRequest(format!(
                        "session {session_id} already has a workflow in flight"
                    )));
                }
                slot.status.send_replace(pending);
                slot.finished_at = None;
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(WorkflowSlot::new(pending));
                false
            }
        };

        if reused {
            // Step outputs of the previous run must not leak into this one.
            for slot in [slots::PREDICTION_RESULT, slots::REPORT_PATH] {
                self.sessions.remove(&session_id, slot).await;
            }
        }
        self.sessions
            .put(&session_id, slots::INPUT, request.payload.clone())
            .await;
        let priority = request.priority.unwrap_or(self.flags.default_priority);

        info!(
            target: "handoff::coordinator",
            session_id = %session_id,
            priority,
            steps = self.plan.steps().len(),
            "workflow submitted"
        );

        let this = Arc::clone(self);
        let session = session_id.clone();
        tokio::spawn(async move {
            this.drive(session, request.payload, priority).await;
        });
        Ok(session_id)
    }

    /// Current state of the workflow for `session_id`, if one was submitted.
    pub fn status(&self, session_id: &SessionId) -> Option<WorkflowStatus> {
        self.workflows
            .get(session_id)
            .map(|slot| slot.status.borrow().clone())
    }

    /// Waits until the workflow for `session_id` leaves the pending state.
    pub async fn await_status(&self, session_id: &SessionId) -> Result<WorkflowStatus> {
        let mut rx = self
            .workflows
            .get(session_id)
            .map(|slot| slot.status.subscribe())
            .ok_or_else(|| HandoffError::NotFound(format!("session {session_id}")))?;

        let status = rx
            .wait_for(|status| !status.is_pending())
            .await
            .map_err(|_| HandoffError::Internal("workflow status channel closed".into()))?;
        Ok((*status).clone())
    }

    /// Drops the status of a finished workflow. Pending workflows are kept.
    pub fn forget(&self, session_id: &SessionId) -> bool {
        self.workflows
            .remove_if(session_id, |_, slot| !slot.is_pending())
            .is_some()
    }

    /// Drops statuses of workflows that finished more than the retention
    /// window before `now`. Returns how many were dropped.
    pub fn prune_finished(&self, now: DateTime<Utc>) -> usize {
        let retain = chrono::Duration::from_std(self.retain_finished)
            .unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = now.checked_sub_signed(retain) else {
            return 0;
        };

        let mut pruned = 0;
        self.workflows.retain(|_, slot| {
            let keep = slot.finished_at.is_none_or(|finished| finished > cutoff);
            if !keep {
                pruned += 1;
            }
            keep
        });
        if pruned > 0 {
            debug!(target: "handoff::coordinator", pruned, "dropped finished workflow statuses");
        }
        pruned
    }

    pub fn in_flight(&self) -> usize {
        self.workflows
            .iter()
            .filter(|entry| entry.value().is_pending())
            .count()
    }

    /// Number of workflow statuses held, finished ones included.
    pub fn tracked(&self) -> usize {
        self.workflows.len()
    }

    fn set_status(&self, session_id: &SessionId, status: WorkflowStatus) {
        if let Some(mut slot) = self.workflows.get_mut(session_id) {
            slot.finished_at = (!status.is_pending()).then(Utc::now);
            slot.status.send_replace(status);
        }
    }

    async fn drive(&self, session_id: SessionId, input: Value, priority: i32) {
        let chain = tokio::time::timeout(
            self.workflow_timeout,
            self.run_chain(&session_id, &input, priority),
        );
        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => Err(HandoffError::Shutdown(
                "coordinator stopped before the workflow finished".into(),
            )),
            res = chain => match res {
                Ok(outcome) => outcome,
                Err(_) => Err(HandoffError::WorkflowTimeout(self.workflow_timeout)),
            },
        };

        let status = match outcome {
            Ok(result) => {
                info!(
                    target: "handoff::coordinator",
                    session_id = %session_id,
                    report_path = result.report_path.as_deref().unwrap_or_default(),
                    "workflow completed"
                );
                WorkflowStatus::Done { result }
            }
            Err(err) => {
                warn!(
                    target: "handoff::coordinator",
                    session_id = %session_id,
                    kind = ?err.kind(),
                    error = %err,
                    "workflow ended with an error"
                );
                WorkflowStatus::from_error(&err)
            }
        };
        self.set_status(&session_id, status);
    }

    async fn run_chain(
        &self,
        session_id: &SessionId,
        input: &Value,
        priority: i32,
    ) -> Result<WorkflowResult> {
        let mut steps: Vec<StepRecord> = Vec::with_capacity(self.plan.steps().len());
        for &flag_type in self.plan.steps() {
            self.set_status(session_id, WorkflowStatus::Pending { step: Some(flag_type) });
            let payload = match steps.last() {
                None => input.clone(),
                Some(previous) => json!({
                    "input": input,
                    "previous": previous,
                }),
            };
            let record = self.run_step(session_id, flag_type, payload, priority).await?;
            steps.push(record);
        }
        self.assemble(session_id, steps).await
    }

    async fn run_step(
        &self,
        session_id: &SessionId,
        flag_type: FlagType,
        payload: Value,
        priority: i32,
    ) -> Result<StepRecord> {
        // Subscribe before creating the flag so a fast worker cannot resolve
        // it unobserved.
        let mut subscription = self.bus.subscribe(resolution_topics(flag_type));
        let flag_id = self.store.create(
            flag_type,
            session_id.clone(),
            payload,
            priority,
            self.flags.ttl_for(flag_type),
        );
        debug!(
            target: "handoff::coordinator",
            session_id = %session_id,
            flag_id = %flag_id,
            flag_type = %flag_type,
            "awaiting step"
        );

        let outcome = self
            .await_resolution(&mut subscription, session_id, flag_id)
            .await;
        self.bus.unsubscribe(subscription.id());
        outcome
    }

    async fn await_resolution(
        &self,
        subscription: &mut Subscription,
        session_id: &SessionId,
        flag_id: FlagId,
    ) -> Result<StepRecord> {
        let mut recheck = tokio::time::interval(self.recheck_interval);
        recheck.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        recheck.tick().await;

        loop {
            tokio::select! {
                event = subscription.recv() => match event {
                    Some(event) if &event.session_id == session_id && event.flag_id == flag_id => {
                        if let Some(record) = self.check_flag(flag_id).await? {
                            return Ok(record);
                        }
                    }
                    Some(_) => {}
                    None => {
                        return Err(HandoffError::Internal("event subscription closed".into()));
                    }
                },
                _ = recheck.tick() => {
                    if let Some(record) = self.check_flag(flag_id).await? {
                        return Ok(record);
                    }
                }
            }
        }
    }

    /// Reads the flag back from the store. `Ok(None)` while it is unresolved.
    async fn check_flag(&self, flag_id: FlagId) -> Result<Option<StepRecord>> {
        let flag = self
            .store
            .get(flag_id)
            .await
            .ok_or_else(|| HandoffError::NotFound(format!("flag {flag_id}")))?;

        match flag.status {
            FlagStatus::Completed => Ok(Some(StepRecord {
                flag_type: flag.flag_type,
                flag_id,
                result: flag.result.unwrap_or(Value::Null),
            })),
            FlagStatus::Failed => Err(HandoffError::Collaborator(
                flag.error.unwrap_or_else(|| "step failed without a reason".into()),
            )),
            FlagStatus::Expired => Err(HandoffError::Expired(format!(
                "{} flag {flag_id} for session {}",
                flag.flag_type, flag.session_id
            ))),
            FlagStatus::Pending | FlagStatus::Claimed | FlagStatus::InProgress => Ok(None),
        }
    }

    async fn assemble(
        &self,
        session_id: &SessionId,
        steps: Vec<StepRecord>,
    ) -> Result<WorkflowResult> {
        let step_result = |flag_type: FlagType| {
            steps
                .iter()
                .find(|step| step.flag_type == flag_type)
                .map(|step| &step.result)
        };

        // Results of this run win; the cache only fills in steps the plan
        // did not include.
        let prediction = match step_result(FlagType::Predict) {
            Some(value) => Some(value.clone()),
            None => self.sessions.get(session_id, slots::PREDICTION_RESULT).await,
        };
        let report_path = match step_result(FlagType::GenerateReport)
            .and_then(|result| result.get("path"))
            .and_then(Value::as_str)
        {
            Some(path) => Some(path.to_owned()),
            None => match self.sessions.get(session_id, slots::REPORT_PATH).await {
                Some(Value::String(path)) => Some(path),
                _ => None,
            },
        };

        let record_id = match &report_path {
            Some(path) => {
                let record = ReportRecord {
                    session_id: session_id.clone(),
                    prediction: prediction.clone().unwrap_or(Value::Null),
                    report_path: path.clone(),
                    created_at: Utc::now(),
                };
                Some(self.persistence.save(PersistedEntity::Report(record)).await?)
            }
            None => None,
        };

        Ok(WorkflowResult {
            session_id: session_id.clone(),
            prediction,
            report_path,
            steps,
            record_id,
        })
    }
}
