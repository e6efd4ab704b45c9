//! Seams to the systems that do the real work: model inference, report
//! synthesis and durable persistence.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use handoff_model::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

/// Runs a prediction over the workflow input.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceCollaborator: Send + Sync {
    async fn run(&self, input: &Value) -> Result<Value>;
}

/// Renders a report from the prediction and input, returning where it landed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SynthesisCollaborator: Send + Sync {
    async fn render(&self, inputs: &Value) -> Result<String>;
}

/// Identifier handed back by a persistence backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Final workflow artefacts stored for later retrieval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub session_id: SessionId,
    pub prediction: Value,
    pub report_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistedEntity {
    Report(ReportRecord),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceCollaborator: Send + Sync {
    async fn save(&self, entity: PersistedEntity) -> Result<EntityId>;
    async fn load(&self, id: EntityId) -> Result<Option<PersistedEntity>>;
}

/// Process-local persistence backend.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    records: DashMap<EntityId, PersistedEntity>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl PersistenceCollaborator for InMemoryPersistence {
    async fn save(&self, entity: PersistedEntity) -> Result<EntityId> {
        let id = EntityId::generate();
        self.records.insert(id.clone(), entity);
        Ok(id)
    }

    async fn load(&self, id: EntityId) -> Result<Option<PersistedEntity>> {
        Ok(self.records.get(&id).map(|entry| entry.value().clone()))
    }
}

/// The set of external collaborators the runtime drives.
#[derive(Clone)]
pub struct Collaborators {
    pub inference: Arc<dyn InferenceCollaborator>,
    pub synthesis: Arc<dyn SynthesisCollaborator>,
    pub persistence: Arc<dyn PersistenceCollaborator>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    pub fn new(
        inference: Arc<dyn InferenceCollaborator>,
        synthesis: Arc<dyn SynthesisCollaborator>,
        persistence: Arc<dyn PersistenceCollaborator>,
    ) -> Self {
        Self {
            inference,
            synthesis,
            persistence,
        }
    }

    /// Inference and synthesis backed by the given collaborators, with
    /// results kept in memory.
    pub fn in_memory(
        inference: Arc<dyn InferenceCollaborator>,
        synthesis: Arc<dyn SynthesisCollaborator>,
    ) -> Self {
        Self::new(inference, synthesis, Arc::new(InMemoryPersistence::new()))
    }
}
