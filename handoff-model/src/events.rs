use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flag::{ActionFlag, FlagType};
use crate::ids::{FlagId, SessionId};

/// Lifecycle transitions that produce an event. Combined with a flag type
/// this yields the topic string, e.g. `completed_PREDICT`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Created,
    Claimed,
    InProgress,
    Completed,
    Failed,
    Expired,
}

impl LifecycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleKind::Created => "created",
            LifecycleKind::Claimed => "claimed",
            LifecycleKind::InProgress => "in_progress",
            LifecycleKind::Completed => "completed",
            LifecycleKind::Failed => "failed",
            LifecycleKind::Expired => "expired",
        }
    }

    pub fn topic(&self, flag_type: FlagType) -> String {
        format!("{}_{}", self.as_str(), flag_type.as_str())
    }
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ephemeral notification delivered to every handler subscribed to `topic`
/// at publish time. Never persisted and never replayed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlagEvent {
    pub topic: String,
    pub kind: LifecycleKind,
    pub flag_type: FlagType,
    pub flag_id: FlagId,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

impl FlagEvent {
    pub fn new(
        kind: LifecycleKind,
        flag_type: FlagType,
        flag_id: FlagId,
        session_id: SessionId,
        payload: Value,
    ) -> Self {
        Self {
            topic: kind.topic(flag_type),
            kind,
            flag_type,
            flag_id,
            session_id,
            payload,
            emitted_at: Utc::now(),
        }
    }

    pub fn from_flag(kind: LifecycleKind, flag: &ActionFlag, payload: Value) -> Self {
        Self::new(
            kind,
            flag.flag_type,
            flag.id,
            flag.session_id.clone(),
            payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_join_kind_and_flag_type() {
        assert_eq!(
            LifecycleKind::Completed.topic(FlagType::Predict),
            "completed_PREDICT"
        );
        assert_eq!(
            LifecycleKind::Created.topic(FlagType::GenerateReport),
            "created_GENERATE_REPORT"
        );
        assert_eq!(
            LifecycleKind::InProgress.topic(FlagType::Predict),
            "in_progress_PREDICT"
        );
    }

    #[test]
    fn event_topic_matches_kind() {
        let event = FlagEvent::new(
            LifecycleKind::Failed,
            FlagType::GenerateReport,
            FlagId::new(),
            SessionId::from("S9"),
            Value::Null,
        );
        assert_eq!(event.topic, "failed_GENERATE_REPORT");
    }
}
