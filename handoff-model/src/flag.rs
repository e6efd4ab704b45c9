use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ModelError;
use crate::ids::{FlagId, SessionId, WorkerId};

/// Kind of work a flag represents. Determines which worker may claim it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagType {
    Predict,
    GenerateReport,
}

impl FlagType {
    pub const ALL: [FlagType; 2] = [FlagType::Predict, FlagType::GenerateReport];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlagType::Predict => "PREDICT",
            FlagType::GenerateReport => "GENERATE_REPORT",
        }
    }
}

impl fmt::Display for FlagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlagType {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        FlagType::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| ModelError::UnknownFlagType(raw.to_string()))
    }
}

/// Lifecycle states of an action flag.
///
/// ```text
/// pending --claim--> claimed --begin_processing--> in_progress
/// {pending, claimed, in_progress} --expire--> expired
/// {claimed, in_progress} --complete/fail--> completed/failed
/// ```
///
/// `completed`, `failed` and `expired` are terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagStatus {
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
    Expired,
}

impl FlagStatus {
    pub const ALL: [FlagStatus; 6] = [
        FlagStatus::Pending,
        FlagStatus::Claimed,
        FlagStatus::InProgress,
        FlagStatus::Completed,
        FlagStatus::Failed,
        FlagStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlagStatus::Pending => "pending",
            FlagStatus::Claimed => "claimed",
            FlagStatus::InProgress => "in_progress",
            FlagStatus::Completed => "completed",
            FlagStatus::Failed => "failed",
            FlagStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlagStatus::Completed | FlagStatus::Failed | FlagStatus::Expired
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: FlagStatus) -> bool {
        use FlagStatus::*;
        matches!(
            (*self, next),
            (Pending, Claimed)
                | (Claimed, InProgress)
                | (Pending | Claimed | InProgress, Expired)
                | (Claimed | InProgress, Completed | Failed)
        )
    }
}

impl fmt::Display for FlagStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlagStatus {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        FlagStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == raw.trim())
            .ok_or_else(|| ModelError::UnknownFlagStatus(raw.to_string()))
    }
}

/// A unit of pending or in-flight work.
///
/// Only the flag store mutates these; everything handed out to callers is a
/// snapshot copy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionFlag {
    pub id: FlagId,
    pub flag_type: FlagType,
    pub session_id: SessionId,
    pub status: FlagStatus,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimant_id: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl ActionFlag {
    pub fn new(
        flag_type: FlagType,
        session_id: SessionId,
        payload: Value,
        priority: i32,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: FlagId::new(),
            flag_type,
            session_id,
            status: FlagStatus::Pending,
            payload,
            result: None,
            error: None,
            priority,
            claimant_id: None,
            created_at: now,
            claimed_at: None,
            resolved_at: None,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// True once the deadline has passed, regardless of whether the sweeper
    /// has recorded the expiry yet.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
