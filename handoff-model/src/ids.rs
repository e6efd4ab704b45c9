use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;

/// Unique identifier for action flags. Time-ordered so ties on priority and
/// creation timestamp still resolve to creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlagId(pub Uuid);

impl Default for FlagId {
    fn default() -> Self {
        Self::new()
    }
}

impl FlagId {
    pub fn new() -> Self {
        FlagId(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for FlagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FlagId {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(raw)
            .map(FlagId)
            .map_err(|err| ModelError::InvalidId(format!("{raw}: {err}")))
    }
}

/// Correlates the flags spawned for one logical request. Callers may bring
/// their own identifier; otherwise one is generated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(raw: impl Into<String>) -> Self {
        SessionId(raw.into())
    }

    pub fn generate() -> Self {
        SessionId(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(raw: &str) -> Self {
        SessionId::new(raw)
    }
}

impl From<String> for SessionId {
    fn from(raw: String) -> Self {
        SessionId(raw)
    }
}

/// Identity of a worker instance holding (or attempting) a claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(raw: impl Into<String>) -> Self {
        WorkerId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(raw: &str) -> Self {
        WorkerId::new(raw)
    }
}
