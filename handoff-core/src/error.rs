use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Collaborator failure: {0}")]
    Collaborator(String),

    #[error("Workflow timed out after {0:?}")]
    WorkflowTimeout(Duration),

    #[error("Flag expired before completion: {0}")]
    Expired(String),

    #[error("Runtime shutting down: {0}")]
    Shutdown(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Caller-visible classification of a workflow error.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowErrorKind {
    /// An external collaborator raised; the message carries its reason.
    CollaboratorFailure,
    /// The coordinator gave up waiting, or the work was lost to expiry.
    Timeout,
    InvalidRequest,
    Internal,
}

impl HandoffError {
    pub fn kind(&self) -> WorkflowErrorKind {
        match self {
            HandoffError::Collaborator(_) => WorkflowErrorKind::CollaboratorFailure,
            HandoffError::WorkflowTimeout(_) | HandoffError::Expired(_) => {
                WorkflowErrorKind::Timeout
            }
            HandoffError::InvalidRequest(_) => WorkflowErrorKind::InvalidRequest,
            HandoffError::Serialization(_)
            | HandoffError::NotFound(_)
            | HandoffError::Shutdown(_)
            | HandoffError::Internal(_) => WorkflowErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, HandoffError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_expiry_share_a_kind() {
        assert_eq!(
            HandoffError::WorkflowTimeout(Duration::from_secs(5)).kind(),
            WorkflowErrorKind::Timeout
        );
        assert_eq!(
            HandoffError::Expired("flag".into()).kind(),
            WorkflowErrorKind::Timeout
        );
        assert_eq!(
            HandoffError::Collaborator("model unavailable".into()).kind(),
            WorkflowErrorKind::CollaboratorFailure
        );
    }

    #[test]
    fn timeout_message_reports_seconds() {
        let err = HandoffError::WorkflowTimeout(Duration::from_secs(90));
        assert_eq!(err.to_string(), "Workflow timed out after 90s");
    }
}
