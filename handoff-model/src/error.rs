use std::fmt::{self, Display};

/// Errors produced when parsing model values from their wire names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    UnknownFlagType(String),
    UnknownFlagStatus(String),
    InvalidId(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownFlagType(raw) => write!(f, "unknown flag type: {raw}"),
            ModelError::UnknownFlagStatus(raw) => {
                write!(f, "unknown flag status: {raw}")
            }
            ModelError::InvalidId(msg) => write!(f, "invalid id: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
