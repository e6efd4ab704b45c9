//! Core data model definitions shared across handoff crates.
#![allow(missing_docs)]

pub mod error;
pub mod events;
pub mod flag;
pub mod ids;

// Intentionally curated re-exports for downstream consumers.
pub use error::{ModelError, Result as ModelResult};
pub use events::{FlagEvent, LifecycleKind};
pub use flag::{ActionFlag, FlagStatus, FlagType};
pub use ids::{FlagId, SessionId, WorkerId};
