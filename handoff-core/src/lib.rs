//! # Handoff Core
//!
//! In-process coordination layer that lets independent workers cooperate
//! without calling each other directly.
//!
//! A coordinator publishes units of work ("action flags") into an
//! [`ActionFlagStore`](orchestration::ActionFlagStore); exactly one worker
//! claims each flag, runs it against an external collaborator and reports the
//! outcome back through the store. Every lifecycle transition is broadcast on
//! the [`EventBus`](orchestration::EventBus), and a background
//! [`ExpirySweeper`](orchestration::ExpirySweeper) reclaims work nobody
//! finished in time. Large or transient artifacts travel between steps through
//! the TTL-bounded [`SessionCache`](orchestration::SessionCache).
//!
//! ## Architecture
//!
//! - [`orchestration::runtime`]: event bus and the runtime supervisor that
//!   wires every component together
//! - [`orchestration::flag_store`]: flag state machine and claim protocol
//! - [`orchestration::coordinator`]: chains flags into workflows and exposes
//!   `submit` / `status`
//! - [`orchestration::worker`]: claim/execute loops for each flag type
//! - [`error`]: error types shared by the crate

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Error types and error handling utilities
pub mod error;

/// Flags, workers, coordinator and the runtime that drives them
pub mod orchestration;

pub use error::{HandoffError, Result, WorkflowErrorKind};
pub use handoff_model as model;
