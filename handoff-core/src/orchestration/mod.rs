//! Action-flag coordination: the store and its state machine, the event bus,
//! the session cache, expiry sweeps, workers and the coordinator that chains
//! them into workflows.

pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod flag_store;
pub mod retry;
pub mod runtime;
pub mod session_cache;
pub mod sweeper;
pub mod worker;

pub use collaborators::*;
pub use config::*;
pub use coordinator::*;
pub use events::*;
pub use flag_store::*;
pub use retry::*;
pub use runtime::*;
pub use session_cache::*;
pub use sweeper::*;
pub use worker::*;
