//! Configuration loading and tracing setup for the handoff runtime.
#![allow(missing_docs)]

pub mod settings;
pub mod telemetry;

pub use settings::{ConfigLoad, ConfigSource, HandoffSettings};
pub use telemetry::{DEFAULT_DIRECTIVES, init_tracing, try_init_tracing};
