pub mod event_bus;
pub mod supervisor;

pub use event_bus::*;
pub use supervisor::*;
