use async_trait::async_trait;
use handoff_model::{FlagEvent, FlagType, LifecycleKind};

/// Sink for flag lifecycle events. The flag store only depends on this seam,
/// so tests can swap in a recording publisher.
pub trait FlagEventPublisher: Send + Sync {
    /// Enqueues `event` for every handler currently subscribed to its topic
    /// and returns how many accepted it. Must never block the caller.
    fn publish(&self, event: FlagEvent) -> usize;
}

/// Callback-style consumer driven by a dedicated per-subscriber loop.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: FlagEvent);
}

/// Publisher that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPublisher;

impl FlagEventPublisher for NoopPublisher {
    fn publish(&self, _event: FlagEvent) -> usize {
        0
    }
}

/// Topics a caller has to watch to learn how a flag of `flag_type` resolved.
pub fn resolution_topics(flag_type: FlagType) -> [String; 3] {
    [
        LifecycleKind::Completed.topic(flag_type),
        LifecycleKind::Failed.topic(flag_type),
        LifecycleKind::Expired.topic(flag_type),
    ]
}
