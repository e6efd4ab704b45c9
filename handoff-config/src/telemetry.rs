use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Quiet defaults that still show workflow milestones. Override via RUST_LOG.
pub const DEFAULT_DIRECTIVES: &str =
    "info,handoff::store=info,handoff::bus=warn,handoff::sweeper=info,handoff::worker=info";

fn env_filter(default_directives: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directives.into())
}

/// Installs the global subscriber. Panics if one is already set.
pub fn init_tracing(default_directives: &str) {
    tracing_subscriber::registry()
        .with(env_filter(default_directives))
        .with(fmt::layer())
        .init();
}

/// Like [`init_tracing`] but reports an already-installed subscriber as an
/// error instead of panicking.
pub fn try_init_tracing(default_directives: &str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(default_directives))
        .with(fmt::layer())
        .try_init()?;
    Ok(())
}
