//! Tracing initialisation for stackgate binaries.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::GateConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level` when set. `json` switches to newline
/// delimited JSON for log shippers.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        registry
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

/// Log the process-level settings once at startup.
pub fn log_startup(config: &GateConfig) {
    tracing::info!(
        source = %config.source,
        collect_usage_data = config.collect_usage_data,
        projects = config.projects.len(),
        lock = ?config.lock,
        "stackgate configured"
    );
}
