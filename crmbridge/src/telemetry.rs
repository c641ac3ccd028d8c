//! Telemetry initialization (tracing subscriber with env-filter and fmt output).
//!
//! Log verbosity follows `RUST_LOG` when set, falling back to the configured
//! level. Structured JSON output can be enabled via the `logging.json` config
//! flag for deployments that ship logs to an aggregator.

use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Initialize the tracing subscriber.
///
/// - Console output via the fmt layer (human-readable or JSON per config)
/// - Filtering from `RUST_LOG`, falling back to `logging.level`
pub fn init_telemetry(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;

        info!("Telemetry initialized (JSON output)");
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()?;

        info!("Telemetry initialized");
    }

    Ok(())
}
