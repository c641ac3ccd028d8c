//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `CRMBRIDGE_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `CRMBRIDGE_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `CRMBRIDGE_UPSTREAM__SIGNING_SECRET=whsec_...` sets the `upstream.signing_secret` field.
//!
//! ## Usage
//!
//! ```no_run
//! use clap::Parser;
//! use crmbridge::config::{Args, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Parse CLI arguments
//! let args = Args::parse();
//!
//! // Load configuration from file and environment
//! let config = Config::load(&args)?;
//!
//! println!("Server will bind to {}:{}", config.host, config.port);
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration Structure
//!
//! The configuration file is structured in YAML format. Key sections include:
//!
//! - **Server**: `host`, `port` - HTTP server binding configuration
//! - **Upstream**: `upstream.signing_secret`, `upstream.replay_tolerance` - Webhook verification
//! - **CRM**: `crm.base_url`, `crm.auth_url`, `crm.client_id` - Downstream connection and credentials
//! - **Limits**: `limits.tiers` - Sliding-window admission tiers for the CRM budget
//! - **Retry**: `retry.max_attempts`, `retry.backoff_ms` - Transient failure backoff schedule
//! - **Queue**: `queue.immediate`, `queue.deferred` - Per-lane worker pool settings
//! - **Batches**: `batch.size_threshold`, `batch.time_threshold` - Deferred window thresholds
//! - **Dedupe**: `dedupe.ttl` - Duplicate suppression retention
//! - **Routing**: `routing.overrides` - Per-kind lane overrides
//! - **Features**: `enable_metrics` - Optional feature toggles
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Override server port
//! CRMBRIDGE_PORT=8080
//!
//! # Set the webhook signing secret (preferred over placing it in the file)
//! CRMBRIDGE_UPSTREAM__SIGNING_SECRET="whsec_..."
//!
//! # Override nested values
//! CRMBRIDGE_CRM__CLIENT_SECRET=s3cret
//! CRMBRIDGE_ENABLE_METRICS=true
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};
use url::Url;

use conveyor::{Lane, RetryPolicy, WorkerConfig};

use crate::errors::Error;
use crate::routing::RouteOverride;
use crate::signature;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "CRMBRIDGE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    /// Useful for CI/CD pipelines to catch config errors before deployment.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// This is the root configuration structure loaded from YAML and environment variables.
/// All fields have sensible defaults defined in the `Default` implementation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Enable Prometheus metrics endpoint at `/metrics`
    pub enable_metrics: bool,
    /// Log output configuration
    pub logging: LoggingConfig,
    /// Upstream webhook verification settings
    pub upstream: UpstreamConfig,
    /// Downstream CRM connection and credential settings
    pub crm: CrmConfig,
    /// Rate limit tiers protecting the CRM call budget
    pub limits: LimitsConfig,
    /// Backoff schedule for transient delivery failures
    pub retry: RetryPolicy,
    /// Worker pool settings for the two queue lanes
    pub queue: QueueConfig,
    /// Accumulation windows for deferred events
    pub batch: BatchConfig,
    /// Duplicate event suppression settings
    pub dedupe: DedupeConfig,
    /// Event kind routing overrides
    pub routing: RoutingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            enable_metrics: true,
            logging: LoggingConfig::default(),
            upstream: UpstreamConfig::default(),
            crm: CrmConfig::default(),
            limits: LimitsConfig::default(),
            retry: RetryPolicy::default(),
            queue: QueueConfig::default(),
            batch: BatchConfig::default(),
            dedupe: DedupeConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default log filter when `RUST_LOG` is not set (e.g., "info", "crmbridge=debug")
    pub level: String,
    /// Emit logs as JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Upstream webhook verification settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Shared signing secret for webhook payloads (`whsec_` prefixed)
    pub signing_secret: Option<String>,
    /// Maximum age of a signed timestamp before the payload is rejected as a replay
    #[serde(with = "humantime_serde")]
    pub replay_tolerance: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            replay_tolerance: Duration::from_secs(5 * 60),
        }
    }
}

/// Downstream CRM connection and credential settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrmConfig {
    /// Base URL of the CRM REST API
    pub base_url: Url,
    /// OAuth token endpoint
    pub auth_url: Url,
    /// OAuth client id for the client-credentials grant
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Timeout applied to each CRM API call
    #[serde(with = "humantime_serde")]
    pub api_timeout: Duration,
    /// Tokens are refreshed this long before their advertised expiry
    #[serde(with = "humantime_serde")]
    pub token_margin: Duration,
    /// Assumed token lifetime when the token endpoint omits one
    #[serde(with = "humantime_serde")]
    pub token_fallback_lifetime: Duration,
    /// How often a pending bulk job is polled for completion
    #[serde(with = "humantime_serde")]
    pub bulk_poll_interval: Duration,
    /// Poll rounds before a pending bulk job is treated as a transient failure
    pub bulk_poll_attempts: u32,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://localhost:9090/api").unwrap(),
            auth_url: Url::parse("http://localhost:9090/oauth/token").unwrap(),
            client_id: String::new(),
            client_secret: String::new(),
            api_timeout: Duration::from_secs(30),
            token_margin: Duration::from_secs(5 * 60),
            token_fallback_lifetime: Duration::from_secs(90 * 60),
            bulk_poll_interval: Duration::from_secs(2),
            bulk_poll_attempts: 30,
        }
    }
}

/// One sliding-window admission tier.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitTier {
    /// Tier name reported in denials (e.g., "per_second")
    pub name: String,
    /// Admissions allowed inside one window
    pub limit: usize,
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

/// Rate limit tiers protecting the CRM call budget.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Tiers checked together for every CRM call
    pub tiers: Vec<RateLimitTier>,
    /// How long workers wait out denials mid-event before giving up
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                RateLimitTier {
                    name: "per_second".to_string(),
                    limit: 10,
                    window: Duration::from_secs(1),
                },
                RateLimitTier {
                    name: "per_minute".to_string(),
                    limit: 250,
                    window: Duration::from_secs(60),
                },
                RateLimitTier {
                    name: "per_day".to_string(),
                    limit: 15_000,
                    window: Duration::from_secs(86_400),
                },
            ],
            max_wait: Duration::from_secs(10),
        }
    }
}

/// Worker pool settings for one queue lane.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaneConfig {
    /// Maximum number of events to claim in each iteration
    pub claim_batch_size: usize,
    /// How long to sleep between claim iterations when the lane is empty
    #[serde(with = "humantime_serde")]
    pub claim_interval: Duration,
    /// Maximum number of events processed concurrently
    pub concurrency: usize,
    /// How long an event may stay claimed before it is handed back to the lane
    #[serde(with = "humantime_serde")]
    pub visibility_timeout: Duration,
    /// Releases allowed before an event is parked in the dead-letter sink
    pub max_redeliveries: u32,
    /// Interval for logging pool status; `None` disables the log line
    #[serde(default, with = "humantime_serde")]
    pub status_log_interval: Option<Duration>,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            claim_batch_size: 25,
            claim_interval: Duration::from_millis(500),
            concurrency: 8,
            visibility_timeout: Duration::from_secs(60),
            max_redeliveries: 5,
            status_log_interval: Some(Duration::from_secs(5)),
        }
    }
}

impl LaneConfig {
    pub fn to_worker_config(&self, lane: Lane) -> WorkerConfig {
        WorkerConfig {
            lane,
            claim_batch_size: self.claim_batch_size,
            claim_interval_ms: self.claim_interval.as_millis() as u64,
            concurrency: self.concurrency,
            visibility_timeout_ms: self.visibility_timeout.as_millis() as u64,
            max_redeliveries: self.max_redeliveries,
            status_log_interval_ms: self.status_log_interval.map(|i| i.as_millis() as u64),
        }
    }
}

/// Worker pool settings for the two queue lanes.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Lane for events applied one call at a time
    pub immediate: LaneConfig,
    /// Lane for events accumulated into bulk windows
    pub deferred: LaneConfig,
}

/// Readiness thresholds for one batch category.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryThresholds {
    /// Records that make a window ready regardless of age
    pub size_threshold: usize,
    /// Age that makes a window ready regardless of size
    #[serde(with = "humantime_serde")]
    pub time_threshold: Duration,
}

/// Accumulation windows for deferred events.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Default records-per-window readiness threshold
    pub size_threshold: usize,
    /// Default window-age readiness threshold
    #[serde(with = "humantime_serde")]
    pub time_threshold: Duration,
    /// Windows older than this are force-flushed even when not ready
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
    /// How often the flusher sweeps windows for readiness
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Per-category threshold overrides, keyed by category name
    pub categories: HashMap<String, CategoryThresholds>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size_threshold: 200,
            time_threshold: Duration::from_secs(30),
            stale_after: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(1),
            categories: HashMap::new(),
        }
    }
}

impl BatchConfig {
    /// Thresholds for `category`, falling back to the defaults.
    pub fn thresholds_for(&self, category: &str) -> CategoryThresholds {
        self.categories
            .get(category)
            .copied()
            .unwrap_or(CategoryThresholds {
                size_threshold: self.size_threshold,
                time_threshold: self.time_threshold,
            })
    }
}

/// Duplicate event suppression settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupeConfig {
    /// How long processed event ids are remembered
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Ceiling on remembered ids before the oldest are evicted
    pub max_entries: u64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
            max_entries: 1_000_000,
        }
    }
}

/// Event kind routing overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingConfig {
    /// Per-kind lane overrides, keyed by the wire name (e.g., "invoice.payment_failed")
    pub overrides: HashMap<String, RouteOverride>,
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(secret) = &self.upstream.signing_secret {
            if signature::decode_secret(secret).is_none() {
                return Err(Error::Internal {
                    operation: format!(
                        "Config validation: upstream.signing_secret must be a base64 secret prefixed with \"{}\"",
                        signature::SECRET_PREFIX
                    ),
                });
            }
        }

        if self.limits.tiers.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: limits.tiers must name at least one tier".to_string(),
            });
        }
        for tier in &self.limits.tiers {
            if tier.limit == 0 || tier.window.is_zero() {
                return Err(Error::Internal {
                    operation: format!(
                        "Config validation: tier \"{}\" must have a nonzero limit and window",
                        tier.name
                    ),
                });
            }
        }

        if self.batch.size_threshold == 0 || self.batch.time_threshold.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: batch.size_threshold and batch.time_threshold must be nonzero"
                    .to_string(),
            });
        }
        for (category, thresholds) in &self.batch.categories {
            if thresholds.size_threshold == 0 || thresholds.time_threshold.is_zero() {
                return Err(Error::Internal {
                    operation: format!(
                        "Config validation: batch category \"{category}\" must have nonzero thresholds"
                    ),
                });
            }
        }

        for (lane, config) in [("immediate", &self.queue.immediate), ("deferred", &self.queue.deferred)] {
            if config.concurrency == 0 || config.claim_batch_size == 0 {
                return Err(Error::Internal {
                    operation: format!(
                        "Config validation: queue.{lane} concurrency and claim_batch_size must be nonzero"
                    ),
                });
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::Internal {
                operation: "Config validation: retry.max_attempts must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("CRMBRIDGE_").split("__"))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
