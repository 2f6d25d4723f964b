//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `PAYWATCH_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `PAYWATCH_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `PAYWATCH_WEBHOOKS__MAX_ATTEMPTS=3` sets the `webhooks.max_attempts` field.
//!
//! ## Usage
//!
//! ```no_run
//! use clap::Parser;
//! use paywatch::config::{Args, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let args = Args::parse();
//! let config = Config::load(&args)?;
//!
//! println!("Webhook attempts: {}", config.webhooks.max_attempts);
//! # Ok(())
//! # }
//! ```
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Re-queue failed invoice evaluations after 30 seconds
//! PAYWATCH_WATCHER__RETRY_DELAY=30s
//!
//! # Disable webhook delivery entirely
//! PAYWATCH_WEBHOOKS__ENABLED=false
//!
//! # Export traces over OTLP
//! PAYWATCH_ENABLE_OTEL_EXPORT=true
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "PAYWATCH_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the engine.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have defaults, so an empty or missing file yields a runnable engine.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Invoice state machine settings
    pub watcher: WatcherConfig,
    /// Webhook delivery settings
    pub webhooks: WebhookConfig,
    /// Export traces via OTLP (endpoint configured with the standard `OTEL_*` variables)
    pub enable_otel_export: bool,
}

/// Invoice watcher configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatcherConfig {
    /// Delay before re-evaluating an invoice whose evaluation failed (default: 10s)
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Evaluation passes per watch request before yielding back to the queue (default: 5)
    pub max_evaluation_loops: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(10),
            max_evaluation_loops: 5,
        }
    }
}

/// Webhook delivery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookConfig {
    /// Enable webhook delivery (default: true)
    pub enabled: bool,
    /// Hard timeout for one HTTP delivery attempt (default: 1m)
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Delay before each automatic redelivery, in seconds. Retry `k` waits entry `k - 1`; the
    /// last entry repeats if `max_attempts` outruns the list.
    ///
    /// Default: [10, 60, 600, 600, 600, 600, 600, 600]
    pub redelivery_schedule_secs: Vec<u64>,
    /// Attempts per event including the first (default: 8)
    pub max_attempts: u32,
    /// How long shutdown waits for in-flight deliveries (default: 10s)
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(60),
            redelivery_schedule_secs: vec![10, 60, 600, 600, 600, 600, 600, 600],
            max_attempts: 8,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl WebhookConfig {
    /// Delay before attempt number `attempt` (1-based; the first attempt is not delayed).
    pub fn redelivery_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt < 2 || attempt > self.max_attempts {
            return None;
        }
        let index = (attempt as usize - 2).min(self.redelivery_schedule_secs.len().saturating_sub(1));
        self.redelivery_schedule_secs.get(index).copied().map(Duration::from_secs)
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // PAYWATCH_CONFIG names the file itself
            .merge(Env::prefixed("PAYWATCH_").ignore(&["config"]).split("__"))
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<(), Error> {
        if self.watcher.max_evaluation_loops == 0 {
            return Err(Error::Internal {
                operation: "Config validation: watcher.max_evaluation_loops must be at least 1".to_string(),
            });
        }

        if self.webhooks.max_attempts == 0 {
            return Err(Error::Internal {
                operation: "Config validation: webhooks.max_attempts must be at least 1".to_string(),
            });
        }

        if self.webhooks.max_attempts > 1 && self.webhooks.redelivery_schedule_secs.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: webhooks.redelivery_schedule_secs cannot be empty when max_attempts > 1"
                    .to_string(),
            });
        }

        if self.webhooks.timeout.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: webhooks.timeout must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}
