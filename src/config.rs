// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Marketplace configuration. All knobs default to production values and can
// be overridden through environment variables at startup.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MarketplaceConfig {
    pub listen_addr: String,
    /// Agents silent for longer than this are marked unhealthy and their
    /// jobs reassigned.
    pub heartbeat_timeout: Duration,
    /// Effective job timeout = declared timeout x this buffer.
    pub timeout_buffer: f64,
    /// Maintenance loop cadence.
    pub rebalance_interval: Duration,
    /// Retry budget per job before abandonment.
    pub max_retries: u32,
    /// Parallelism of payment submission.
    pub settlement_workers: usize,
    /// Retry delays after a failed payment submission; once exhausted the
    /// payment is parked for manual review.
    pub settlement_backoff: Vec<Duration>,
    /// Deadline on a single external pay call.
    pub settlement_timeout: Duration,
    /// Per-agent concurrency default at registration.
    pub default_max_concurrent: u32,
    /// Wallet the marketplace pays rewards from.
    pub marketplace_wallet: String,
    /// Credential for the admin endpoints.
    pub admin_key: String,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            heartbeat_timeout: Duration::from_secs(60),
            timeout_buffer: 1.2,
            rebalance_interval: Duration::from_secs(30),
            max_retries: 3,
            settlement_workers: 4,
            settlement_backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(300),
                Duration::from_secs(1800),
            ],
            settlement_timeout: Duration::from_secs(30),
            default_max_concurrent: 2,
            marketplace_wallet: String::new(),
            admin_key: String::new(),
        }
    }
}

impl MarketplaceConfig {
    /// Build a config from the process environment, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let listen_addr = env::var("API_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .map(|p| format!("0.0.0.0:{}", p))
            .unwrap_or(defaults.listen_addr);

        Self {
            listen_addr,
            heartbeat_timeout: env_secs("HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout),
            timeout_buffer: env_parse("JOB_TIMEOUT_BUFFER", defaults.timeout_buffer),
            rebalance_interval: env_secs("REBALANCE_INTERVAL_SECS", defaults.rebalance_interval),
            max_retries: env_parse("MAX_JOB_RETRIES", defaults.max_retries),
            settlement_workers: env_parse("SETTLEMENT_WORKERS", defaults.settlement_workers),
            settlement_backoff: defaults.settlement_backoff,
            settlement_timeout: env_secs("SETTLEMENT_TIMEOUT_SECS", defaults.settlement_timeout),
            default_max_concurrent: env_parse(
                "DEFAULT_MAX_CONCURRENT",
                defaults.default_max_concurrent,
            ),
            marketplace_wallet: env::var("MARKETPLACE_WALLET").unwrap_or_default(),
            admin_key: env::var("ADMIN_API_KEY").unwrap_or_default(),
        }
    }

    pub fn heartbeat_timeout_ms(&self) -> u64 {
        self.heartbeat_timeout.as_millis() as u64
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
