//! Configuration for the pool fee indexer
//!
//! All settings come from environment variables (with `.env` support) or a
//! TOML file. Credentials the pipeline cannot run without are optional here
//! and checked by the `require_*` accessors, so each component decides
//! whether a missing value is fatal for it.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

// ============================================
// CONSTANTS
// ============================================

/// Etherscan API base URL (v2 supports multiple chains)
pub const DEFAULT_ETHERSCAN_API_URL: &str = "https://api.etherscan.io/v2/api";

/// Binance spot REST base URL
pub const DEFAULT_BINANCE_API_URL: &str = "https://api.binance.com";

/// Symbol used to price the native asset in the quote currency
pub const DEFAULT_PRICE_SYMBOL: &str = "ETHUSDT";

/// Minimum price cache TTL (5 minutes)
pub const MIN_PRICE_CACHE_TTL_SECS: u64 = 300;

// ============================================
// CONFIG ERRORS
// ============================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not defined")]
    Missing(&'static str),

    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================
// MAIN CONFIGURATION
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // ========== Chain ==========
    /// Full RPC URL; takes precedence over `infura_api_key`
    pub rpc_url: Option<String>,

    /// Infura project key, expanded to the mainnet endpoint
    pub infura_api_key: Option<String>,

    /// Pool contract whose Swap events are indexed
    pub pool_address: Option<String>,

    /// Chain ID (1 = Ethereum Mainnet)
    pub chain_id: u64,

    /// Interval between log filter polls
    pub log_poll_interval_ms: u64,

    // ========== History API ==========
    pub etherscan_api_key: Option<String>,
    pub etherscan_api_url: String,

    /// Page size ceiling for tokentx requests (Etherscan max: 10k)
    pub sync_batch_size: usize,

    // ========== Price API ==========
    pub binance_api_url: String,
    pub binance_api_key: Option<String>,
    pub price_symbol: String,
    pub price_cache_ttl_secs: u64,

    /// Wait applied to a 429 without a Retry-After header
    pub rate_limit_fallback_secs: u64,

    /// Pause applied once the used-weight header nears the budget
    pub rate_limit_cooldown_secs: u64,

    /// Request weight allowed per minute by the price API
    pub rate_limit_weight_budget: u32,

    /// Fraction of the weight budget that triggers a cooldown
    pub rate_limit_usage_threshold: f64,

    // ========== Storage ==========
    pub database_url: Option<String>,
    pub redis_queue_url: String,
    pub redis_cache_url: String,

    // ========== Queue / Worker ==========
    pub queue_name: String,
    pub job_attempts: u32,
    pub job_backoff_ms: u64,
    pub worker_concurrency: usize,
    pub lock_duration_secs: u64,
    pub stalled_interval_secs: u64,
    pub max_stalled_count: u32,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn redis_url(url_key: &str, host_key: &str, port_key: &str, default_host: &str) -> String {
    env_opt(url_key).unwrap_or_else(|| {
        let host = env::var(host_key).unwrap_or_else(|_| default_host.to_string());
        let port: u16 = env_or(port_key, 6379);
        format!("redis://{}:{}", host, port)
    })
}

impl Config {
    /// Load configuration from environment variables and .env file
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        Self {
            rpc_url: env_opt("RPC_URL"),
            infura_api_key: env_opt("INFURA_API_KEY"),
            pool_address: env_opt("UNISWAP_POOL_ADDRESS"),
            chain_id: env_or("CHAIN_ID", defaults.chain_id),
            log_poll_interval_ms: env_or("LOG_POLL_INTERVAL_MS", defaults.log_poll_interval_ms),

            etherscan_api_key: env_opt("ETHERSCAN_API_KEY"),
            etherscan_api_url: env::var("ETHERSCAN_API_URL").unwrap_or(defaults.etherscan_api_url),
            sync_batch_size: env_or("SYNC_BATCH_SIZE", defaults.sync_batch_size),

            binance_api_url: env::var("BINANCE_API_URL").unwrap_or(defaults.binance_api_url),
            binance_api_key: env_opt("BINANCE_API_KEY"),
            price_symbol: env::var("PRICE_SYMBOL").unwrap_or(defaults.price_symbol),
            price_cache_ttl_secs: env_or("PRICE_CACHE_TTL_SECS", defaults.price_cache_ttl_secs),
            rate_limit_fallback_secs: env_or(
                "RATE_LIMIT_FALLBACK_SECS",
                defaults.rate_limit_fallback_secs,
            ),
            rate_limit_cooldown_secs: env_or(
                "RATE_LIMIT_COOLDOWN_SECS",
                defaults.rate_limit_cooldown_secs,
            ),
            rate_limit_weight_budget: env_or(
                "RATE_LIMIT_WEIGHT_BUDGET",
                defaults.rate_limit_weight_budget,
            ),
            rate_limit_usage_threshold: env_or(
                "RATE_LIMIT_USAGE_THRESHOLD",
                defaults.rate_limit_usage_threshold,
            ),

            database_url: env_opt("DATABASE_URL"),
            redis_queue_url: redis_url(
                "REDIS_QUEUE_URL",
                "REDIS_QUEUE_HOST",
                "REDIS_QUEUE_PORT",
                "redis-queue",
            ),
            redis_cache_url: redis_url(
                "REDIS_CACHE_URL",
                "REDIS_CACHE_HOST",
                "REDIS_CACHE_PORT",
                "redis-cache",
            ),

            queue_name: env::var("QUEUE_NAME").unwrap_or(defaults.queue_name),
            job_attempts: env_or("JOB_ATTEMPTS", defaults.job_attempts),
            job_backoff_ms: env_or("JOB_BACKOFF_MS", defaults.job_backoff_ms),
            worker_concurrency: env_or("WORKER_CONCURRENCY", defaults.worker_concurrency),
            lock_duration_secs: env_or("LOCK_DURATION_SECS", defaults.lock_duration_secs),
            stalled_interval_secs: env_or("STALLED_INTERVAL_SECS", defaults.stalled_interval_secs),
            max_stalled_count: env_or("MAX_STALLED_COUNT", defaults.max_stalled_count),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> eyre::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Sanity checks on tunables. Credentials are checked where they are used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 || self.worker_concurrency > 32 {
            return Err(ConfigError::Invalid {
                key: "WORKER_CONCURRENCY",
                reason: format!("must be between 1 and 32 (got {})", self.worker_concurrency),
            });
        }
        if self.job_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "JOB_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sync_batch_size == 0 || self.sync_batch_size > 10_000 {
            return Err(ConfigError::Invalid {
                key: "SYNC_BATCH_SIZE",
                reason: format!("must be between 1 and 10000 (got {})", self.sync_batch_size),
            });
        }
        if self.price_cache_ttl_secs < MIN_PRICE_CACHE_TTL_SECS {
            return Err(ConfigError::Invalid {
                key: "PRICE_CACHE_TTL_SECS",
                reason: format!("must be at least {}s", MIN_PRICE_CACHE_TTL_SECS),
            });
        }
        if !(self.rate_limit_usage_threshold > 0.0 && self.rate_limit_usage_threshold <= 1.0) {
            return Err(ConfigError::Invalid {
                key: "RATE_LIMIT_USAGE_THRESHOLD",
                reason: "must be in (0, 1]".to_string(),
            });
        }
        if self.lock_duration_secs == 0 || self.stalled_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "LOCK_DURATION_SECS",
                reason: "lock duration and stalled interval must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    // ============================================
    // REQUIRED SETTINGS
    // ============================================

    /// RPC endpoint, from `RPC_URL` or expanded from `INFURA_API_KEY`
    pub fn require_rpc_url(&self) -> Result<String, ConfigError> {
        if let Some(url) = &self.rpc_url {
            return Ok(url.clone());
        }
        self.infura_api_key
            .as_ref()
            .map(|key| format!("https://mainnet.infura.io/v3/{}", key))
            .ok_or(ConfigError::Missing("INFURA_API_KEY"))
    }

    pub fn require_pool_address(&self) -> Result<Address, ConfigError> {
        let raw = self
            .pool_address
            .as_deref()
            .ok_or(ConfigError::Missing("UNISWAP_POOL_ADDRESS"))?;
        Address::from_str(raw.trim()).map_err(|e| ConfigError::Invalid {
            key: "UNISWAP_POOL_ADDRESS",
            reason: e.to_string(),
        })
    }

    pub fn require_etherscan_key(&self) -> Result<String, ConfigError> {
        self.etherscan_api_key
            .clone()
            .ok_or(ConfigError::Missing("ETHERSCAN_API_KEY"))
    }

    pub fn require_database_url(&self) -> Result<String, ConfigError> {
        self.database_url
            .clone()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    // ============================================
    // DERIVED SETTINGS
    // ============================================

    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval_ms)
    }

    pub fn job_backoff(&self) -> Duration {
        Duration::from_millis(self.job_backoff_ms)
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        let set = |v: bool| if v { "✓ Configured" } else { "✗ Not Set" };
        println!("╔════════════════════════════════════════════════════════════╗");
        println!("║              POOL FEE INDEXER - CONFIGURATION              ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ Chain ID:          {:^40} ║", self.chain_id);
        println!("║ RPC:               {:^40} ║", set(self.rpc_url.is_some() || self.infura_api_key.is_some()));
        println!("║ Pool Address:      {:^40} ║", set(self.pool_address.is_some()));
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ DISCOVERY                                                  ║");
        println!("║ • Etherscan API:   {:^40} ║", set(self.etherscan_api_key.is_some()));
        println!("║ • Batch Size:      {:^40} ║", self.sync_batch_size);
        println!("║ • Poll Interval:   {:>37} ms ║", self.log_poll_interval_ms);
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ PRICING                                                    ║");
        println!("║ • Symbol:          {:^40} ║", self.price_symbol);
        println!("║ • Cache TTL:       {:>38} s ║", self.price_cache_ttl_secs);
        println!("║ • Weight Budget:   {:^40} ║", self.rate_limit_weight_budget);
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ QUEUE / WORKER                                             ║");
        println!("║ • Queue:           {:^40} ║", self.queue_name);
        println!("║ • Attempts:        {:^40} ║", self.job_attempts);
        println!("║ • Backoff:         {:>37} ms ║", self.job_backoff_ms);
        println!("║ • Concurrency:     {:^40} ║", self.worker_concurrency);
        println!("║ • Database:        {:^40} ║", set(self.database_url.is_some()));
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: None,
            infura_api_key: None,
            pool_address: None,
            chain_id: 1,
            log_poll_interval_ms: 4_000,
            etherscan_api_key: None,
            etherscan_api_url: DEFAULT_ETHERSCAN_API_URL.to_string(),
            sync_batch_size: 10_000,
            binance_api_url: DEFAULT_BINANCE_API_URL.to_string(),
            binance_api_key: None,
            price_symbol: DEFAULT_PRICE_SYMBOL.to_string(),
            price_cache_ttl_secs: MIN_PRICE_CACHE_TTL_SECS,
            rate_limit_fallback_secs: 30,
            rate_limit_cooldown_secs: 60,
            rate_limit_weight_budget: 6_000,
            rate_limit_usage_threshold: 0.9,
            database_url: None,
            redis_queue_url: "redis://redis-queue:6379".to_string(),
            redis_cache_url: "redis://redis-cache:6379".to_string(),
            queue_name: crate::queue::TX_QUEUE_NAME.to_string(),
            job_attempts: 5,
            job_backoff_ms: 5_000,
            worker_concurrency: 1,
            lock_duration_secs: 30,
            stalled_interval_secs: 30,
            max_stalled_count: 3,
        }
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.job_attempts, 5);
        assert_eq!(config.job_backoff(), Duration::from_secs(5));
        assert_eq!(config.price_cache_ttl_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_credentials_are_typed_errors() {
        let config = Config::default();
        assert_eq!(config.require_rpc_url(), Err(ConfigError::Missing("INFURA_API_KEY")));
        assert_eq!(
            config.require_pool_address(),
            Err(ConfigError::Missing("UNISWAP_POOL_ADDRESS"))
        );
        assert_eq!(
            config.require_etherscan_key(),
            Err(ConfigError::Missing("ETHERSCAN_API_KEY"))
        );
        assert_eq!(config.require_database_url(), Err(ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn test_rpc_url_prefers_explicit_url() {
        let mut config = Config::default();
        config.infura_api_key = Some("abc".to_string());
        assert_eq!(config.require_rpc_url().unwrap(), "https://mainnet.infura.io/v3/abc");

        config.rpc_url = Some("http://localhost:8545".to_string());
        assert_eq!(config.require_rpc_url().unwrap(), "http://localhost:8545");
    }

    #[test]
    fn test_invalid_pool_address() {
        let mut config = Config::default();
        config.pool_address = Some("not-an-address".to_string());
        assert!(matches!(
            config.require_pool_address(),
            Err(ConfigError::Invalid { key: "UNISWAP_POOL_ADDRESS", .. })
        ));

        config.pool_address = Some("0x11b815efB8f581194ae79006d24E0d814B7697F6".to_string());
        assert!(config.require_pool_address().is_ok());
    }

    #[test]
    fn test_validate_rejects_short_cache_ttl() {
        let config = Config { price_cache_ttl_secs: 60, ..Config::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "PRICE_CACHE_TTL_SECS", .. })
        ));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            pool_address = "0x11b815efB8f581194ae79006d24E0d814B7697F6"
            worker_concurrency = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.job_attempts, 5);
        assert_eq!(config.queue_name, "transaction-queue");
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = Config { worker_concurrency: 0, ..Config::default() };
        assert!(config.validate().is_err());
    }
}
