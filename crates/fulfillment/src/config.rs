//! Service configuration loaded from environment variables.

use common::ProductId;
use inventory::InventoryConfig;
use outbox::OutboxConfig;
use saga::SagaConfig;
use thiserror::Error;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid SEED_STOCK entry {0:?}, expected SKU=quantity")]
    InvalidSeedEntry(String),

    #[error("Invalid PAYMENT_FAILURE_RATE {0:?}, expected a number between 0 and 1")]
    InvalidFailureRate(String),
}

/// Service configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for JSON lines, anything else for text
/// - `DATABASE_URL`: PostgreSQL system of record; in-memory when unset
/// - `REDIS_URL`: Redis counter tier (feature `redis`); in-memory when unset
/// - `PAYMENT_FAILURE_RATE`: decline probability of the simulated gateway (default: `0.1`)
/// - `SEED_STOCK`: `SKU=qty,SKU=qty` stock to seed at start-up
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub payment_failure_rate: f64,
    pub seed_stock: Vec<(ProductId, i64)>,
    pub outbox: OutboxConfig,
    pub inventory: InventoryConfig,
    pub saga: SagaConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let payment_failure_rate = match std::env::var("PAYMENT_FAILURE_RATE") {
            Ok(raw) => parse_failure_rate(&raw)?,
            Err(_) => defaults.payment_failure_rate,
        };
        let seed_stock = match std::env::var("SEED_STOCK") {
            Ok(raw) => parse_seed_stock(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match std::env::var("LOG_FORMAT") {
                Ok(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            database_url: non_empty_var("DATABASE_URL"),
            redis_url: non_empty_var("REDIS_URL"),
            payment_failure_rate,
            seed_stock,
            ..defaults
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            redis_url: None,
            payment_failure_rate: 0.1,
            seed_stock: Vec::new(),
            outbox: OutboxConfig::default(),
            inventory: InventoryConfig::default(),
            saga: SagaConfig::default(),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parses `SKU=qty,SKU=qty`. Blank entries are skipped.
pub fn parse_seed_stock(raw: &str) -> Result<Vec<(ProductId, i64)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let invalid = || ConfigError::InvalidSeedEntry(entry.to_string());
            let (sku, quantity) = entry.split_once('=').ok_or_else(invalid)?;
            let sku = sku.trim();
            let quantity: i64 = quantity.trim().parse().map_err(|_| invalid())?;
            if sku.is_empty() || quantity < 0 {
                return Err(invalid());
            }
            Ok((ProductId::new(sku), quantity))
        })
        .collect()
}

fn parse_failure_rate(raw: &str) -> Result<f64, ConfigError> {
    match raw.trim().parse::<f64>() {
        Ok(rate) if (0.0..=1.0).contains(&rate) => Ok(rate),
        _ => Err(ConfigError::InvalidFailureRate(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.database_url.is_none());
        assert!(config.redis_url.is_none());
        assert!((config.payment_failure_rate - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_seed_stock_parsing() {
        let parsed = parse_seed_stock("SKU-1=10, SKU-2 = 0,,").unwrap();
        assert_eq!(
            parsed,
            vec![(ProductId::new("SKU-1"), 10), (ProductId::new("SKU-2"), 0)]
        );
        assert!(parse_seed_stock("").unwrap().is_empty());
    }

    #[test]
    fn test_seed_stock_rejects_malformed_entries() {
        assert_eq!(
            parse_seed_stock("SKU-1"),
            Err(ConfigError::InvalidSeedEntry("SKU-1".to_string()))
        );
        assert!(parse_seed_stock("SKU-1=ten").is_err());
        assert!(parse_seed_stock("=5").is_err());
        assert!(parse_seed_stock("SKU-1=-3").is_err());
    }

    #[test]
    fn test_failure_rate_bounds() {
        assert_eq!(parse_failure_rate("0.25"), Ok(0.25));
        assert_eq!(parse_failure_rate("1"), Ok(1.0));
        assert!(parse_failure_rate("1.5").is_err());
        assert!(parse_failure_rate("NaN").is_err());
    }
}
