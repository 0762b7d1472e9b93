//! Service configuration, read once from the environment at startup.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::db::PoolSettings;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// How the order service gets inventory decremented after persisting an order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AdjustStrategy {
    /// Call the inventory service over HTTP, keyed by order id.
    Direct,
    /// Publish `OrderCreated` and let the inventory consumer apply it.
    Event,
}

impl FromStr for AdjustStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(AdjustStrategy::Direct),
            "event" | "events" => Ok(AdjustStrategy::Event),
            _ => Err("expected 'direct' or 'event'".to_string()),
        }
    }
}

/// Settings shared by both services.
#[derive(Debug, Clone)]
pub struct CommonConfig {
    pub bind_addr: SocketAddr,
    /// `None` selects the in-memory stores.
    pub database_url: Option<String>,
    /// `None` selects the in-memory cache and bus.
    pub redis_url: Option<String>,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
    pub max_in_flight: usize,
    pub consumer_name: String,
    pub pool: PoolSettings,
}

#[derive(Debug, Clone)]
pub struct InventoryServiceConfig {
    pub common: CommonConfig,
    /// How long the order-decrement ledger remembers an order.
    pub ledger_retention: Duration,
}

#[derive(Debug, Clone)]
pub struct OrderServiceConfig {
    pub common: CommonConfig,
    pub inventory_service_url: String,
    pub inventory_timeout: Duration,
    pub adjust_strategy: AdjustStrategy,
    pub outbox_poll_interval: Duration,
    pub outbox_max_attempts: u32,
}

impl InventoryServiceConfig {
    pub const DEFAULT_BIND_ADDR: &'static str = "0.0.0.0:8082";

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let retention_hours: u64 = parse(&lookup, "LEDGER_RETENTION_HOURS", 168u64)?;
        if retention_hours == 0 {
            return Err(ConfigError::Invalid {
                key: "LEDGER_RETENTION_HOURS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            common: CommonConfig::from_lookup(&lookup, Self::DEFAULT_BIND_ADDR, "inventory")?,
            ledger_retention: Duration::from_secs(retention_hours.saturating_mul(3600)),
        })
    }
}

impl OrderServiceConfig {
    pub const DEFAULT_BIND_ADDR: &'static str = "0.0.0.0:8083";

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let common = CommonConfig::from_lookup(&lookup, Self::DEFAULT_BIND_ADDR, "orders")?;
        let inventory_service_url = lookup("INVENTORY_SERVICE_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| "http://localhost:8082".to_string());

        Ok(Self {
            common,
            inventory_service_url,
            inventory_timeout: Duration::from_millis(parse(&lookup, "INVENTORY_TIMEOUT_MS", 2000u64)?),
            adjust_strategy: parse(&lookup, "ADJUST_STRATEGY", AdjustStrategy::Direct)?,
            outbox_poll_interval: Duration::from_millis(parse(&lookup, "OUTBOX_POLL_MS", 1000u64)?),
            outbox_max_attempts: parse(&lookup, "OUTBOX_MAX_ATTEMPTS", 20u32)?,
        })
    }
}

impl CommonConfig {
    fn from_lookup(
        lookup: &impl Fn(&str) -> Option<String>,
        default_bind: &str,
        service: &str,
    ) -> Result<Self, ConfigError> {
        let bind_raw = lookup("BIND_ADDR").unwrap_or_else(|| default_bind.to_string());
        let bind_addr = bind_raw.parse::<SocketAddr>().map_err(|e| ConfigError::Invalid {
            key: "BIND_ADDR",
            value: bind_raw.clone(),
            reason: e.to_string(),
        })?;

        let max_in_flight: usize = parse(lookup, "MAX_IN_FLIGHT", 256usize)?;
        if max_in_flight == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_IN_FLIGHT",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let consumer_name = lookup("CONSUMER_NAME")
            .or_else(|| lookup("HOSTNAME"))
            .map(|host| format!("{service}-{host}"))
            .unwrap_or_else(|| format!("{service}-{}", std::process::id()));

        Ok(Self {
            bind_addr,
            database_url: non_empty(lookup("DATABASE_URL")),
            redis_url: non_empty(lookup("REDIS_URL")),
            cache_enabled: parse(lookup, "CACHE_ENABLED", true)?,
            cache_ttl: Duration::from_secs(parse(lookup, "CACHE_TTL_SECS", 300u64)?),
            max_in_flight,
            consumer_name,
            pool: PoolSettings {
                max_connections: parse(lookup, "DB_MAX_CONNECTIONS", 10u32)?,
                acquire_timeout: Duration::from_millis(parse(lookup, "DB_ACQUIRE_TIMEOUT_MS", 3000u64)?),
            },
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup(key)) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_select_in_memory_infrastructure() {
        let cfg = OrderServiceConfig::from_lookup(env(&[])).unwrap();
        assert_eq!(cfg.common.bind_addr.port(), 8083);
        assert!(cfg.common.database_url.is_none());
        assert!(cfg.common.redis_url.is_none());
        assert!(cfg.common.cache_enabled);
        assert_eq!(cfg.common.cache_ttl, Duration::from_secs(300));
        assert_eq!(cfg.inventory_service_url, "http://localhost:8082");
        assert_eq!(cfg.inventory_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.adjust_strategy, AdjustStrategy::Direct);
        assert_eq!(cfg.outbox_max_attempts, 20);

        let inv = InventoryServiceConfig::from_lookup(env(&[])).unwrap();
        assert_eq!(inv.common.bind_addr.port(), 8082);
        assert_eq!(inv.ledger_retention, Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = OrderServiceConfig::from_lookup(env(&[
            ("ADJUST_STRATEGY", "event"),
            ("CACHE_ENABLED", "false"),
            ("INVENTORY_SERVICE_URL", "http://inventory:8082/"),
            ("CONSUMER_NAME", "a"),
        ]))
        .unwrap();
        assert_eq!(cfg.adjust_strategy, AdjustStrategy::Event);
        assert!(!cfg.common.cache_enabled);
        assert_eq!(cfg.inventory_service_url, "http://inventory:8082");
        assert_eq!(cfg.common.consumer_name, "orders-a");
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = OrderServiceConfig::from_lookup(env(&[("ADJUST_STRATEGY", "carrier-pigeon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ADJUST_STRATEGY", .. }));

        let err = InventoryServiceConfig::from_lookup(env(&[("MAX_IN_FLIGHT", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAX_IN_FLIGHT", .. }));

        let err = InventoryServiceConfig::from_lookup(env(&[("LEDGER_RETENTION_HOURS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "LEDGER_RETENTION_HOURS", .. }));
    }
}
