use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, anyhow};

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BIND: &str = "127.0.0.1:4010";

/// Connection pool settings for the Postgres store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: Option<u32>,
    /// Maximum time to wait for a connection from the pool.
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: None,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Service settings, read from the environment.
///
/// | variable                   | default          |
/// |----------------------------|------------------|
/// | `DATABASE_URL`             | required         |
/// | `DAG_MAX_CONNECTIONS`      | 5                |
/// | `DAG_ACQUIRE_TIMEOUT_SECS` | 30               |
/// | `DAG_OPERATION_TIMEOUT_MS` | none             |
/// | `DAG_BIND`                 | `127.0.0.1:4010` |
#[derive(Debug, Clone)]
pub struct DagConfig {
    pub database_url: String,
    pub pool: PoolConfig,
    /// Deadline applied to every graph operation.
    pub operation_timeout: Option<Duration>,
    pub bind: SocketAddr,
}

impl DagConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let database_url = var("DATABASE_URL").ok_or_else(|| anyhow!("DATABASE_URL is required"))?;

        let max_connections = match var("DAG_MAX_CONNECTIONS") {
            Some(raw) => raw
                .parse::<u32>()
                .with_context(|| format!("invalid DAG_MAX_CONNECTIONS '{}'", raw))?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let acquire_timeout = match var("DAG_ACQUIRE_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(
                raw.parse::<u64>()
                    .with_context(|| format!("invalid DAG_ACQUIRE_TIMEOUT_SECS '{}'", raw))?,
            ),
            None => Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        };

        let operation_timeout = var("DAG_OPERATION_TIMEOUT_MS")
            .map(|raw| {
                raw.parse::<u64>()
                    .map(Duration::from_millis)
                    .with_context(|| format!("invalid DAG_OPERATION_TIMEOUT_MS '{}'", raw))
            })
            .transpose()?;

        let bind = var("DAG_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid DAG_BIND '{}'", bind))?;

        Ok(Self {
            database_url,
            pool: PoolConfig {
                max_connections,
                acquire_timeout,
                ..PoolConfig::default()
            },
            operation_timeout,
            bind,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config = DagConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/dag")]))
            .expect("config should load");

        assert_eq!(config.database_url, "postgres://localhost/dag");
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.operation_timeout, None);
        assert_eq!(config.bind, "127.0.0.1:4010".parse().expect("addr"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = DagConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/dag"),
            ("DAG_MAX_CONNECTIONS", "12"),
            ("DAG_ACQUIRE_TIMEOUT_SECS", "3"),
            ("DAG_OPERATION_TIMEOUT_MS", "250"),
            ("DAG_BIND", "0.0.0.0:8080"),
        ]))
        .expect("config should load");

        assert_eq!(config.pool.max_connections, 12);
        assert_eq!(config.pool.acquire_timeout, Duration::from_secs(3));
        assert_eq!(config.operation_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.bind.port(), 8080);
    }

    #[test]
    fn missing_database_url_is_an_error() {
        let err = DagConfig::from_lookup(lookup(&[])).expect_err("should fail");
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn invalid_numbers_are_reported() {
        let err = DagConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/dag"),
            ("DAG_MAX_CONNECTIONS", "many"),
        ]))
        .expect_err("should fail");
        assert!(err.to_string().contains("DAG_MAX_CONNECTIONS"));
    }
}
