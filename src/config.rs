//! Configuration handling for the persistence core.
//!
//! The external configuration source (an `application.yml`-style document) is
//! deserialized once at startup through [`Settings::from_yaml_str`] and
//! validated in the same step. Everything downstream consumes immutable value
//! objects derived from it; there is no post-construction mutation and no
//! hidden global container.

use crate::error::{StoreError, StoreResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

pub const DEFAULT_VALIDATION_QUERY: &str = "select 1;";

// Idle connections beyond minIdle are reclaimed after this inactivity window.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
// Interval between keep-alive pings of an idle pool.
pub const DEFAULT_KEEP_ALIVE_INTERVAL_SECS: u64 = 60;

/// Database backend driver for a logical store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    MySql,
    Postgres,
    Sqlite,
}

impl Driver {
    /// Check whether a connection URL scheme belongs to this driver.
    fn matches_scheme(&self, scheme: &str) -> bool {
        match self {
            Driver::MySql => scheme == "mysql",
            Driver::Postgres => scheme == "postgres" || scheme == "postgresql",
            Driver::Sqlite => scheme == "sqlite",
        }
    }
}

impl FromStr for Driver {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" => Ok(Driver::MySql),
            "postgres" | "postgresql" => Ok(Driver::Postgres),
            "sqlite" => Ok(Driver::Sqlite),
            other => Err(StoreError::configuration(format!(
                "Unknown driver '{}' (expected mysql, postgres, or sqlite)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Driver::MySql => write!(f, "mysql"),
            Driver::Postgres => write!(f, "postgres"),
            Driver::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Connection parameters for one named logical store.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSettings {
    pub driver: Driver,
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Shared sizing and timeout knobs plus the per-store credential map.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceSettings {
    pub initial_size: u32,
    pub max_active: u32,
    pub min_idle: u32,
    /// Maximum time to wait for a pooled connection, in milliseconds.
    pub max_wait: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
    #[serde(default = "default_validation_query")]
    pub validation_query: String,
    pub stores: HashMap<String, StoreSettings>,
}

fn default_keep_alive() -> bool {
    true
}

fn default_validation_query() -> String {
    DEFAULT_VALIDATION_QUERY.to_string()
}

impl DataSourceSettings {
    /// Build the immutable pool description for one named store.
    pub fn pool_config(&self, name: &str) -> StoreResult<PoolConfig> {
        let store = self.stores.get(name).ok_or_else(|| {
            StoreError::configuration(format!("No store named '{}' in configuration", name))
        })?;
        Ok(PoolConfig {
            driver: store.driver,
            url: store.url.clone(),
            username: store.username.clone(),
            password: store.password.clone(),
            initial_size: self.initial_size.min(self.max_active),
            max_active: self.max_active,
            min_idle: self.min_idle,
            max_wait: Duration::from_millis(self.max_wait),
            keep_alive: self.keep_alive,
            validation_query: self.validation_query.clone(),
        })
    }

    /// Pool descriptions for every configured store.
    pub fn pool_configs(&self) -> StoreResult<Vec<(String, PoolConfig)>> {
        self.stores
            .keys()
            .map(|name| Ok((name.clone(), self.pool_config(name)?)))
            .collect()
    }
}

/// Pool sizing for the cache backend connection pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachePoolSettings {
    pub max_active: u32,
    /// Accepted for configuration-schema compatibility. The cache pool
    /// retains up to `maxActive` idle connections and does not apply a
    /// separate idle ceiling.
    pub max_idle: u32,
    /// Accepted for configuration-schema compatibility; the cache pool
    /// does not pre-warm idle connections.
    pub min_idle: u32,
    /// Interval between idle-eviction runs, in milliseconds. Accepted for
    /// configuration-schema compatibility; the backend pool owns eviction
    /// scheduling.
    #[serde(default)]
    pub time_between_eviction_runs: Option<u64>,
    /// Maximum time to wait for a pooled cache connection, in milliseconds.
    pub max_wait: u64,
}

/// Connection parameters for the shared cache store.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSettings {
    pub host: String,
    pub port: u16,
    /// Redis logical database index.
    #[serde(default)]
    pub database: u32,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub pool: CachePoolSettings,
}

impl CacheSettings {
    /// Build the backend connection URL from host/port/database/credentials.
    pub fn connection_url(&self) -> String {
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
            (None, Some(pass)) => format!(":{}@", pass),
            (Some(user), None) => format!("{}@", user),
            (None, None) => String::new(),
        };
        format!(
            "redis://{}{}:{}/{}",
            auth, self.host, self.port, self.database
        )
    }
}

/// Top-level configuration consumed by the persistence core.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub datasource: DataSourceSettings,
    pub cache: CacheSettings,
}

impl Settings {
    /// Deserialize and validate settings from a YAML document.
    ///
    /// This is the single configuration entry point: anything that passes
    /// here is structurally sound, so downstream construction only has to
    /// deal with reachability failures.
    pub fn from_yaml_str(raw: &str) -> StoreResult<Self> {
        let settings: Settings = serde_yaml::from_str(raw)
            .map_err(|e| StoreError::configuration(format!("Malformed configuration: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> StoreResult<()> {
        let ds = &self.datasource;
        if ds.stores.is_empty() {
            return Err(StoreError::configuration(
                "At least one store must be configured under datasource.stores",
            ));
        }
        if ds.max_active == 0 {
            return Err(StoreError::configuration("maxActive must be greater than 0"));
        }
        if ds.initial_size > ds.max_active {
            return Err(StoreError::configuration(format!(
                "initialSize ({}) cannot exceed maxActive ({})",
                ds.initial_size, ds.max_active
            )));
        }
        if ds.min_idle > ds.max_active {
            return Err(StoreError::configuration(format!(
                "minIdle ({}) cannot exceed maxActive ({})",
                ds.min_idle, ds.max_active
            )));
        }
        for (name, store) in &ds.stores {
            let url = Url::parse(&store.url).map_err(|e| {
                StoreError::configuration(format!("Invalid URL for store '{}': {}", name, e))
            })?;
            if !store.driver.matches_scheme(url.scheme()) {
                return Err(StoreError::configuration(format!(
                    "Store '{}' declares driver '{}' but its URL scheme is '{}'",
                    name,
                    store.driver,
                    url.scheme()
                )));
            }
        }
        if self.cache.pool.max_active == 0 {
            return Err(StoreError::configuration(
                "cache.pool.maxActive must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Immutable value describing one pool's sizing and timeout knobs plus the
/// store's connection credentials. Constructed once from [`Settings`], then
/// shared by reference; fields never mutate after registry construction.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub driver: Driver,
    pub url: String,
    pub username: String,
    pub password: String,
    pub initial_size: u32,
    pub max_active: u32,
    pub min_idle: u32,
    pub max_wait: Duration,
    pub keep_alive: bool,
    pub validation_query: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
datasource:
  initialSize: 2
  maxActive: 5
  minIdle: 1
  maxWait: 2000
  keepAlive: true
  stores:
    common:
      driver: mysql
      url: "mysql://localhost:3306/common"
      username: app
      password: secret
    gateway:
      driver: postgres
      url: "postgres://localhost:5432/gateway"
      username: app
      password: secret
cache:
  host: localhost
  port: 6379
  database: 3
  password: hunter2
  pool:
    maxActive: 8
    maxIdle: 8
    minIdle: 0
    timeBetweenEvictionRuns: 30000
    maxWait: 1000
"#;

    #[test]
    fn test_parse_sample() {
        let settings = Settings::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(settings.datasource.stores.len(), 2);
        assert_eq!(settings.datasource.initial_size, 2);
        assert_eq!(settings.datasource.max_wait, 2000);
        assert!(settings.datasource.keep_alive);
        assert_eq!(
            settings.datasource.validation_query,
            DEFAULT_VALIDATION_QUERY
        );
        assert_eq!(settings.cache.pool.max_active, 8);
    }

    #[test]
    fn test_pool_config_merges_shared_and_per_store() {
        let settings = Settings::from_yaml_str(SAMPLE).unwrap();
        let config = settings.datasource.pool_config("gateway").unwrap();
        assert_eq!(config.driver, Driver::Postgres);
        assert_eq!(config.max_active, 5);
        assert_eq!(config.max_wait, Duration::from_millis(2000));
        assert_eq!(config.username, "app");
    }

    #[test]
    fn test_unknown_store_rejected() {
        let settings = Settings::from_yaml_str(SAMPLE).unwrap();
        let result = settings.datasource.pool_config("missing");
        assert!(matches!(result, Err(StoreError::Configuration { .. })));
    }

    #[test]
    fn test_driver_scheme_mismatch_rejected() {
        let raw = SAMPLE.replace("driver: mysql", "driver: postgres");
        let result = Settings::from_yaml_str(&raw);
        assert!(matches!(result, Err(StoreError::Configuration { .. })));
    }

    #[test]
    fn test_initial_size_exceeding_max_active_rejected() {
        let raw = SAMPLE.replace("initialSize: 2", "initialSize: 9");
        let result = Settings::from_yaml_str(&raw);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_stores_rejected() {
        let raw = r#"
datasource:
  initialSize: 1
  maxActive: 2
  minIdle: 1
  maxWait: 1000
  stores: {}
cache:
  host: localhost
  port: 6379
  pool: { maxActive: 4, maxIdle: 4, minIdle: 0, maxWait: 1000 }
"#;
        assert!(Settings::from_yaml_str(raw).is_err());
    }

    #[test]
    fn test_cache_connection_url() {
        let settings = Settings::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(
            settings.cache.connection_url(),
            "redis://:hunter2@localhost:6379/3"
        );
    }

    #[test]
    fn test_cache_connection_url_without_auth() {
        let mut settings = Settings::from_yaml_str(SAMPLE).unwrap();
        settings.cache.password = None;
        assert_eq!(
            settings.cache.connection_url(),
            "redis://localhost:6379/3"
        );
    }

    #[test]
    fn test_driver_from_str() {
        assert_eq!(Driver::from_str("postgresql").unwrap(), Driver::Postgres);
        assert_eq!(Driver::from_str("MySQL").unwrap(), Driver::MySql);
        assert!(Driver::from_str("oracle").is_err());
    }
}
