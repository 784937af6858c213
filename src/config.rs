//! Pool and connection configuration structures.

use std::{collections::BTreeMap, fmt, marker::PhantomData, time::Duration};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Configuration error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolConfigError {
    /// Configuration builder error.
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    /// Pool must keep at least one connection open.
    #[error("minimum number of connections must be positive")]
    ZeroMinConnections,
    /// Lower pool bound exceeds upper bound.
    #[error("minimum number of connections ({min}) exceeds maximum ({max})")]
    MinAboveMax {
        /// Requested minimum.
        min: usize,
        /// Requested maximum.
        max: usize,
    },
    /// Idle reaper would spin.
    #[error("idle reaper interval must be positive")]
    ZeroReapInterval,
}

/// Parameters used to open a single database session.
#[derive(Clone, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ConnectionConfig {
    /// Database server host name or IP address.
    #[serde(default = "ConnectionConfig::default_host")]
    pub host: String,
    /// Database server TCP port.
    #[serde(default = "ConnectionConfig::default_port")]
    pub port: u16,
    /// User name to authenticate as.
    #[serde(default = "ConnectionConfig::default_user")]
    pub user: String,
    /// Password to authenticate with.
    #[serde(default)]
    pub password: String,
    /// Default database (schema) for the session.
    #[serde(default)]
    pub database: String,
    /// Timeout for establishing TCP connection.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub connect_timeout: Option<Duration>,
    /// Driver-specific options, passed to the driver as-is.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            user: Self::default_user(),
            password: String::new(),
            database: String::new(),
            connect_timeout: None,
            options: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("connect_timeout", &self.connect_timeout)
            .field("options", &self.options)
            .finish()
    }
}

impl ConnectionConfig {
    /// Default value for [`Self::host`].
    #[must_use]
    #[inline]
    fn default_host() -> String {
        "localhost".into()
    }

    /// Default value for [`Self::port`].
    #[must_use]
    #[inline]
    fn default_port() -> u16 {
        3306
    }

    /// Default value for [`Self::user`].
    #[must_use]
    #[inline]
    fn default_user() -> String {
        "root".into()
    }

    /// Set credentials used to authenticate.
    pub fn with_credentials(
        &mut self,
        user: impl ToString,
        password: impl ToString,
    ) -> &mut Self {
        self.user = user.to_string();
        self.password = password.to_string();
        self
    }

    /// Set default database for new sessions.
    pub fn with_database(&mut self, database: impl ToString) -> &mut Self {
        self.database = database.to_string();
        self
    }

    /// Add driver-specific option.
    pub fn with_option(&mut self, key: impl ToString, value: impl ToString) -> &mut Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }
}

/// Connection pool configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Pool label, used in logs and metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Parameters for opening new connections.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Number of connections opened when the pool is created.
    ///
    /// The idle reaper never shrinks the pool below this value.
    #[serde(default = "PoolConfig::default_min_connections")]
    pub min_connections: usize,
    /// Maximum number of live connections, both idle and checked out.
    #[serde(default = "PoolConfig::default_max_connections")]
    pub max_connections: usize,
    /// Maximum total time to wait for a connection when the pool is exhausted.
    #[serde(
        default = "PoolConfig::default_acquire_timeout",
        with = "humantime_serde"
    )]
    pub acquire_timeout: Duration,
    /// Close connections that stayed idle for longer than this.
    ///
    /// Idle connections are never reaped if unset.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub max_idle_timeout: Option<Duration>,
    /// Interval between idle reaper runs.
    #[serde(
        default = "PoolConfig::default_reap_interval",
        with = "humantime_serde"
    )]
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: None,
            connection: ConnectionConfig::default(),
            min_connections: Self::default_min_connections(),
            max_connections: Self::default_max_connections(),
            acquire_timeout: Self::default_acquire_timeout(),
            max_idle_timeout: None,
            reap_interval: Self::default_reap_interval(),
        }
    }
}

impl PoolConfig {
    /// Create builder for pool configuration.
    pub fn builder() -> ConfigBuilder<Self> {
        ConfigBuilder::new()
    }

    /// Default value for [`Self::min_connections`].
    #[must_use]
    #[inline]
    fn default_min_connections() -> usize {
        3
    }

    /// Default value for [`Self::max_connections`].
    #[must_use]
    #[inline]
    fn default_max_connections() -> usize {
        10
    }

    /// Default value for [`Self::acquire_timeout`].
    #[must_use]
    #[inline]
    fn default_acquire_timeout() -> Duration {
        Duration::from_secs(10)
    }

    /// Default value for [`Self::reap_interval`].
    #[must_use]
    #[inline]
    fn default_reap_interval() -> Duration {
        Duration::from_secs(10)
    }

    /// Set pool size bounds.
    pub fn with_bounds(&mut self, min: usize, max: usize) -> &mut Self {
        self.min_connections = min;
        self.max_connections = max;
        self
    }

    /// Set maximum time to wait for a connection.
    pub fn with_acquire_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Enable idle reaper.
    pub fn with_idle_timeout(&mut self, timeout: Duration, interval: Duration) -> &mut Self {
        self.max_idle_timeout = Some(timeout);
        self.reap_interval = interval;
        self
    }

    /// Pool label, or `"default"` if unset.
    #[must_use]
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("default")
    }

    /// Check configured values for consistency.
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// * Minimum number of connections is zero.
    /// * Minimum number of connections is larger than maximum.
    /// * Idle reaper is enabled with zero interval.
    pub fn validate(&self) -> Result<(), PoolConfigError> {
        check_bounds(self.min_connections, self.max_connections)?;
        if self.max_idle_timeout.is_some() && self.reap_interval.is_zero() {
            return Err(PoolConfigError::ZeroReapInterval);
        }
        Ok(())
    }
}

/// Validate pool size bounds.
pub(crate) fn check_bounds(min: usize, max: usize) -> Result<(), PoolConfigError> {
    if min == 0 {
        return Err(PoolConfigError::ZeroMinConnections);
    }
    if min > max {
        return Err(PoolConfigError::MinAboveMax { min, max });
    }
    Ok(())
}

/// Layered configuration loader.
///
/// Sources added later override values from sources added earlier.
#[must_use]
pub struct ConfigBuilder<C> {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
    _type: PhantomData<C>,
}

impl<C> ConfigBuilder<C> {
    /// Alternative method to construct a configuration builder.
    pub fn new() -> Self {
        Self {
            builder: config::Config::builder(),
            _type: PhantomData,
        }
    }

    /// Add a custom object implementing [`Source`] trait as a source of configuration.
    ///
    /// [`Source`]: config::Source
    pub fn with_source<T>(mut self, source: T) -> Self
    where
        T: config::Source + Send + Sync + 'static,
    {
        self.builder = self.builder.add_source(source);
        self
    }

    /// Add file as a source of configuration.
    ///
    /// File format is detected using file extension.
    pub fn with_file(self, name: impl AsRef<str>) -> Self {
        self.with_source(config::File::with_name(name.as_ref()))
    }

    /// Add environment variables as a source of configuration.
    ///
    /// Variables are expected as `PREFIX_KEY`, nested keys are separated by `__`,
    /// e.g. `DBPOOL_CONNECTION__HOST`.
    pub fn with_env(self, prefix: impl AsRef<str>) -> Self {
        self.with_source(
            config::Environment::with_prefix(prefix.as_ref())
                .prefix_separator("_")
                .separator("__"),
        )
    }
}

impl<C> Default for ConfigBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: DeserializeOwned> ConfigBuilder<C> {
    /// Try to build configuration object from preconfigured sources.
    ///
    /// This method will do all the I/O necessary to load the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if some configuration loading was unsuccessful.
    pub fn build(self) -> Result<C, PoolConfigError> {
        self.builder.build()?.try_deserialize().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use config::{File, FileFormat};
    use serde_json::{from_value, json};

    use super::*;

    #[test]
    fn defaults_from_empty_object() {
        let cfg: PoolConfig = from_value(json!({})).unwrap();
        assert_eq!(cfg, PoolConfig::default());
        assert_eq!(cfg.min_connections, 3);
        assert_eq!(cfg.max_connections, 10);
        assert_eq!(cfg.acquire_timeout, Duration::from_secs(10));
        assert_eq!(cfg.max_idle_timeout, None);
        assert_eq!(cfg.connection.host, "localhost");
        assert_eq!(cfg.connection.port, 3306);
        assert_eq!(cfg.label(), "default");
        cfg.validate().unwrap();
    }

    #[test]
    fn humantime_durations() {
        let cfg: PoolConfig = from_value(json!({
            "acquire_timeout": "250ms",
            "max_idle_timeout": "1m",
            "reap_interval": "5s",
        }))
        .unwrap();
        assert_eq!(cfg.acquire_timeout, Duration::from_millis(250));
        assert_eq!(cfg.max_idle_timeout, Some(Duration::from_secs(60)));
        assert_eq!(cfg.reap_interval, Duration::from_secs(5));
    }

    #[test]
    fn bounds_validation() {
        let mut cfg = PoolConfig::default();
        cfg.with_bounds(0, 5);
        assert!(matches!(
            cfg.validate(),
            Err(PoolConfigError::ZeroMinConnections)
        ));
        cfg.with_bounds(6, 5);
        assert!(matches!(
            cfg.validate(),
            Err(PoolConfigError::MinAboveMax { min: 6, max: 5 })
        ));
        cfg.with_bounds(5, 5);
        cfg.validate().unwrap();
        cfg.with_idle_timeout(Duration::from_secs(1), Duration::ZERO);
        assert!(matches!(
            cfg.validate(),
            Err(PoolConfigError::ZeroReapInterval)
        ));
    }

    #[test]
    fn password_is_redacted() {
        let mut conn = ConnectionConfig::default();
        conn.with_credentials("app", "hunter2");
        let dbg = format!("{conn:?}");
        assert!(dbg.contains("app"));
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn builder_layers_sources() {
        const BASE: &str = r#"
name: orders
min_connections: 2
max_connections: 4
acquire_timeout: 3s
connection:
  host: db.internal
  user: orders
  password: secret
  database: shop
  options:
    charset: utf8mb4
"#;
        const OVERRIDE: &str = "max_connections: 8\n";
        let cfg = PoolConfig::builder()
            .with_source(File::from_str(BASE, FileFormat::Yaml))
            .with_source(File::from_str(OVERRIDE, FileFormat::Yaml))
            .build()
            .unwrap();
        assert_eq!(cfg.label(), "orders");
        assert_eq!(cfg.min_connections, 2);
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.acquire_timeout, Duration::from_secs(3));
        assert_eq!(cfg.connection.host, "db.internal");
        assert_eq!(cfg.connection.port, 3306);
        assert_eq!(cfg.connection.database, "shop");
        assert_eq!(
            cfg.connection.options.get("charset").map(String::as_str),
            Some("utf8mb4")
        );
    }

    #[test]
    fn builder_reports_bad_values() {
        let res = PoolConfig::builder()
            .with_source(File::from_str("max_connections: lots\n", FileFormat::Yaml))
            .build();
        assert!(matches!(res, Err(PoolConfigError::Load(_))));
    }
}
