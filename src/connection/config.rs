use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Environment variable holding the comma separated DSN list read by
/// [`ClusterConfig::from_env`].
pub const DSNS_ENV: &str = "PGCLUSTER_DSNS";

/// Pool configuration applied to every physical connection of a cluster
///
/// Pool sizing and connection recycling are handled by the driver; these
/// values are passed through unchanged.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in pool
    pub max_connections: u32,

    /// Minimum number of connections kept open
    pub min_connections: u32,

    /// How long `acquire` waits for a free connection
    pub acquire_timeout: Duration,

    /// Connection idle timeout
    pub idle_timeout: Option<Duration>,

    /// Maximum connection lifetime
    pub max_lifetime: Option<Duration>,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
        }
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set minimum connections
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Set acquire timeout
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set maximum lifetime
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }

        if self.min_connections > self.max_connections {
            return Err("min_connections cannot exceed max_connections".to_string());
        }

        if self.acquire_timeout.is_zero() {
            return Err("acquire_timeout must be > 0".to_string());
        }

        Ok(())
    }

    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout)
            .max_lifetime(self.max_lifetime)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered list of endpoints: the first is the primary, the rest replicas.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    pub dsns: Vec<String>,
}

impl ClusterConfig {
    pub fn new<I, S>(dsns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dsns: dsns.into_iter().map(Into::into).collect(),
        }
    }

    /// Reads [`DSNS_ENV`] from the process environment.
    pub fn from_env() -> Result<Self, String> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Reads [`DSNS_ENV`] through `lookup`.
    ///
    /// Entries are separated by commas; blank entries are skipped.
    pub fn from_vars<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup(DSNS_ENV).ok_or_else(|| format!("{} is not set", DSNS_ENV))?;
        let dsns: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if dsns.is_empty() {
            return Err(format!("{} contains no connection strings", DSNS_ENV));
        }
        Ok(Self { dsns })
    }

    pub fn primary(&self) -> Option<&str> {
        self.dsns.first().map(String::as_str)
    }

    pub fn replicas(&self) -> &[String] {
        self.dsns.get(1..).unwrap_or_default()
    }
}
