use crate::core::{Properties, ProxyError, Result};
use crate::pagination::{DEFAULT_PACKET_SIZE, PaginationSettings};
use crate::wire::{CompressionMode, CompressionSettings, DEFAULT_COMPRESSION_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Connection pooling settings of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub enabled: bool,

    /// Maximum number of connections in pool
    pub max_connections: usize,

    /// Minimum number of connections kept open
    pub min_connections: usize,

    /// How long `acquire` waits for a free connection
    pub acquire_timeout_ms: u64,

    /// Idle connections older than this are discarded
    pub idle_timeout_ms: Option<u64>,

    /// Connections older than this are discarded
    pub max_lifetime_ms: Option<u64>,
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(ProxyError::Config("max_connections must be > 0".into()));
        }
        if self.min_connections > self.max_connections {
            return Err(ProxyError::Config(
                "min_connections cannot exceed max_connections".into(),
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_ms: 30_000,
            idle_timeout_ms: Some(600_000),   // 10 minutes
            max_lifetime_ms: Some(1_800_000), // 30 minutes
        }
    }
}

/// Settings of one named remote resource, consulted when a session is
/// created for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub name: String,

    /// Driver locator, e.g. `memory:sales`
    pub locator: String,

    /// Properties merged under the ones sent by the client
    pub properties: Properties,

    /// Rows per result packet
    pub row_packet_size: usize,

    pub compression: CompressionMode,

    /// Serialized payloads at least this large are compressed
    pub compression_threshold: usize,

    pub charset: String,

    pub pool: PoolConfig,

    /// Ask clients to attach a debug context to every request
    pub debug_contexts: bool,

    /// Keep per-command counters for each session
    pub command_stats: bool,

    /// Upper bound on waiting for a prefetched packet
    pub packet_wait_timeout_ms: u64,

    /// Regular expressions; when non-empty, SQL must match one of them
    pub allow: Vec<String>,

    /// Regular expressions; SQL matching any of them is rejected
    pub deny: Vec<String>,
}

impl ResourceConfig {
    pub fn new(name: &str, locator: &str) -> Self {
        Self {
            name: name.to_string(),
            locator: locator.to_string(),
            ..Self::default()
        }
    }

    /// Set the number of rows per packet
    pub fn row_packet_size(mut self, rows: usize) -> Self {
        self.row_packet_size = rows;
        self
    }

    /// Set compression mode and threshold
    pub fn compression(mut self, mode: CompressionMode, threshold: usize) -> Self {
        self.compression = mode;
        self.compression_threshold = threshold;
        self
    }

    pub fn charset(mut self, charset: &str) -> Self {
        self.charset = charset.to_string();
        self
    }

    /// Enable pooling with the given bounds
    pub fn pooled(mut self, min_connections: usize, max_connections: usize) -> Self {
        self.pool.enabled = true;
        self.pool.min_connections = min_connections;
        self.pool.max_connections = max_connections;
        self
    }

    pub fn debug_contexts(mut self, enabled: bool) -> Self {
        self.debug_contexts = enabled;
        self
    }

    pub fn command_stats(mut self, enabled: bool) -> Self {
        self.command_stats = enabled;
        self
    }

    pub fn packet_wait_timeout(mut self, timeout: Duration) -> Self {
        self.packet_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn allow(mut self, pattern: &str) -> Self {
        self.allow.push(pattern.to_string());
        self
    }

    pub fn deny(mut self, pattern: &str) -> Self {
        self.deny.push(pattern.to_string());
        self
    }

    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn pagination(&self) -> PaginationSettings {
        PaginationSettings {
            packet_size: self.row_packet_size,
            wait_timeout: Duration::from_millis(self.packet_wait_timeout_ms),
        }
    }

    pub fn compression_settings(&self) -> CompressionSettings {
        CompressionSettings::new(self.compression, self.compression_threshold)
    }

    pub fn validate(&self) -> Result<()> {
        if self.row_packet_size == 0 {
            return Err(ProxyError::Config(format!(
                "resource '{}': row_packet_size must be > 0",
                self.name
            )));
        }
        if self.packet_wait_timeout_ms == 0 {
            return Err(ProxyError::Config(format!(
                "resource '{}': packet_wait_timeout_ms must be > 0",
                self.name
            )));
        }
        self.pool
            .validate()
            .map_err(|e| ProxyError::Config(format!("resource '{}': {}", self.name, e)))
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            locator: String::new(),
            properties: Properties::new(),
            row_packet_size: DEFAULT_PACKET_SIZE,
            compression: CompressionMode::default(),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            charset: "UTF-8".to_string(),
            pool: PoolConfig::default(),
            debug_contexts: false,
            command_stats: false,
            packet_wait_timeout_ms: 30_000,
            allow: Vec::new(),
            deny: Vec::new(),
        }
    }
}

/// Process-wide server settings.
///
/// ```ignore
/// let config = ServerConfig::from_json_file("proxy.json")?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP bind address
    pub bind: String,

    pub resources: Vec<ResourceConfig>,

    /// Settings for locators that match no named resource
    pub defaults: ResourceConfig,

    /// Period of the idle sweep; `<= 0` disables it
    pub reclaim_period_ms: i64,

    /// Sessions idle for longer than this are reclaimed
    pub idle_timeout_ms: u64,

    /// Period of client keep-alive pings; 0 disables them
    pub keep_alive_interval_ms: u64,

    /// Maximum number of concurrently running prefetch tasks
    pub max_prefetch_tasks: usize,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, addr: &str) -> Self {
        self.bind = addr.to_string();
        self
    }

    pub fn resource(mut self, resource: ResourceConfig) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn defaults(mut self, defaults: ResourceConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn reclaim_period_ms(mut self, period_ms: i64) -> Self {
        self.reclaim_period_ms = period_ms;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn keep_alive_interval(mut self, interval_ms: u64) -> Self {
        self.keep_alive_interval_ms = interval_ms;
        self
    }

    pub fn max_prefetch_tasks(mut self, tasks: usize) -> Self {
        self.max_prefetch_tasks = tasks;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ProxyError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Reclamation period, or `None` when the sweep is disabled.
    pub fn reclaim_period(&self) -> Option<Duration> {
        (self.reclaim_period_ms > 0).then(|| Duration::from_millis(self.reclaim_period_ms as u64))
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Resolves the settings for a connect request: a resource with that
    /// name, then one with that locator, then the defaults bound to the
    /// requested locator.
    pub fn lookup(&self, resource: &str) -> ResourceConfig {
        if let Some(found) = self.resources.iter().find(|r| r.name == resource) {
            return found.clone();
        }
        if let Some(found) = self.resources.iter().find(|r| r.locator == resource) {
            return found.clone();
        }
        ResourceConfig {
            name: resource.to_string(),
            locator: resource.to_string(),
            ..self.defaults.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_prefetch_tasks == 0 {
            return Err(ProxyError::Config("max_prefetch_tasks must be > 0".into()));
        }
        if self.reclaim_period_ms > 0 && self.idle_timeout_ms == 0 {
            return Err(ProxyError::Config(
                "idle_timeout_ms must be > 0 when reclamation is enabled".into(),
            ));
        }
        if self.reclaim_period_ms > 0
            && self.keep_alive_interval_ms > 0
            && self.keep_alive_interval_ms >= self.idle_timeout_ms
        {
            return Err(ProxyError::Config(
                "keep_alive_interval_ms must be shorter than idle_timeout_ms".into(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for resource in &self.resources {
            if resource.name.is_empty() {
                return Err(ProxyError::Config("resource name cannot be empty".into()));
            }
            if !names.insert(resource.name.as_str()) {
                return Err(ProxyError::Config(format!(
                    "duplicate resource '{}'",
                    resource.name
                )));
            }
            resource.validate()?;
        }
        self.defaults.validate()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7878".to_string(),
            resources: Vec::new(),
            defaults: ResourceConfig::default(),
            reclaim_period_ms: 60_000,
            idle_timeout_ms: 600_000,
            keep_alive_interval_ms: 60_000,
            max_prefetch_tasks: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reclaim_period(), Some(Duration::from_secs(60)));
        assert_eq!(config.defaults.row_packet_size, DEFAULT_PACKET_SIZE);
    }

    #[test]
    fn test_builder_pattern() {
        let config = ServerConfig::new()
            .bind("0.0.0.0:9000")
            .reclaim_period_ms(0)
            .resource(
                ResourceConfig::new("sales", "memory:sales")
                    .row_packet_size(50)
                    .pooled(1, 4)
                    .deny("(?i)^\\s*drop"),
            );

        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.reclaim_period(), None);
        assert_eq!(config.resources[0].row_packet_size, 50);
        assert!(config.resources[0].pool.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = ServerConfig::from_json_str(
            r#"{
                "reclaim_period_ms": -1,
                "resources": [
                    { "name": "hr", "locator": "memory:hr", "compression": "best_compression" }
                ]
            }"#,
        )
        .unwrap();

        let hr = &config.resources[0];
        assert_eq!(hr.compression, CompressionMode::BestCompression);
        assert_eq!(hr.compression_threshold, DEFAULT_COMPRESSION_THRESHOLD);
        assert_eq!(hr.charset, "UTF-8");
        assert_eq!(config.reclaim_period(), None);
    }

    #[test]
    fn test_lookup_order() {
        let config = ServerConfig::new()
            .resource(ResourceConfig::new("hr", "memory:hr").row_packet_size(10))
            .defaults(ResourceConfig::default().row_packet_size(99));

        assert_eq!(config.lookup("hr").row_packet_size, 10);
        assert_eq!(config.lookup("memory:hr").name, "hr");

        let other = config.lookup("memory:other");
        assert_eq!(other.locator, "memory:other");
        assert_eq!(other.row_packet_size, 99);
    }

    #[test]
    fn test_validate() {
        let zero_packet = ServerConfig::new().resource(ResourceConfig::new("a", "memory:a").row_packet_size(0));
        assert!(zero_packet.validate().is_err());

        let duplicate = ServerConfig::new()
            .resource(ResourceConfig::new("a", "memory:a"))
            .resource(ResourceConfig::new("a", "memory:b"));
        assert!(duplicate.validate().is_err());

        let bad_pool = ServerConfig::new().resource(ResourceConfig::new("a", "memory:a").pooled(5, 2));
        assert!(bad_pool.validate().is_err());

        let slow_keep_alive = ServerConfig::new()
            .idle_timeout(Duration::from_secs(10))
            .keep_alive_interval(20_000);
        assert!(slow_keep_alive.validate().is_err());

        assert!(ServerConfig::from_json_str("{ not json").is_err());
    }
}
