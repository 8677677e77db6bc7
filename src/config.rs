use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    30
}

fn default_max_header_size() -> usize {
    16 * 1024 // 16KB
}

fn default_max_response_size() -> usize {
    16 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_max_entries() -> Option<usize> {
    Some(1024)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Entries older than this are treated as absent. None keeps them forever.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Oldest entries are evicted beyond this count. None means unbounded.
    #[serde(default = "default_max_entries")]
    pub max_entries: Option<usize>,
    /// Directory that mirrors the cache on disk.
    #[serde(default)]
    pub disk_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: None,
            max_entries: default_max_entries(),
            disk_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    // Phase deadlines; 0 disables the deadline
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// Larger upstream responses are relayed but never cached.
    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_header_size: default_max_header_size(),
            max_response_size: default_max_response_size(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn as_deadline(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        as_deadline(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        as_deadline(self.read_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.read_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_header_size, 16 * 1024);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_entries, Some(1024));
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_partial_document() {
        let config: Config = serde_json::from_str(
            r#"{
                "listen_addr": "0.0.0.0:3128",
                "read_timeout_secs": 0,
                "cache": { "ttl_secs": 300, "disk_dir": "/var/cache/heimdall" },
                "logging": { "format": "json" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.listen_addr.port(), 3128);
        assert_eq!(config.read_timeout(), None);
        assert_eq!(config.cache.ttl_secs, Some(300));
        assert_eq!(config.cache.max_entries, Some(1024));
        assert_eq!(config.cache.disk_dir, Some(PathBuf::from("/var/cache/heimdall")));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_file_round_trip() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("heimdall.json");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.cache.ttl_secs = Some(60);
        config.to_file(path).unwrap();

        let loaded = Config::from_file(path).unwrap();
        assert_eq!(loaded.cache.ttl_secs, Some(60));
        assert_eq!(loaded.listen_addr, config.listen_addr);
    }
}
