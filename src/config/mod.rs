//! Service configuration
//!
//! Settings stored in TOML format. Every section falls back to its
//! defaults, so a partial file (or no file at all) always yields a
//! runnable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Broker settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BrokerConfig {
    /// Engine selection and request handling
    pub service: ServiceConfig,
    /// Idle shutdown behavior
    pub watchdog: WatchdogConfig,
    /// Model storage
    pub models: ModelsConfig,
    /// Listener settings
    pub server: ServerConfig,
}

/// Engine selection and request handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Engine id used when a request names none
    pub default_engine: String,
    /// Language hint passed to engines when a request names none
    pub default_language: String,
    /// How many staged sessions to keep before evicting the oldest
    pub session_capacity: usize,
    /// How long a call into a confined engine may wait before timing out
    pub confined_wait_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_engine: "neural".to_string(),
            default_language: "en-US".to_string(),
            session_capacity: 20,
            confined_wait_secs: 10,
        }
    }
}

/// Idle shutdown behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Seconds without requests before the service exits
    pub idle_timeout_secs: u64,
    /// How often the idle check runs
    pub poll_interval_secs: u64,
    /// Disable to keep the process alive indefinitely; keep-alive with
    /// `keep_alive = false` still shuts it down
    pub start_enabled: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            poll_interval_secs: 5,
            start_enabled: true,
        }
    }
}

/// Model storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Overrides the model directory; empty means the per-user default
    pub dir: Option<PathBuf>,
    /// Refuse network fetches for missing models
    pub offline: bool,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            offline: false,
        }
    }
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Port 0 picks an ephemeral port, announced on stdout at startup
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }
}

impl BrokerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog.idle_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog.poll_interval_secs.max(1))
    }

    pub fn confined_wait(&self) -> Duration {
        Duration::from_secs(self.service.confined_wait_secs.max(1))
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<BrokerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let config: BrokerConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &BrokerConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)
        .with_context(|| format!("failed to write config at {}", path.display()))?;
    Ok(())
}

/// Load the file at `path`, or write the defaults there and return them
/// when it does not exist yet.
pub fn load_or_create(path: &Path) -> Result<BrokerConfig> {
    if path.exists() {
        return load_config(path);
    }
    let config = BrokerConfig::default();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    save_config(&config, path)?;
    info!(path = %path.display(), "wrote default configuration");
    Ok(config)
}

/// Per-user config file location.
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "ocrrelay", "OcrRelay")
        .context("could not determine a config directory")?;
    Ok(dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn defaults_are_runnable() {
        let config = BrokerConfig::default();

        assert_eq!(config.service.default_engine, "neural");
        assert_eq!(config.service.session_capacity, 20);
        assert_eq!(config.service.confined_wait_secs, 10);

        assert_eq!(config.watchdog.idle_timeout_secs, 60);
        assert_eq!(config.watchdog.poll_interval_secs, 5);
        assert!(config.watchdog.start_enabled);

        assert!(config.models.dir.is_none());
        assert!(!config.models.offline);

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 0);
    }

    #[test]
    fn config_serialization_roundtrip() {
        let config = BrokerConfig::default();

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: BrokerConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.service.default_engine, parsed.service.default_engine);
        assert_eq!(config.watchdog.idle_timeout_secs, parsed.watchdog.idle_timeout_secs);
        assert_eq!(config.server.port, parsed.server.port);
    }

    #[test]
    fn partial_files_fill_with_defaults() {
        let parsed: BrokerConfig = toml::from_str(
            r#"
            [watchdog]
            idle_timeout_secs = 300

            [server]
            port = 8765
            "#,
        )
        .unwrap();

        assert_eq!(parsed.watchdog.idle_timeout_secs, 300);
        assert_eq!(parsed.watchdog.poll_interval_secs, 5);
        assert_eq!(parsed.server.port, 8765);
        assert_eq!(parsed.service.default_engine, "neural");
    }

    #[test]
    fn save_and_load_config() {
        let mut config = BrokerConfig::default();
        config.service.default_engine = "native".to_string();
        config.models.offline = true;

        let temp_file = NamedTempFile::new().unwrap();
        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(loaded.service.default_engine, "native");
        assert!(loaded.models.offline);
    }

    #[test]
    fn load_or_create_writes_the_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let created = load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.service.session_capacity, 20);

        // A second call reads the file back rather than rewriting it.
        let loaded = load_or_create(&path).unwrap();
        assert_eq!(loaded.watchdog.idle_timeout_secs, 60);
    }

    #[test]
    fn load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }

    #[test]
    fn poll_interval_never_hits_zero() {
        let mut config = BrokerConfig::default();
        config.watchdog.poll_interval_secs = 0;
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }
}
