use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Daemon configuration, loaded from `~/.config/depot-assist/assist.toml`.
/// Every section has defaults so a missing file yields a working config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: BindConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub uploader: UploaderConfig,
    #[serde(default)]
    pub sha256: Sha256Config,
    #[serde(default)]
    pub activity: ActivityConfig,
    #[serde(default)]
    pub remote_server: Option<RemoteServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// One editor save should produce one work item.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Worker pool size; 0 means min(cpus, 8).
    #[serde(default)]
    pub parallel: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_secs: u64,
    #[serde(default = "default_content_timeout")]
    pub content_timeout_secs: u64,
    /// Ship content by default, or metadata only.
    #[serde(default = "default_true")]
    pub upload_content: bool,
    /// Emit an upload_progress event every N percent.
    #[serde(default = "default_progress_step")]
    pub progress_step_percent: u64,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            parallel: 0,
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_ms(),
            retry_max_delay_ms: default_retry_max_ms(),
            metadata_timeout_secs: default_metadata_timeout(),
            content_timeout_secs: default_content_timeout(),
            upload_content: true,
            progress_step_percent: default_progress_step(),
        }
    }
}

impl UploaderConfig {
    pub fn pool_size(&self) -> usize {
        if self.parallel > 0 {
            self.parallel
        } else {
            num_cpus::get().min(8)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sha256Config {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Sleep between chunks to bound disk/CPU pressure. 0 disables.
    #[serde(default)]
    pub chunk_delay_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
}

impl Default for Sha256Config {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_delay_ms: 0,
            batch_size: default_batch_size(),
            lease_secs: default_lease_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_max_events")]
    pub max_events: i64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            max_events: default_max_events(),
        }
    }
}

/// Bootstrap registration for the default remote server. The password is
/// held only long enough to write the server row; it is never logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,
    pub url: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: i64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8765
}
fn default_true() -> bool {
    true
}
fn default_debounce_ms() -> u64 {
    2000
}
fn default_retry_attempts() -> u32 {
    8
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_retry_max_ms() -> u64 {
    300_000
}
fn default_metadata_timeout() -> u64 {
    10
}
fn default_content_timeout() -> u64 {
    3600
}
fn default_progress_step() -> u64 {
    5
}
fn default_chunk_size() -> usize {
    1024 * 1024
}
fn default_batch_size() -> i64 {
    16
}
fn default_lease_secs() -> i64 {
    300
}
fn default_max_attempts() -> i64 {
    5
}
fn default_retention_days() -> i64 {
    14
}
fn default_max_events() -> i64 {
    100_000
}
fn default_server_name() -> String {
    "default".to_string()
}
fn default_token_ttl() -> i64 {
    1800
}

fn default_db_path() -> String {
    data_dir().join("assist.db").to_string_lossy().into_owned()
}

/// Persistent state directory, `~/.local/share/depot-assist` by default.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("depot-assist")
}

/// Default config file, `~/.config/depot-assist/assist.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("depot-assist")
        .join("assist.toml")
}

pub fn load(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let mut settings = config::Config::builder();
    if let Some(p) = path {
        settings = settings.add_source(config::File::with_name(p));
    } else {
        let default = default_config_path();
        settings = settings.add_source(config::File::from(default.as_path()).required(false));
    }
    let cfg = settings.build()?;
    Ok(cfg.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 8765);
        assert_eq!(cfg.watcher.debounce_ms, 2000);
        assert_eq!(cfg.sha256.chunk_size, 1024 * 1024);
        assert!(cfg.uploader.pool_size() >= 1);
        assert!(cfg.uploader.pool_size() <= 8);
        assert!(cfg.remote_server.is_none());
    }

    #[test]
    fn toml_overrides_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assist.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 9100

[watcher]
enabled = false
debounce_ms = 500

[remote_server]
url = "https://depot.example.com"
username = "assist"
password = "pw"
"#,
        )
        .unwrap();
        let cfg = load(path.to_str()).unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert!(!cfg.watcher.enabled);
        assert_eq!(cfg.watcher.debounce_ms, 500);
        let remote = cfg.remote_server.unwrap();
        assert_eq!(remote.name, "default");
        assert_eq!(remote.token_ttl_secs, 1800);
    }
}
