use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyMode {
    /// The host busy-polls its response tail word.
    Polling,
    /// Tail publications use WRITE_WITH_IMM so the host can block on a
    /// completion event.
    Interrupt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub bucket_count_power: u32,
    /// Optional packed-item file loaded at startup.
    pub preload: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            bucket_count_power: crate::params::DEFAULT_CACHE_BUCKET_COUNT_POWER,
            preload: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub default_log_level: String,
    pub listen_ip: String,
    pub listen_port: u16,
    /// RNIC device name, e.g. "mlx5_0".
    pub device: Option<String>,
    pub max_clients: usize,
    pub max_buffs: usize,
    #[serde(default = "default_true")]
    pub batching: bool,
    #[serde(default = "default_notify")]
    pub notify: NotifyMode,
    /// Core the agent loop is pinned to.
    pub agent_core: Option<usize>,
    #[serde(default)]
    pub data_plane_weight: Option<u32>,
    /// Byte capacity advertised by the in-memory file service.
    #[serde(default = "default_fs_capacity")]
    pub fs_capacity: u64,
    #[serde(default)]
    pub cache: CacheConfig,
}

fn default_true() -> bool {
    true
}

fn default_notify() -> NotifyMode {
    NotifyMode::Polling
}

fn default_fs_capacity() -> u64 {
    64 << 30
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            default_log_level = "info"
            listen_ip = "192.168.200.2"
            listen_port = 4242
            max_clients = 8
            max_buffs = 8
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.batching);
        assert_eq!(config.notify, NotifyMode::Polling);
        assert_eq!(config.cache.bucket_count_power, crate::params::DEFAULT_CACHE_BUCKET_COUNT_POWER);
    }

    #[test]
    fn rejects_unknown_fields() {
        let toml = r#"
            default_log_level = "info"
            listen_ip = "0.0.0.0"
            listen_port = 1
            max_clients = 1
            max_buffs = 1
            no_such_field = true
        "#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }
}
