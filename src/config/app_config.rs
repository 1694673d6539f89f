use crate::cryptography::primitives::KdfParams;
use crate::sync::worker::WorkerConfig;
use crate::vault::store::{PersistMode, StoreOptions};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot parse {path}: {message}")]
    Malformed { path: PathBuf, message: String },
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

/// `config.toml` as written by the user. Every key is optional.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct FileConfig {
    pub vault_path: Option<String>,
    pub clipboard_ttl: Option<u64>,
    pub username_is_secret: Option<bool>,
    pub backups: Option<usize>,
    pub save_batch: Option<usize>,
    pub max_entries: Option<usize>,
    pub remote_path: Option<String>,
    pub sync_interval_secs: Option<u64>,
    pub sync_retries: Option<u32>,
    pub sync_backoff_ms: Option<u64>,
    pub network_timeout_secs: Option<u64>,
    pub kdf_m_cost_kib: Option<u32>,
    pub kdf_t_cost: Option<u32>,
    pub kdf_lanes: Option<u32>,
}

/// Fully resolved settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub vault_path: PathBuf,
    pub clipboard_ttl: u64,
    pub username_is_secret: bool,
    pub backups: usize,
    /// 0 or 1 saves on every mutation.
    pub save_batch: usize,
    pub max_entries: Option<usize>,
    /// Sync is disabled when unset.
    pub remote_path: Option<PathBuf>,
    pub sync_interval_secs: u64,
    pub sync_retries: u32,
    pub sync_backoff_ms: u64,
    pub network_timeout_secs: u64,
    pub kdf: KdfParams,
}

impl Config {
    /// Resolve with precedence: `path` override > `BLUEKEY_*` env > config.toml > defaults.
    pub fn create(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let (cfg_path, file_cfg) = load_file_config_with_path()?;
        tracing::debug!(path = %cfg_path.display(), "configuration loaded");
        let defaults = KdfParams::default();

        let vault_path = path
            .or_else(|| env::var("BLUEKEY_VAULT_PATH").ok().map(PathBuf::from))
            .or_else(|| file_cfg.vault_path.as_ref().map(PathBuf::from))
            .unwrap_or_else(default_vault_path);
        let remote_path = env::var("BLUEKEY_REMOTE_PATH")
            .ok()
            .or(file_cfg.remote_path)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let kdf = KdfParams {
            m_cost_kib: env_or("BLUEKEY_KDF_M_COST", file_cfg.kdf_m_cost_kib)
                .unwrap_or(defaults.m_cost_kib),
            t_cost: env_or("BLUEKEY_KDF_T_COST", file_cfg.kdf_t_cost).unwrap_or(defaults.t_cost),
            p_lanes: env_or("BLUEKEY_KDF_LANES", file_cfg.kdf_lanes).unwrap_or(defaults.p_lanes),
        };
        if kdf.t_cost == 0 || kdf.p_lanes == 0 || kdf.m_cost_kib < 8 * kdf.p_lanes {
            return Err(ConfigError::InvalidValue {
                key: "kdf",
                message: format!(
                    "m_cost_kib={} t_cost={} lanes={}",
                    kdf.m_cost_kib, kdf.t_cost, kdf.p_lanes
                ),
            });
        }

        let network_timeout_secs =
            env_or("BLUEKEY_NETWORK_TIMEOUT", file_cfg.network_timeout_secs).unwrap_or(10);
        if network_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "network_timeout_secs",
                message: "must be at least 1".into(),
            });
        }

        Ok(Config {
            vault_path,
            clipboard_ttl: env_or("BLUEKEY_CLIP_TTL", file_cfg.clipboard_ttl).unwrap_or(30),
            username_is_secret: env_or("BLUEKEY_USERNAME_IS_SECRET", file_cfg.username_is_secret)
                .unwrap_or(false),
            backups: env_or("BLUEKEY_BACKUPS", file_cfg.backups).unwrap_or(2),
            save_batch: env_or("BLUEKEY_SAVE_BATCH", file_cfg.save_batch).unwrap_or(0),
            max_entries: env_or("BLUEKEY_MAX_ENTRIES", file_cfg.max_entries),
            remote_path,
            sync_interval_secs: env_or("BLUEKEY_SYNC_INTERVAL", file_cfg.sync_interval_secs)
                .unwrap_or(300),
            sync_retries: env_or("BLUEKEY_SYNC_RETRIES", file_cfg.sync_retries).unwrap_or(3),
            sync_backoff_ms: env_or("BLUEKEY_SYNC_BACKOFF_MS", file_cfg.sync_backoff_ms)
                .unwrap_or(500),
            network_timeout_secs,
            kdf,
        })
    }

    pub fn clipboard_ttl(&self) -> Duration {
        Duration::from_secs(self.clipboard_ttl)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            persist: PersistMode::from_batch(self.save_batch),
            max_entries: self.max_entries,
        }
    }

    /// Background worker settings. An interval of 0 disables periodic sync.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            interval: (self.sync_interval_secs > 0)
                .then(|| Duration::from_secs(self.sync_interval_secs)),
            retries: self.sync_retries,
            backoff: Duration::from_millis(self.sync_backoff_ms),
            sync_on_start: false,
        }
    }
}

/// Environment value when present and parseable, else the file value.
fn env_or<T: FromStr>(key: &str, file_value: Option<T>) -> Option<T> {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
                file_value
            }
        },
        Err(_) => file_value,
    }
}

pub fn config_file_path() -> PathBuf {
    let cfg_dir = match env::var("BLUEKEY_CONFIG_DIR") {
        Ok(p) => PathBuf::from(p),
        Err(_) => dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bluekey"),
    };
    cfg_dir.join("config.toml")
}

/// Read config.toml; a missing file is an empty config.
pub fn load_file_config_with_path() -> Result<(PathBuf, FileConfig), ConfigError> {
    let path = config_file_path();
    let cfg = load_file_config(&path)?;
    Ok((path, cfg))
}

pub fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str::<FileConfig>(&text).map_err(|e| ConfigError::Malformed {
            path: path.to_path_buf(),
            message: e.to_string(),
        }),
        Err(_) => Ok(FileConfig::default()),
    }
}

pub fn save_file_config(path: &Path, cfg: &FileConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let s = toml::to_string_pretty(cfg).map_err(std::io::Error::other)?;
    std::fs::write(path, s)
}

fn default_vault_path() -> PathBuf {
    if let Ok(base) = env::var("BLUEKEY_DATA_DIR") {
        return PathBuf::from(base).join("bluekey").join("vault.blk");
    }
    if let Some(mut p) = dirs::data_dir() {
        p.push("bluekey");
        p.push("vault.blk");
        return p;
    }
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(&home).join(".bluekey").join("vault.blk")
}
