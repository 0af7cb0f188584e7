use crate::error::{AppError, AppResult};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Inbound proxy configuration. An empty/absent `api_key` disables caller
/// authentication entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub api_key: Option<String>,
    pub enable_logging: bool,
    pub max_logs: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            enable_logging: true,
            max_logs: 1000,
        }
    }
}

impl ProxyConfig {
    /// Effective key after trimming; `None` means auth is off.
    pub fn effective_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

pub fn manager_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".codex-manager")
}

fn config_path() -> PathBuf {
    manager_dir().join("proxy_config.json")
}

pub fn log_db_path() -> PathBuf {
    manager_dir().join("proxy_logs.db")
}

pub fn load_proxy_config() -> ProxyConfig {
    let path = config_path();
    if let Ok(content) = fs::read_to_string(&path) {
        match serde_json::from_str::<ProxyConfig>(&content) {
            Ok(cfg) => return cfg,
            Err(e) => tracing::warn!("[Config] ignoring malformed {}: {}", path.display(), e),
        }
    }
    ProxyConfig::default()
}

pub fn save_proxy_config(cfg: &ProxyConfig) -> AppResult<()> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_string_pretty(cfg)
        .map_err(|e| AppError::store(format!("serialize proxy config: {e}")))?;
    fs::write(path, payload)?;
    Ok(())
}

/// Generate a local inbound API key: `sk-` followed by 32 hex characters.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("sk-{hex}")
}
