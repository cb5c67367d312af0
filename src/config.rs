use crate::error::AppError;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SERVICE_NAME: &str = "claude-usage";
pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com";

/// Snapshots older than this are purged on every write.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

const MIN_POLL_SECONDS: u64 = 5;
const MIN_RETENTION_SECONDS: u64 = 3600;

fn home_dir() -> Result<PathBuf, AppError> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_else(|| AppError::Config("Unable to resolve the home directory.".into()))
}

pub fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("CLAUDE_USAGE_HOME") {
        if !custom.is_empty() {
            return Ok(PathBuf::from(custom));
        }
    }
    Ok(home_dir()?.join(".claude-usage"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub retention_seconds: u64,
    pub code_poll_seconds: u64,
    pub console_poll_seconds: u64,
    pub credentials_path: Option<PathBuf>,
    pub api_base_url: String,
    pub pacemaker_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            retention_seconds: DEFAULT_RETENTION.as_secs(),
            code_poll_seconds: 30,
            console_poll_seconds: 120,
            credentials_path: None,
            api_base_url: DEFAULT_API_BASE.into(),
            pacemaker_dir: None,
        }
    }
}

impl AppConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    pub fn credentials_path(&self) -> Result<PathBuf, AppError> {
        if let Ok(custom) = std::env::var("CLAUDE_USAGE_CREDENTIALS") {
            if !custom.is_empty() {
                return Ok(PathBuf::from(custom));
            }
        }
        match &self.credentials_path {
            Some(path) => Ok(path.clone()),
            None => Ok(home_dir()?.join(".claude").join(".credentials.json")),
        }
    }

    pub fn pacemaker_dir(&self) -> Result<PathBuf, AppError> {
        match &self.pacemaker_dir {
            Some(path) => Ok(path.clone()),
            None => Ok(home_dir()?.join(".claude-pace-maker")),
        }
    }
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config.toml"))
}

pub fn db_path() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("usage_history.db"))
}

pub fn log_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("logs"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(app_home_dir()?)?;
    fs::create_dir_all(log_dir()?)?;
    Ok(())
}

fn normalize_config(config: &mut AppConfig) -> bool {
    let mut changed = false;

    if config.code_poll_seconds < MIN_POLL_SECONDS {
        config.code_poll_seconds = MIN_POLL_SECONDS;
        changed = true;
    }
    if config.console_poll_seconds < MIN_POLL_SECONDS {
        config.console_poll_seconds = MIN_POLL_SECONDS;
        changed = true;
    }
    if config.retention_seconds < MIN_RETENTION_SECONDS {
        config.retention_seconds = MIN_RETENTION_SECONDS;
        changed = true;
    }

    let trimmed = config.api_base_url.trim().trim_end_matches('/').to_string();
    let trimmed = if trimmed.is_empty() {
        DEFAULT_API_BASE.to_string()
    } else {
        trimmed
    };
    if trimmed != config.api_base_url {
        config.api_base_url = trimmed;
        changed = true;
    }

    changed
}

pub fn load_config_from(path: &Path) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let mut parsed: AppConfig = toml::from_str(&raw)?;
    if normalize_config(&mut parsed) {
        tracing::warn!(path = %path.display(), "config values were out of range and have been clamped");
    }
    Ok(parsed)
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from(&config_path()?)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(config_path()?, raw)?;
    Ok(())
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    if !config_path()?.exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_file_yields_defaults() {
        let tmp = TempDir::new().expect("tempdir");
        let cfg = load_config_from(&tmp.path().join("config.toml")).expect("load");
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.retention(), DEFAULT_RETENTION);
    }

    #[test]
    fn partial_config_keeps_defaults_for_missing_fields() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.toml");
        fs::write(&path, "retention_seconds = 86400\n").expect("write config");

        let cfg = load_config_from(&path).expect("load");
        assert_eq!(cfg.retention_seconds, 86_400);
        assert_eq!(cfg.code_poll_seconds, 30);
        assert_eq!(cfg.console_poll_seconds, 120);
        assert_eq!(cfg.api_base_url, DEFAULT_API_BASE);
    }

    #[test]
    fn normalize_config_clamps_out_of_range_values() {
        let mut cfg = AppConfig {
            retention_seconds: 10,
            code_poll_seconds: 0,
            console_poll_seconds: 1,
            api_base_url: " http://localhost:8080/ ".into(),
            ..AppConfig::default()
        };

        assert!(normalize_config(&mut cfg));
        assert_eq!(cfg.retention_seconds, MIN_RETENTION_SECONDS);
        assert_eq!(cfg.code_poll_seconds, MIN_POLL_SECONDS);
        assert_eq!(cfg.console_poll_seconds, MIN_POLL_SECONDS);
        assert_eq!(cfg.api_base_url, "http://localhost:8080");
    }

    #[test]
    fn normalize_config_leaves_defaults_untouched() {
        let mut cfg = AppConfig::default();
        assert!(!normalize_config(&mut cfg));
    }
}
