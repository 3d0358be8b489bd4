//! Operator configuration – reads/writes `~/.legbridge/config.toml`.

use legbridge_runtime::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Persisted operator configuration stored in `~/.legbridge/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address of the robot.  The simulated backend uses it as the nickname.
    #[serde(default = "default_robot_host")]
    pub robot_host: String,

    #[serde(default)]
    pub robot_username: String,

    /// Robot account password.  Wiped from memory when the config is dropped;
    /// the file itself is written owner-only.
    #[serde(default, skip_serializing_if = "is_unset")]
    pub robot_password: Zeroizing<String>,

    /// Default `tracing` level when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Session timing; see [`SessionConfig`].
    #[serde(default)]
    pub session: SessionConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("robot_host", &self.robot_host)
            .field("robot_username", &self.robot_username)
            .field(
                "robot_password",
                if self.robot_password.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("log_level", &self.log_level)
            .field("session", &self.session)
            .finish()
    }
}

fn is_unset(secret: &Zeroizing<String>) -> bool {
    secret.is_empty()
}
fn default_robot_host() -> String {
    "192.168.80.3".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            robot_host: default_robot_host(),
            robot_username: String::new(),
            robot_password: Zeroizing::default(),
            log_level: default_log_level(),
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Problems an operator should fix before driving a real robot.  An
    /// empty list means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.robot_host.trim().is_empty() {
            problems.push("robot_host is empty".to_string());
        }
        if self.robot_username.trim().is_empty() {
            problems.push("robot_username is not set (LEGBRIDGE_ROBOT_USER)".to_string());
        }
        if self.robot_password.is_empty() {
            problems.push("robot_password is not set (LEGBRIDGE_ROBOT_PASSWORD)".to_string());
        }
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            problems.push(format!(
                "log_level '{}' is not one of {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            ));
        }
        if let Err(e) = self.session.validate() {
            problems.push(e.to_string());
        }
        problems
    }
}

/// Return the path to `~/.legbridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".legbridge").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
/// `LEGBRIDGE_*` overrides are applied on top of the file.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply `LEGBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `LEGBRIDGE_ROBOT_HOST` | `robot_host` |
/// | `LEGBRIDGE_ROBOT_USER` | `robot_username` |
/// | `LEGBRIDGE_ROBOT_PASSWORD` | `robot_password` |
/// | `LEGBRIDGE_LOG_LEVEL` | `log_level` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("LEGBRIDGE_ROBOT_HOST") {
        cfg.robot_host = v;
    }
    if let Ok(v) = std::env::var("LEGBRIDGE_ROBOT_USER") {
        cfg.robot_username = v;
    }
    if let Ok(v) = std::env::var("LEGBRIDGE_ROBOT_PASSWORD") {
        cfg.robot_password = Zeroizing::new(v);
    }
    if let Ok(v) = std::env::var("LEGBRIDGE_LOG_LEVEL")
        && !v.trim().is_empty()
    {
        cfg.log_level = v.trim().to_ascii_lowercase();
    }
}

/// Save the config to disk, creating `~/.legbridge/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = Zeroizing::new(
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?,
    );
    // Owner-only (rw-------): the file may hold the robot password.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw.as_bytes())
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
