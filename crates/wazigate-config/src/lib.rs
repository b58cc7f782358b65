//! Gateway configuration.
//!
//! Layers, lowest first: compiled defaults, an optional TOML file, then
//! the `WAZIUP_*` environment plus the `WAZIGATE_EDGE_DELAY` and
//! `WAZIGATE_ID` variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "WAZIGATE_CONFIG";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ── Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// MQTT over TCP. An empty address disables the listener.
    #[serde(default = "default_mqtt_addr")]
    pub mqtt_addr: String,

    /// MQTT over TLS, needs `tls_crt` and `tls_key`.
    #[serde(default = "default_mqtts_addr")]
    pub mqtts_addr: String,

    /// MQTT over WebSocket.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// MQTT over secure WebSocket, needs `tls_crt` and `tls_key`.
    #[serde(default = "default_https_addr")]
    pub https_addr: String,

    pub tls_crt: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,

    #[serde(default = "default_clouds_file")]
    pub clouds_file: PathBuf,

    /// Spill files of the outbound cloud queues.
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,

    /// Default push interval, a humantime duration such as `5s`.
    #[serde(default = "default_sync_interval")]
    pub sync_interval: String,

    /// Gateway id; derived from the hardware address when unset.
    pub local_id: Option<String>,

    /// Legacy log words: `error`, `warn`, `verb`, `debug`.
    #[serde(default)]
    pub log: String,

    /// Unacknowledged QoS > 0 messages per client.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// Read deadline of the cloud MQTT sessions; unset disables it.
    pub read_timeout: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_addr: default_mqtt_addr(),
            mqtts_addr: default_mqtts_addr(),
            http_addr: default_http_addr(),
            https_addr: default_https_addr(),
            tls_crt: None,
            tls_key: None,
            clouds_file: default_clouds_file(),
            session_dir: default_session_dir(),
            sync_interval: default_sync_interval(),
            local_id: None,
            log: String::new(),
            max_pending: default_max_pending(),
            read_timeout: None,
        }
    }
}

fn default_mqtt_addr() -> String {
    ":1883".into()
}
fn default_mqtts_addr() -> String {
    ":8883".into()
}
fn default_http_addr() -> String {
    ":80".into()
}
fn default_https_addr() -> String {
    ":443".into()
}
fn default_clouds_file() -> PathBuf {
    "clouds.json".into()
}
fn default_session_dir() -> PathBuf {
    "session".into()
}
fn default_sync_interval() -> String {
    "5s".into()
}
fn default_max_pending() -> usize {
    256
}

impl Config {
    pub fn sync_interval(&self) -> Result<Duration, ConfigError> {
        humantime::parse_duration(self.sync_interval.trim())
            .map_err(|e| ConfigError::invalid("sync_interval", e.to_string()))
    }

    pub fn read_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        match self.read_timeout.as_deref().map(str::trim) {
            None | Some("" | "0") => Ok(None),
            Some(raw) => humantime::parse_duration(raw)
                .map(Some)
                .map_err(|e| ConfigError::invalid("read_timeout", e.to_string())),
        }
    }

    /// Certificate and key paths when both are set.
    pub fn tls(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_crt, &self.tls_key) {
            (Some(crt), Some(key)) => Some((crt.as_path(), key.as_path())),
            _ => None,
        }
    }

    /// Tracing directive for the legacy `log` words. The most verbose
    /// word present wins.
    pub fn log_level(&self) -> Option<&'static str> {
        let mut level = None;
        for (word, directive) in [
            ("error", "error"),
            ("warn", "warn"),
            ("verb", "debug"),
            ("debug", "trace"),
        ] {
            if self.log.contains(word) {
                level = Some(directive);
            }
        }
        level
    }

    /// Check everything that loading cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sync_interval()?;
        self.read_timeout()?;
        if self.max_pending == 0 {
            return Err(ConfigError::invalid("max_pending", "must be at least 1"));
        }
        if self.tls_crt.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::invalid(
                "tls_crt",
                "tls_crt and tls_key must be set together",
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Socket address for a listener; `:port` binds every interface and an
/// empty address disables the listener.
pub fn bind_addr(addr: &str) -> Option<String> {
    let addr = addr.trim();
    if addr.is_empty() {
        None
    } else if addr.starts_with(':') {
        Some(format!("0.0.0.0{addr}"))
    } else {
        Some(addr.to_owned())
    }
}

// ── Config file path ────────────────────────────────────────────────

/// `explicit`, else `$WAZIGATE_CONFIG`, else the platform config dir.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_owned();
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    ProjectDirs::from("org", "waziup", "wazigate").map_or_else(
        || PathBuf::from("wazigate.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Provider stack for the file at `path`; a missing file is skipped.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("WAZIUP_"))
        .merge(
            Env::raw()
                .only(&["WAZIGATE_EDGE_DELAY"])
                .map(|_| "sync_interval".into()),
        )
        .merge(Env::raw().only(&["WAZIGATE_ID"]).map(|_| "local_id".into()))
}

/// Load and validate the configuration.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let path = config_path(explicit);
    let config: Config = figment(&path).extract()?;
    config.validate()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Write `cfg` as TOML to `path`.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, cfg.to_toml()?)?;
    Ok(())
}
