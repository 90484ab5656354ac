//! Configuration system for Drift.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DRIFT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/drift/config.toml
//!   3. ~/.config/drift/config.toml
//!
//! A missing file means defaults. A file that exists but cannot be read or
//! parsed is an error; the daemon refuses to start on it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default time a prompt waits for the user before declining.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest identity that fits in a single DNS label.
pub const MAX_IDENTITY_LEN: usize = 63;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Where accepted files are written.
    pub download_dir: PathBuf,
    /// How long an incoming offer waits for a decision.
    #[serde(with = "duration_str")]
    pub accept_timeout: Duration,
    /// Advertised instance name. None = "<user>’s <hostname>".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// DNS-SD service type browsed and advertised.
    pub service_type: String,
    /// DNS-SD domain.
    pub domain: String,
    /// Interfaces to run mDNS on. Empty = every up, multicast-capable one.
    pub interfaces: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            download_dir: download_dir(),
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            identity: None,
            network: NetworkConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            service_type: "_drift._tcp".to_string(),
            domain: "local".to_string(),
            interfaces: Vec::new(),
        }
    }
}

/// The identity used when none is configured.
pub fn default_identity(user: &str, hostname: &str) -> String {
    let host = hostname.split('.').next().unwrap_or(hostname);
    let mut identity = format!("{user}’s {host}");
    while identity.len() > MAX_IDENTITY_LEN {
        identity.pop();
    }
    identity
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("drift")
}

fn download_dir() -> PathBuf {
    std::env::var("XDG_DOWNLOAD_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join("Downloads"))
        .join("Drift")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DriftConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path`, or return defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DRIFT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists at `path`. Returns the path.
    pub fn write_default_if_missing(path: &Path) -> Result<PathBuf, ConfigError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
            }
            let text = toml::to_string_pretty(&DriftConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(path, text)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        Ok(path.to_path_buf())
    }

    /// Apply DRIFT_* overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DRIFT_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("DRIFT_ACCEPT_TIMEOUT") {
            self.accept_timeout = duration_str::parse(&v).map_err(|reason| ConfigError::Invalid {
                field: "DRIFT_ACCEPT_TIMEOUT",
                reason,
            })?;
        }
        if let Some(v) = lookup("DRIFT_IDENTITY") {
            self.identity = Some(v);
        }
        if let Some(v) = lookup("DRIFT_NETWORK__INTERFACES") {
            self.network.interfaces = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accept_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "accept_timeout",
                reason: "must be greater than zero".into(),
            });
        }
        if let Some(identity) = &self.identity {
            if identity.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "identity",
                    reason: "must not be empty".into(),
                });
            }
            if identity.len() > MAX_IDENTITY_LEN {
                return Err(ConfigError::Invalid {
                    field: "identity",
                    reason: format!("{} bytes exceeds {MAX_IDENTITY_LEN}", identity.len()),
                });
            }
        }
        if self.download_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "download_dir",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

// ── Durations ─────────────────────────────────────────────────────────────────

/// `"30s"`, `"1500ms"`, `"2m"`, `"1h"`, or a bare number of seconds.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);
        let n: u64 = digits
            .parse()
            .map_err(|_| format!("{s:?} is not a duration"))?;
        match unit.trim() {
            "" | "s" => Ok(Duration::from_secs(n)),
            "ms" => Ok(Duration::from_millis(n)),
            "m" => Ok(Duration::from_secs(n.saturating_mul(60))),
            "h" => Ok(Duration::from_secs(n.saturating_mul(3600))),
            other => Err(format!("unknown duration unit {other:?}")),
        }
    }

    pub fn format(d: &Duration) -> String {
        if d.subsec_millis() == 0 {
            format!("{}s", d.as_secs())
        } else {
            format!("{}ms", d.as_millis())
        }
    }

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(de)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}
