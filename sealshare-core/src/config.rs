//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::store::DEFAULT_PIECE_LENGTH;
use crate::transport::TransportTuning;

/// What to do with large payloads in private mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrivateModePolicy {
    /// Keep pieces in memory whatever the size.
    #[default]
    FallbackToMemory,
    /// Refuse payloads larger than `private_mode_max_bytes`.
    RejectLarge,
}

/// Transfer configuration. File: ~/.config/sealshare/config.toml or /etc/sealshare/config.toml.
/// Env overrides: SEALSHARE_ORIGIN, SEALSHARE_STORE_DIR, SEALSHARE_STREAM_RELAY,
/// SEALSHARE_PIECE_LENGTH.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Origin that scopes key derivation (default "sealshare://local").
    #[serde(default = "default_origin")]
    pub origin: String,
    /// Parent directory of disk piece stores and of the private-mode check.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    /// Optional relay endpoint handed to the disk saver.
    #[serde(default)]
    pub stream_relay: Option<String>,
    /// Tracker / signalling endpoints passed to the transport.
    #[serde(default)]
    pub announce: Vec<String>,
    /// Transport piece length in bytes (default 256 KiB).
    #[serde(default = "default_piece_length")]
    pub piece_length: u64,
    #[serde(default)]
    pub private_mode: PrivateModePolicy,
    /// Payload ceiling under `reject-large` (default 64 MiB).
    #[serde(default = "default_private_mode_max_bytes")]
    pub private_mode_max_bytes: u64,
}

fn default_origin() -> String {
    "sealshare://local".to_string()
}
fn default_store_dir() -> PathBuf {
    std::env::temp_dir().join("sealshare")
}
fn default_piece_length() -> u64 {
    DEFAULT_PIECE_LENGTH
}
fn default_private_mode_max_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            store_dir: default_store_dir(),
            stream_relay: None,
            announce: Vec::new(),
            piece_length: default_piece_length(),
            private_mode: PrivateModePolicy::default(),
            private_mode_max_bytes: default_private_mode_max_bytes(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    /// Transport tuning passed through to every seed and add.
    pub fn tuning(&self) -> TransportTuning {
        TransportTuning {
            announce: self.announce.clone(),
            piece_length: self.piece_length,
        }
    }

    /// Apply overrides from `var`; unparsable values are ignored.
    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = var("SEALSHARE_ORIGIN") {
            self.origin = s;
        }
        if let Some(s) = var("SEALSHARE_STORE_DIR") {
            self.store_dir = PathBuf::from(s);
        }
        if let Some(s) = var("SEALSHARE_STREAM_RELAY") {
            self.stream_relay = if s.is_empty() { None } else { Some(s) };
        }
        if let Some(s) = var("SEALSHARE_PIECE_LENGTH") {
            match s.parse::<u64>() {
                Ok(n) if n > 0 => self.piece_length = n,
                _ => tracing::warn!(value = %s, "ignoring invalid SEALSHARE_PIECE_LENGTH"),
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/sealshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/sealshare/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match Config::load_from(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring config file");
            None
        }
    }
}
