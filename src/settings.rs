//! # Settings file
//!
//! Persists the engine tunables and the saved endpoint list as a pretty JSON
//! document, by default at `<config dir>/rxfer/settings.json`.
//!
//! A missing file yields defaults; a malformed one is reported, never
//! silently replaced.

use crate::logging::LogConfig;
use rxfer_engine::xfer::{EndpointConfig, EngineConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write settings {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed settings {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialise settings: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("endpoint {0} is listed more than once")]
    DuplicateEndpoint(String),
    #[error("endpoint #{0} has no host")]
    MissingHost(usize),
    #[error("no configuration directory available on this platform")]
    NoConfigDir,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub engine: EngineConfig,
    pub log: LogConfig,
    pub endpoints: Vec<EndpointConfig>,
}

impl Settings {
    /// `<config dir>/rxfer/settings.json`
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        dirs::config_dir()
            .map(|d| d.join("rxfer").join("settings.json"))
            .ok_or(SettingsError::NoConfigDir)
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings =
            serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load_or_default(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            log::info!("No settings at {}; using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        self.validate()?;
        let json = serde_json::to_string_pretty(self)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| SettingsError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, json).map_err(|source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Saved settings to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let mut seen = HashSet::new();
        for (i, ep) in self.endpoints.iter().enumerate() {
            if ep.host.trim().is_empty() {
                return Err(SettingsError::MissingHost(i));
            }
            let key = ep.key();
            if !seen.insert(key.clone()) {
                return Err(SettingsError::DuplicateEndpoint(key));
            }
        }
        Ok(())
    }

    /// Saved endpoint by display name or connection key.
    pub fn endpoint(&self, name_or_key: &str) -> Option<&EndpointConfig> {
        self.endpoints
            .iter()
            .find(|ep| ep.name.as_deref() == Some(name_or_key) || ep.key() == name_or_key)
    }
}
