use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::MapperKind;
use crate::error::PatpatError;
use crate::mapper::MAX_CALL_TIMEOUT;

pub const CONFIG_FILE: &str = "patpat.json";
pub const MAX_PROBE_ATTEMPTS: u32 = 10;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub mapper_timeout_secs: Option<u64>,
    #[serde(default)]
    pub probe_timeout_secs: Option<u64>,
    #[serde(default)]
    pub probe_attempts: Option<u32>,
    #[serde(default)]
    pub auto_download: Option<bool>,
    #[serde(default)]
    pub peptide_threshold: Option<usize>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub digestion: Option<DigestionEntry>,
    #[serde(default)]
    pub mappers: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DigestionEntry {
    #[serde(default)]
    pub missed_cleavages: Option<usize>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
}

/// In-silico trypsin digestion parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestionParams {
    pub missed_cleavages: usize,
    pub min_length: usize,
    pub max_length: usize,
}

impl Default for DigestionParams {
    fn default() -> Self {
        Self {
            missed_cleavages: 1,
            min_length: 7,
            max_length: 35,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub schema_version: u32,
    pub mapper_timeout: Duration,
    pub probe_timeout: Duration,
    pub probe_attempts: u32,
    pub auto_download: Option<bool>,
    pub peptide_threshold: usize,
    pub max_pages: u32,
    pub digestion: DigestionParams,
    pub mappers: Vec<MapperKind>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema_version: 1,
            mapper_timeout: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(10),
            probe_attempts: 3,
            auto_download: None,
            peptide_threshold: 1,
            max_pages: 10,
            digestion: DigestionParams::default(),
            mappers: MapperKind::all(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads settings from an explicit path, else `<root>/patpat.json`, else the
    /// user config directory. No file at all yields defaults.
    pub fn resolve(path: Option<&Path>, root: &Path) -> Result<Settings, PatpatError> {
        let config_path = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(PatpatError::ConfigRead(path.to_path_buf()));
                }
                Some(path.to_path_buf())
            }
            None => Self::discover(root),
        };

        let Some(config_path) = config_path else {
            return Ok(Settings::default());
        };

        tracing::debug!(path = %config_path.display(), "loading config");
        let content = fs::read_to_string(&config_path)
            .map_err(|_| PatpatError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| PatpatError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<Settings, PatpatError> {
        let defaults = Settings::default();
        let digestion = config.digestion.unwrap_or_default();
        let digestion = DigestionParams {
            missed_cleavages: digestion
                .missed_cleavages
                .unwrap_or(defaults.digestion.missed_cleavages),
            min_length: digestion.min_length.unwrap_or(defaults.digestion.min_length),
            max_length: digestion.max_length.unwrap_or(defaults.digestion.max_length),
        };
        if digestion.min_length == 0 || digestion.min_length > digestion.max_length {
            return Err(PatpatError::ConfigParse(format!(
                "invalid peptide length range {}..={}",
                digestion.min_length, digestion.max_length
            )));
        }

        let mappers = match config.mappers {
            Some(names) => names
                .iter()
                .map(|name| name.parse())
                .collect::<Result<Vec<MapperKind>, PatpatError>>()?,
            None => defaults.mappers,
        };

        Ok(Settings {
            schema_version: config.schema_version.unwrap_or(1),
            mapper_timeout: config
                .mapper_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.mapper_timeout)
                .min(MAX_CALL_TIMEOUT),
            probe_timeout: config
                .probe_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.probe_timeout)
                .min(MAX_CALL_TIMEOUT),
            probe_attempts: config
                .probe_attempts
                .unwrap_or(defaults.probe_attempts)
                .clamp(1, MAX_PROBE_ATTEMPTS),
            auto_download: config.auto_download,
            peptide_threshold: config
                .peptide_threshold
                .unwrap_or(defaults.peptide_threshold),
            max_pages: config.max_pages.unwrap_or(defaults.max_pages).max(1),
            digestion,
            mappers,
        })
    }

    fn discover(root: &Path) -> Option<PathBuf> {
        let local = root.join(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("org", "patpat", "patpat")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .filter(|path| path.exists())
    }
}
