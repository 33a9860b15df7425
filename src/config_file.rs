use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{FixerError, Result};
use crate::gate::DEFAULT_CHUNK_NUMS;
use crate::meta_db::{DEFAULT_TABLE_PREFIX, validate_prefix};
use crate::pages::DEFAULT_CHUNK_SIZE;
use crate::report::DEFAULT_REPORT_FILE;

pub(crate) const DEFAULT_CONFIG_FILE: &str = "acfml.json";

/// Pages per incremental step; read at the start of every trigger.
pub(crate) const CHUNK_NUMS_ENV: &str = "ACFML_CLEANER_CHUNK_NUMS";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub(crate) struct FileConfig {
    #[serde(default)]
    pub(crate) database: Option<PathBuf>,
    #[serde(default)]
    pub(crate) table_prefix: Option<String>,
    #[serde(default)]
    pub(crate) chunk_size: Option<u64>,
    #[serde(default)]
    pub(crate) chunk_nums: Option<u32>,
    #[serde(default)]
    pub(crate) report_path: Option<PathBuf>,
}

/// A missing file means defaults. An unreadable or malformed one is reported
/// and also falls back to defaults.
pub(crate) fn load_file_config(path: &Path) -> FileConfig {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return FileConfig::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config file; using defaults");
            return FileConfig::default();
        }
    };
    match serde_json::from_str(&data) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed config file; using defaults");
            FileConfig::default()
        }
    }
}

/// Values given on the command line; they win over the config file.
#[derive(Debug, Clone, Default)]
pub(crate) struct Overrides {
    pub(crate) database: Option<PathBuf>,
    pub(crate) table_prefix: Option<String>,
    pub(crate) chunk_size: Option<u64>,
    pub(crate) report_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Settings {
    pub(crate) database: PathBuf,
    pub(crate) table_prefix: String,
    pub(crate) chunk_size: u64,
    pub(crate) chunk_nums: u32,
    pub(crate) report_path: PathBuf,
}

impl Settings {
    pub(crate) fn resolve(overrides: Overrides, file: FileConfig) -> Result<Self> {
        let database = overrides.database.or(file.database).ok_or_else(|| {
            FixerError::Config(
                "no database given; pass --db or set \"database\" in the config file".into(),
            )
        })?;
        let table_prefix = overrides
            .table_prefix
            .or(file.table_prefix)
            .unwrap_or_else(|| DEFAULT_TABLE_PREFIX.to_string());
        validate_prefix(&table_prefix)?;
        let chunk_size = overrides
            .chunk_size
            .or(file.chunk_size)
            .unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(FixerError::Config("chunk size must be at least 1".into()));
        }
        let chunk_nums = match file.chunk_nums {
            Some(0) => {
                return Err(FixerError::Config("chunk_nums must be at least 1".into()));
            }
            Some(n) => n,
            None => DEFAULT_CHUNK_NUMS,
        };
        let report_path = overrides
            .report_path
            .or(file.report_path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_FILE));
        Ok(Self {
            database,
            table_prefix,
            chunk_size,
            chunk_nums,
            report_path,
        })
    }

    /// Pages per incremental step, with the environment consulted afresh.
    pub(crate) fn chunk_nums_for_trigger(&self) -> u32 {
        chunk_nums_from(std::env::var(CHUNK_NUMS_ENV).ok().as_deref(), self.chunk_nums)
    }
}

pub(crate) fn chunk_nums_from(env: Option<&str>, fallback: u32) -> u32 {
    match env.map(str::trim) {
        None | Some("") => fallback,
        Some(raw) => match raw.parse::<u32>() {
            Ok(n) if n > 0 => n,
            _ => {
                warn!(value = raw, "ignoring invalid {CHUNK_NUMS_ENV}");
                fallback
            }
        },
    }
}
