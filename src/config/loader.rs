//! Settings Loader
//!
//! Layers an optional settings file (TOML, YAML or JSON, detected by
//! extension) under environment variable overrides and flattens the result
//! into a [`CacheSettings`] map of dotted keys.
//!
//! Environment variables use `__` both after the prefix and between path
//! segments, so `POLYCACHE__CACHE__ORM__PROVIDER=redis` sets
//! `cache.orm.provider`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use config::{Config, Environment, File, Source, Value, ValueKind};
use tracing::debug;

use super::error::{ConfigResult, ConfigurationError};
use super::CacheSettings;
use crate::constants::ENV_PREFIX;

const ENV_SEPARATOR: &str = "__";

/// Builder for loading [`CacheSettings`] from files and the environment
#[derive(Debug, Clone)]
pub struct SettingsLoader {
    file: Option<PathBuf>,
    env_prefix: String,
    env_source: Option<HashMap<String, String>>,
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self {
            file: None,
            env_prefix: ENV_PREFIX.to_string(),
            env_source: None,
        }
    }
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings file to load; it must exist when given
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Read overrides from this map instead of the process environment
    pub fn env_source(mut self, vars: HashMap<String, String>) -> Self {
        self.env_source = Some(vars);
        self
    }

    pub fn load(self) -> ConfigResult<CacheSettings> {
        let source_name = self
            .file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("{} environment", self.env_prefix));

        let mut builder = Config::builder();
        if let Some(path) = &self.file {
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(&self.env_prefix)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .source(self.env_source.clone()),
        );

        let raw = builder
            .build()
            .map_err(|e| ConfigurationError::load_error(&source_name, e))?;
        let table = raw
            .collect()
            .map_err(|e| ConfigurationError::load_error(&source_name, e))?;

        let mut flat = BTreeMap::new();
        for (key, value) in table {
            flatten(key, value, &mut flat)
                .map_err(|e| ConfigurationError::load_error(&source_name, e))?;
        }

        debug!(
            source = %source_name,
            keys = flat.len(),
            "Loaded cache settings"
        );

        Ok(CacheSettings::from_map(flat))
    }
}

/// Load settings from a file with the default environment prefix
pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<CacheSettings> {
    SettingsLoader::new().file(path).load()
}

/// Load settings from the process environment only
pub fn load_from_env() -> ConfigResult<CacheSettings> {
    SettingsLoader::new().load()
}

fn flatten(
    key: String,
    value: Value,
    out: &mut BTreeMap<String, String>,
) -> Result<(), config::ConfigError> {
    match value.kind {
        ValueKind::Table(table) => {
            for (child, nested) in table {
                flatten(join(&key, &child), nested, out)?;
            }
        }
        ValueKind::Array(items) => {
            for (index, nested) in items.into_iter().enumerate() {
                flatten(join(&key, &index.to_string()), nested, out)?;
            }
        }
        ValueKind::Nil => {}
        scalar => {
            let text = Value::new(None, scalar).into_string()?;
            out.insert(key, text);
        }
    }
    Ok(())
}

fn join(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}.{segment}")
    }
}
