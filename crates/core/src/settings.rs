use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::load_sql::{
    is_plain_identifier, LoadPlan, DEFAULT_EXTENSIONS, DEFAULT_PREVIEW_LIMIT, DEFAULT_TABLE_NAME,
};

pub const EXAMPLE_SOURCE: &str = "https://huggingface.co/datasets/openai/openai_humaneval/resolve/main/openai_humaneval/test-00000-of-00001.parquet";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub example_source: String,
    pub table_name: String,
    pub preview_limit: u32,
    pub extensions: Vec<String>,
    pub install_extensions: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            example_source: EXAMPLE_SOURCE.to_string(),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            preview_limit: DEFAULT_PREVIEW_LIMIT,
            extensions: DEFAULT_EXTENSIONS
                .iter()
                .map(|extension| (*extension).to_string())
                .collect(),
            install_extensions: true,
        }
    }
}

impl Settings {
    #[must_use]
    pub fn load_plan(&self) -> LoadPlan {
        LoadPlan::new(self.table_name.clone())
            .with_preview_limit(self.preview_limit)
            .with_extensions(self.extensions.iter().cloned())
            .with_install_extensions(self.install_extensions)
    }

    fn validate(&self, path: &Path) -> Result<(), SettingsError> {
        if !is_plain_identifier(&self.table_name) {
            return Err(SettingsError::InvalidTableName {
                path: path.to_path_buf(),
                name: self.table_name.clone(),
            });
        }
        if let Some(extension) = self
            .extensions
            .iter()
            .find(|extension| !is_plain_identifier(extension))
        {
            return Err(SettingsError::InvalidExtension {
                path: path.to_path_buf(),
                name: extension.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read settings file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid table name `{name}` in {path}")]
    InvalidTableName { path: PathBuf, name: String },
    #[error("invalid extension name `{name}` in {path}")]
    InvalidExtension { path: PathBuf, name: String },
}

impl Settings {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let settings: Self = toml::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate(path)?;
        Ok(settings)
    }
}

pub fn config_dir() -> Result<PathBuf, SettingsError> {
    if let Some(custom) = env::var_os("QUACK_CONFIG_DIR") {
        return Ok(PathBuf::from(custom));
    }

    let base_dir = if cfg!(target_os = "windows") {
        env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or(SettingsError::ConfigDirUnavailable)?
    } else if let Some(xdg_config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        let home = env::var_os("HOME").ok_or(SettingsError::ConfigDirUnavailable)?;
        PathBuf::from(home).join(".config")
    };

    Ok(base_dir.join("quack"))
}
