use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionSnapshot;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PersistedFields {
    pub source: String,
    pub query: String,
}

impl PersistedFields {
    #[must_use]
    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Self {
        Self {
            source: snapshot.source.clone(),
            query: snapshot.query.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FieldsError {
    #[error("failed to read fields file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse fields file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to create config directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize fields: {source}")]
    Serialize {
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to write fields file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FileFieldsStore {
    path: PathBuf,
    fields: PersistedFields,
}

impl FileFieldsStore {
    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, FieldsError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path,
                fields: PersistedFields::default(),
            });
        }

        let raw = fs::read_to_string(&path).map_err(|source| FieldsError::Read {
            path: path.clone(),
            source,
        })?;
        let fields = if raw.trim().is_empty() {
            PersistedFields::default()
        } else {
            toml::from_str(&raw).map_err(|source| FieldsError::Parse {
                path: path.clone(),
                source,
            })?
        };

        Ok(Self { path, fields })
    }

    #[must_use]
    pub fn fields(&self) -> &PersistedFields {
        &self.fields
    }

    pub fn update(&mut self, fields: PersistedFields) -> bool {
        if self.fields == fields {
            return false;
        }
        self.fields = fields;
        true
    }

    pub fn persist(&self) -> Result<(), FieldsError> {
        if let Some(parent_dir) = self.path.parent() {
            fs::create_dir_all(parent_dir).map_err(|source| FieldsError::CreateDir {
                path: parent_dir.to_path_buf(),
                source,
            })?;
        }

        let rendered = toml::to_string_pretty(&self.fields)
            .map_err(|source| FieldsError::Serialize { source })?;
        fs::write(&self.path, rendered).map_err(|source| FieldsError::Write {
            path: self.path.clone(),
            source,
        })
    }
}
