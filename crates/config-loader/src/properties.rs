use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::ConfigError;

/// Flat `KEY=VALUE` settings read from a shell-style properties file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::ConfigFileNotFound {
                path: path.display().to_string(),
            });
        }

        debug!("Loading properties from {}", path.display());
        let entries = dotenvy::from_path_iter(path).map_err(|e| ConfigError::IoError {
            message: format!("{}: {}", path.display(), e),
        })?;

        Self::collect(entries, &path.display().to_string())
    }

    /// Parse properties text with shell-style quoting, `export` prefixes and
    /// trailing `#` comments. The process environment is left untouched.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Self::collect(dotenvy::from_read_iter(content.as_bytes()), "<inline>")
    }

    fn collect<I>(entries: I, source: &str) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = Result<(String, String), dotenvy::Error>>,
    {
        let values = entries
            .into_iter()
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map_err(|e| ConfigError::ParseError {
                source_name: source.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingKey {
            key: key.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
