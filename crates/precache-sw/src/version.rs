//! Version registry: the name of the current cache generation.

use crate::config::ConfigError;

/// Identifies the cache generation owned by one agent instance.
///
/// Fixed for the lifetime of the instance. A new version only takes effect
/// when a new instance is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRegistry {
    version: String,
    cache_name: String,
}

impl VersionRegistry {
    /// Build the registry for `version`, namespaced by `prefix`.
    ///
    /// Neither part may be blank.
    pub fn new(prefix: &str, version: &str) -> Result<Self, ConfigError> {
        if prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("cache prefix must not be empty".into()));
        }
        if version.trim().is_empty() {
            return Err(ConfigError::Invalid("version must not be empty".into()));
        }
        Ok(Self {
            version: version.to_string(),
            cache_name: format!("{prefix}-{version}"),
        })
    }

    /// The deploy version string.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Name of the current cache generation.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Whether a generation named `name` is the current one.
    pub fn is_current(&self, name: &str) -> bool {
        name == self.cache_name
    }
}

impl std::fmt::Display for VersionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.cache_name)
    }
}
