//! Agent configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::intercept::ResolutionPolicy;
use crate::version::VersionRegistry;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Agent configuration.
///
/// ```json
/// {
///   "cache_prefix": "ped-bili",
///   "version": "2024-08-19-001",
///   "scope": "https://example.com/app/",
///   "static_assets": ["./", "./index.html", "./app.js"],
///   "policy": "cache-first"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Prefix of every cache generation name.
    #[serde(default = "default_prefix")]
    pub cache_prefix: String,

    /// Deploy version. Change it whenever a cached asset changes.
    pub version: String,

    /// URL prefix of the pages and assets the agent serves.
    pub scope: Url,

    /// Assets required for offline use, relative to `scope`.
    pub static_assets: Vec<String>,

    /// Resolution order for intercepted reads.
    #[serde(default)]
    pub policy: ResolutionPolicy,

    /// Activate right after install instead of waiting for old pages to close.
    #[serde(default = "default_true")]
    pub skip_waiting_on_install: bool,
}

fn default_prefix() -> String {
    "precache".to_string()
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    /// Cache-first configuration with default prefix.
    pub fn new(scope: Url, version: &str, static_assets: Vec<String>) -> Self {
        Self {
            cache_prefix: default_prefix(),
            version: version.to_string(),
            scope,
            static_assets,
            policy: ResolutionPolicy::default(),
            skip_waiting_on_install: true,
        }
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parse and validate a JSON config.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.versions()?;
        if !matches!(self.scope.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "scope must be http(s): {}",
                self.scope
            )));
        }
        if !self.scope.path().ends_with('/') {
            return Err(ConfigError::Invalid(format!(
                "scope must end with '/': {}",
                self.scope
            )));
        }
        if self.static_assets.is_empty() {
            return Err(ConfigError::Invalid("static_assets must not be empty".into()));
        }
        self.resolved_assets().map(|_| ())
    }

    /// The version registry for this deploy.
    pub fn versions(&self) -> Result<VersionRegistry, ConfigError> {
        VersionRegistry::new(&self.cache_prefix, &self.version)
    }

    /// Static assets resolved against `scope`, in order.
    ///
    /// Every asset must stay on the scope's origin.
    pub fn resolved_assets(&self) -> Result<Vec<Url>, ConfigError> {
        let origin = self.scope.origin();
        self.static_assets
            .iter()
            .map(|asset| {
                let resolved = self
                    .scope
                    .join(asset)
                    .map_err(|e| ConfigError::Invalid(format!("bad asset {asset:?}: {e}")))?;
                if resolved.origin() != origin {
                    return Err(ConfigError::Invalid(format!(
                        "asset {asset:?} is not on {}",
                        origin.ascii_serialization()
                    )));
                }
                Ok(resolved)
            })
            .collect()
    }
}
