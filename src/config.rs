use crate::load::LoadOptions;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CONFIG_FILE: &str = "expf.config.json";

/// Project settings from `expf.config.json`. Every field is optional; CLI
/// flags win over anything set here.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExpfConfig {
    pub runner: Option<String>,
    pub test: Option<String>,
    pub repo: Option<String>,
    pub repo_ref: Option<String>,
    pub node: Option<String>,
    pub os: Option<String>,
    pub overrides: Map<String, Value>,
    pub uws: bool,
    pub port: Option<u16>,
    /// Accepts the same forms as `--ready-timeout` ("90", "90s", "2m").
    pub ready_timeout: Option<String>,
    pub load: LoadOptions,
}

impl ExpfConfig {
    /// Load `explicit` when given (failures are errors), otherwise
    /// `<cwd>/expf.config.json` if present. An invalid default file is
    /// reported and ignored.
    pub fn load(explicit: Option<&Path>, cwd: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::read(path);
        }

        let path = Self::default_path(cwd);
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        match Self::read(&path) {
            Ok(config) => Ok(config),
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{:#}", err), "ignoring invalid config file");
                Ok(Self::default())
            }
        }
    }

    pub fn default_path(cwd: &Path) -> PathBuf {
        cwd.join(CONFIG_FILE)
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let document: Value = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        if !document.is_object() {
            bail!("Invalid config {}: expected a JSON object", path.display());
        }
        let config: ExpfConfig = serde_json::from_value(document)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}
