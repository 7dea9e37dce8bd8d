use crate::error::{ExpfError, Result};
use crate::requests::{Body, RequestSpec};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_DURATION_SECS: u64 = 60;
pub const DEFAULT_CONNECTIONS: u32 = 100;
pub const DEFAULT_URL: &str = "http://127.0.0.1:3000/";

/// Fully resolved options for one load-generator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOptions {
    pub duration: u64,
    pub connections: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<u32>,
    pub method: String,
    pub url: String,
    pub headers: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self {
            duration: DEFAULT_DURATION_SECS,
            connections: DEFAULT_CONNECTIONS,
            rate: None,
            method: "GET".to_string(),
            url: DEFAULT_URL.to_string(),
            headers: IndexMap::new(),
            body: None,
        }
    }
}

impl ToolOptions {
    pub fn validate(&self) -> Result<()> {
        if self.duration == 0 {
            return Err(ExpfError::InvalidOptions("duration must be > 0".into()));
        }
        if self.connections == 0 {
            return Err(ExpfError::InvalidOptions("connections must be > 0".into()));
        }
        if self.rate == Some(0) {
            return Err(ExpfError::InvalidOptions("rate must be > 0".into()));
        }
        Url::parse(&self.url)
            .map_err(|e| ExpfError::InvalidOptions(format!("url {}: {}", self.url, e)))?;
        Ok(())
    }

    /// Apply one layer of overrides. Scalars replace, headers merge per key.
    pub fn layer(mut self, overrides: &ToolOverrides) -> Self {
        if let Some(duration) = overrides.duration {
            self.duration = duration;
        }
        if let Some(connections) = overrides.connections {
            self.connections = connections;
        }
        if overrides.rate.is_some() {
            self.rate = overrides.rate;
        }
        if let Some(method) = &overrides.method {
            self.method = method.to_uppercase();
        }
        if let Some(url) = &overrides.url {
            self.url = url.clone();
        }
        for (key, value) in &overrides.headers {
            self.headers.insert(key.clone(), value.clone());
        }
        if overrides.body.is_some() {
            self.body = overrides.body.clone();
        }
        self
    }

    /// Options for a single request: its path is resolved against `url`
    /// and its headers win over the constructor headers.
    pub fn for_request(&self, request: &RequestOverrides) -> Result<Self> {
        let mut merged = self.clone();
        if let Some(path) = &request.path {
            let base = Url::parse(&self.url)
                .map_err(|e| ExpfError::InvalidOptions(format!("url {}: {}", self.url, e)))?;
            merged.url = base
                .join(path)
                .map_err(|e| ExpfError::InvalidOptions(format!("path {}: {}", path, e)))?
                .to_string();
        }
        if let Some(method) = &request.method {
            merged.method = method.to_uppercase();
        }
        for (key, value) in &request.headers {
            merged.headers.insert(key.clone(), value.clone());
        }
        if request.body.is_some() {
            merged.body = request.body.clone();
        }
        merged.validate()?;
        Ok(merged)
    }
}

/// One partial layer of [`ToolOptions`] (config file or CLI flags).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOverrides {
    pub duration: Option<u64>,
    pub connections: Option<u32>,
    pub rate: Option<u32>,
    pub method: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    pub body: Option<Body>,
}

impl ToolOverrides {
    /// `other` wins per key.
    pub fn merged(&self, other: &ToolOverrides) -> ToolOverrides {
        let mut headers = self.headers.clone();
        headers.extend(other.headers.clone());
        ToolOverrides {
            duration: other.duration.or(self.duration),
            connections: other.connections.or(self.connections),
            rate: other.rate.or(self.rate),
            method: other.method.clone().or_else(|| self.method.clone()),
            url: other.url.clone().or_else(|| self.url.clone()),
            headers,
            body: other.body.clone().or_else(|| self.body.clone()),
        }
    }
}

/// Per-call overrides handed to `LoadGenerator::start`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOverrides {
    pub method: Option<String>,
    pub path: Option<String>,
    pub headers: IndexMap<String, String>,
    pub body: Option<Body>,
}

impl From<&RequestSpec> for RequestOverrides {
    fn from(spec: &RequestSpec) -> Self {
        Self {
            method: Some(spec.method().to_string()),
            path: Some(spec.path().to_string()),
            headers: spec.headers().clone(),
            body: spec.body().cloned(),
        }
    }
}
