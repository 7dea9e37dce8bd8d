//! Request definitions and the test module contract.
//!
//! A test module names the server-under-test and the ordered set of
//! requests to drive against it. On disk it is a directory holding an
//! `expf.test.yaml` (or `.json`) file.

use crate::error::{ExpfError, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const TEST_FILE_NAMES: &[&str] = &["expf.test.yaml", "expf.test.yml", "expf.test.json"];

/// A request body: passed verbatim when text, serialized when JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Body {
    Text(String),
    Json(serde_json::Value),
}

impl Body {
    pub fn to_payload(&self) -> String {
        match self {
            Body::Text(text) => text.clone(),
            Body::Json(value) => value.to_string(),
        }
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_string())
    }
}

/// One HTTP request definition. `path` may be a path relative to the
/// server URL or an absolute URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    #[serde(default = "default_method")]
    method: String,
    #[serde(default = "default_path", alias = "url")]
    path: String,
    #[serde(default)]
    headers: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<Body>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

impl Default for RequestSpec {
    fn default() -> Self {
        Self::get("/")
    }
}

impl RequestSpec {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_uppercase(),
            path: path.into(),
            headers: IndexMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new("POST", path)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_json_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(Body::Json(body));
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &IndexMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }
}

impl fmt::Display for RequestSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// How to launch the server of a test module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCommand {
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[async_trait]
pub trait TestModule: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// The specifier this module was resolved from, passed to containers as `TEST`.
    fn specifier(&self) -> &str;

    fn directory(&self) -> &Path;

    async fn requests(&self) -> Result<Vec<RequestSpec>>;

    fn server(&self) -> Option<&ServerCommand> {
        None
    }

    fn setup(&self) -> Option<&[String]> {
        None
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TestDefinition {
    name: Option<String>,
    server: Option<ServerCommand>,
    #[serde(default)]
    setup: Option<Vec<String>>,
    #[serde(default)]
    requests: Vec<RequestSpec>,
}

/// A test module read from an `expf.test.yaml` / `expf.test.json` file.
#[derive(Debug, Clone)]
pub struct FileTestModule {
    name: String,
    specifier: String,
    directory: PathBuf,
    server: Option<ServerCommand>,
    setup: Option<Vec<String>>,
    requests: Vec<RequestSpec>,
}

impl FileTestModule {
    /// Resolve `specifier` as a test file or a directory containing one.
    pub fn resolve(specifier: &str) -> Result<Self> {
        let path = PathBuf::from(specifier);
        let file = if path.is_dir() {
            TEST_FILE_NAMES
                .iter()
                .map(|name| path.join(name))
                .find(|candidate| candidate.is_file())
                .ok_or_else(|| ExpfError::TestModule {
                    path: path.clone(),
                    message: format!("no {} found", TEST_FILE_NAMES.join(" / ")),
                })?
        } else {
            path.clone()
        };

        let content = std::fs::read_to_string(&file).map_err(|e| ExpfError::TestModule {
            path: file.clone(),
            message: e.to_string(),
        })?;
        let definition = Self::parse(&file, &content)?;

        let directory = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let directory = std::fs::canonicalize(&directory).unwrap_or(directory);
        let name = definition.name.unwrap_or_else(|| {
            directory
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| specifier.to_string())
        });
        let requests = if definition.requests.is_empty() {
            vec![RequestSpec::default()]
        } else {
            definition.requests
        };

        Ok(Self {
            name,
            specifier: specifier.to_string(),
            directory,
            server: definition.server,
            setup: definition.setup,
            requests,
        })
    }

    fn parse(file: &Path, content: &str) -> Result<TestDefinition> {
        let is_json = file.extension().is_some_and(|ext| ext == "json");
        let parsed = if is_json {
            serde_json::from_str(content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(content).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| ExpfError::TestModule {
            path: file.to_path_buf(),
            message,
        })
    }
}

#[async_trait]
impl TestModule for FileTestModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn specifier(&self) -> &str {
        &self.specifier
    }

    fn directory(&self) -> &Path {
        &self.directory
    }

    async fn requests(&self) -> Result<Vec<RequestSpec>> {
        Ok(self.requests.clone())
    }

    fn server(&self) -> Option<&ServerCommand> {
        self.server.as_ref()
    }

    fn setup(&self) -> Option<&[String]> {
        self.setup.as_deref()
    }
}

/// A test module assembled in memory.
#[derive(Debug, Clone)]
pub struct StaticTestModule {
    name: String,
    directory: PathBuf,
    server: Option<ServerCommand>,
    setup: Option<Vec<String>>,
    requests: Vec<RequestSpec>,
}

impl StaticTestModule {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            server: None,
            setup: None,
            requests: vec![RequestSpec::default()],
        }
    }

    pub fn with_server(mut self, command: Vec<String>) -> Self {
        self.server = Some(ServerCommand {
            command,
            env: BTreeMap::new(),
        });
        self
    }

    pub fn with_setup(mut self, command: Vec<String>) -> Self {
        self.setup = Some(command);
        self
    }

    pub fn with_requests(mut self, requests: Vec<RequestSpec>) -> Self {
        self.requests = requests;
        self
    }
}

#[async_trait]
impl TestModule for StaticTestModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn specifier(&self) -> &str {
        &self.name
    }

    fn directory(&self) -> &Path {
        &self.directory
    }

    async fn requests(&self) -> Result<Vec<RequestSpec>> {
        Ok(self.requests.clone())
    }

    fn server(&self) -> Option<&ServerCommand> {
        self.server.as_ref()
    }

    fn setup(&self) -> Option<&[String]> {
        self.setup.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_request_spec_defaults() {
        let spec: RequestSpec = serde_yaml::from_str("{}").unwrap();
        assert_eq!(spec.method(), "GET");
        assert_eq!(spec.path(), "/");
        assert!(spec.headers().is_empty());
        assert!(spec.body().is_none());
    }

    #[test]
    fn test_body_payload() {
        assert_eq!(Body::from("a=b").to_payload(), "a=b");
        assert_eq!(
            Body::Json(serde_json::json!({"hello": "world"})).to_payload(),
            r#"{"hello":"world"}"#
        );
    }

    #[tokio::test]
    async fn test_resolve_yaml_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("expf.test.yaml"),
            r#"
name: body-parser
server:
  command: ["node", "index.js"]
  env:
    NODE_ENV: production
setup: ["npm", "install"]
requests:
  - method: POST
    path: /json
    headers:
      content-type: application/json
    body:
      hello: world
  - path: /
"#,
        )
        .unwrap();

        let module = FileTestModule::resolve(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(module.name(), "body-parser");
        assert_eq!(module.server().unwrap().command, vec!["node", "index.js"]);
        assert_eq!(module.server().unwrap().env["NODE_ENV"], "production");
        assert_eq!(module.setup().unwrap(), ["npm", "install"]);

        let requests = module.requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method(), "POST");
        assert_eq!(requests[0].headers()["content-type"], "application/json");
        assert_eq!(
            requests[0].body(),
            Some(&Body::Json(serde_json::json!({"hello": "world"})))
        );
        assert_eq!(requests[1].to_string(), "GET /");
    }

    #[tokio::test]
    async fn test_resolve_without_requests_defaults_to_root() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("expf.test.json");
        std::fs::write(&file, r#"{"server": {"command": ["./server"]}}"#).unwrap();

        let module = FileTestModule::resolve(file.to_str().unwrap()).unwrap();
        assert_eq!(module.requests().await.unwrap(), vec![RequestSpec::get("/")]);
    }

    #[test]
    fn test_resolve_missing_definition() {
        let dir = TempDir::new().unwrap();
        let err = FileTestModule::resolve(dir.path().to_str().unwrap()).unwrap_err();
        assert_eq!(err.code(), "TEST_MODULE");
    }
}
