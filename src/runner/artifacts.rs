//! Server-side result files, each read on its own. A missing or unreadable
//! file becomes an [`Artifact::Error`] entry instead of failing the set.

use futures::future::join_all;
use indexmap::IndexMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const RESULTS_DIR: &str = "results";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Text,
    Json,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub name: &'static str,
    pub file: &'static str,
    pub kind: ArtifactKind,
}

impl ArtifactSpec {
    pub const fn new(name: &'static str, file: &'static str, kind: ArtifactKind) -> Self {
        Self { name, file, kind }
    }
}

pub const OUTPUT: ArtifactSpec = ArtifactSpec::new("output", "output.txt", ArtifactKind::Text);
pub const FLAMEGRAPH: ArtifactSpec = ArtifactSpec::new("flamegraph", "profile.svg", ArtifactKind::Text);
pub const RAW_PERF_DATA: ArtifactSpec = ArtifactSpec::new("rawPerfData", "perf.data", ArtifactKind::Binary);
pub const METADATA: ArtifactSpec = ArtifactSpec::new("metadata", "metadata.json", ArtifactKind::Json);
pub const LOCKFILE: ArtifactSpec = ArtifactSpec::new("lockfile", "package-lock.json", ArtifactKind::Json);

pub const CONTAINER_ARTIFACTS: &[ArtifactSpec] = &[OUTPUT, FLAMEGRAPH, RAW_PERF_DATA, METADATA];
pub const BUILD_ARTIFACTS: &[ArtifactSpec] = &[OUTPUT, FLAMEGRAPH, RAW_PERF_DATA, METADATA, LOCKFILE];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Artifact {
    Text { path: PathBuf, content: String },
    Json { path: PathBuf, content: serde_json::Value },
    /// Binary payloads are reported by size only.
    Binary { path: PathBuf, size: u64 },
    Error { path: PathBuf, message: String },
}

impl Artifact {
    pub fn is_error(&self) -> bool {
        matches!(self, Artifact::Error { .. })
    }

    pub fn json(&self) -> Option<&serde_json::Value> {
        match self {
            Artifact::Json { content, .. } => Some(content),
            _ => None,
        }
    }
}

/// Where a backend's server writes its artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultLayout {
    pub directory: PathBuf,
    pub artifacts: Vec<ArtifactSpec>,
}

impl ResultLayout {
    pub fn new(directory: impl Into<PathBuf>, artifacts: &[ArtifactSpec]) -> Self {
        Self {
            directory: directory.into(),
            artifacts: artifacts.to_vec(),
        }
    }

    pub async fn collect(&self) -> IndexMap<String, Artifact> {
        collect_artifacts(&self.directory, &self.artifacts).await
    }
}

pub async fn collect_artifacts(directory: &Path, specs: &[ArtifactSpec]) -> IndexMap<String, Artifact> {
    let reads = specs.iter().map(|spec| async move {
        let path = directory.join(spec.file);
        let artifact = read_artifact(path, spec.kind).await;
        debug!(artifact = spec.name, error = artifact.is_error(), "collected artifact");
        (spec.name.to_string(), artifact)
    });
    join_all(reads).await.into_iter().collect()
}

async fn read_artifact(path: PathBuf, kind: ArtifactKind) -> Artifact {
    let error = |path: PathBuf, message: String| Artifact::Error { path, message };

    match kind {
        ArtifactKind::Text => match tokio::fs::read_to_string(&path).await {
            Ok(content) => Artifact::Text { path, content },
            Err(e) => error(path, e.to_string()),
        },
        ArtifactKind::Json => match tokio::fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(content) => Artifact::Json { path, content },
                Err(e) => error(path, format!("invalid JSON: {}", e)),
            },
            Err(e) => error(path, e.to_string()),
        },
        ArtifactKind::Binary => match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Artifact::Binary {
                path,
                size: meta.len(),
            },
            Ok(_) => error(path, "not a regular file".to_string()),
            Err(e) => error(path, e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_each_artifact_is_independent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("output.txt"), "startup: 3ms\n").unwrap();
        std::fs::write(dir.path().join("perf.data"), [0u8; 16]).unwrap();
        std::fs::write(dir.path().join("metadata.json"), "{not json").unwrap();

        let artifacts = collect_artifacts(dir.path(), CONTAINER_ARTIFACTS).await;
        let names: Vec<_> = artifacts.keys().map(String::as_str).collect();
        assert_eq!(names, ["output", "flamegraph", "rawPerfData", "metadata"]);

        assert!(matches!(&artifacts["output"], Artifact::Text { content, .. } if content.starts_with("startup:")));
        assert!(artifacts["flamegraph"].is_error());
        assert!(matches!(artifacts["rawPerfData"], Artifact::Binary { size: 16, .. }));
        assert!(matches!(&artifacts["metadata"], Artifact::Error { message, .. } if message.starts_with("invalid JSON")));
    }
}
