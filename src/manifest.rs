//! Scoped mutation of a test directory's `package.json`.
//!
//! `setup` renames the live manifest to `package.json.bak` before writing a
//! patched copy, and `cleanup` moves the backup back. A backup that is still
//! on disk means a previous run never restored, so `setup` restores first.

use crate::error::{ExpfError, Result};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "package.json";
pub const BACKUP_FILE: &str = "package.json.bak";
pub const LOCKFILE: &str = "package-lock.json";
pub const INSTALL_DIR: &str = "node_modules";

pub const UWS_PACKAGE: &str = "uWebSockets.js";
pub const UWS_SOURCE: &str = "uNetworking/uWebSockets.js#v20.51.0";
pub const UWS_EXPRESS_PACKAGE: &str = "uwebsockets-express";
const UWS_EXPRESS_FOR_EXPRESS_4: &str = "1.3.13";
const UWS_EXPRESS_LATEST: &str = "2.0.0";

/// Requested manifest changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestOptions {
    pub overrides: Map<String, Value>,
    pub uws: bool,
}

impl ManifestOptions {
    pub fn needs_mutation(&self) -> bool {
        !self.overrides.is_empty() || self.uws
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    /// The manifest was backed up and replaced by a patched copy.
    Patched,
    /// Nothing was requested; no backup exists.
    Untouched,
}

#[derive(Debug, Clone)]
pub struct ManifestPatcher {
    directory: PathBuf,
}

impl ManifestPatcher {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.directory.join(MANIFEST_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.directory.join(BACKUP_FILE)
    }

    pub async fn setup(&self, options: &ManifestOptions) -> Result<SetupOutcome> {
        self.restore().await?;

        if !options.needs_mutation() {
            debug!(directory = %self.directory.display(), "manifest left untouched");
            return Ok(SetupOutcome::Untouched);
        }

        let manifest_path = self.manifest_path();
        let content = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|e| self.manifest_error(&manifest_path, e.to_string()))?;
        let original: Value = serde_json::from_str(&content)
            .map_err(|e| self.manifest_error(&manifest_path, e.to_string()))?;
        let patched = patch_manifest(&original, options)
            .map_err(|message| self.manifest_error(&manifest_path, message))?;
        let mut bytes = serde_json::to_vec_pretty(&patched)
            .map_err(|e| self.manifest_error(&manifest_path, e.to_string()))?;
        bytes.push(b'\n');

        tokio::fs::rename(&manifest_path, self.backup_path())
            .await
            .map_err(|e| self.manifest_error(&manifest_path, format!("backup failed: {}", e)))?;

        let target = manifest_path.clone();
        let written = tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
            .await
            .map_err(|e| ExpfError::Task(e.to_string()))
            .and_then(|inner| inner.map_err(|e| self.manifest_error(&manifest_path, e.to_string())));

        if let Err(err) = written {
            // The original is still intact in the backup.
            self.restore().await?;
            return Err(err);
        }

        info!(
            manifest = %manifest_path.display(),
            overrides = options.overrides.len(),
            uws = options.uws,
            "patched manifest"
        );
        Ok(SetupOutcome::Patched)
    }

    /// Move a leftover backup over the manifest. Returns whether one existed.
    pub async fn restore(&self) -> Result<bool> {
        let backup = self.backup_path();
        match tokio::fs::metadata(&backup).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(self.restore_error(e.to_string())),
        }

        info!(backup = %backup.display(), "{} exists, restoring original", BACKUP_FILE);
        let manifest = self.manifest_path();
        if cfg!(windows) {
            match tokio::fs::remove_file(&manifest).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.restore_error(e.to_string())),
            }
        }
        tokio::fs::rename(&backup, &manifest)
            .await
            .map_err(|e| self.restore_error(e.to_string()))?;
        Ok(true)
    }

    /// Restore the backup (if any) and, when one was restored, remove the
    /// lockfile and install directory generated against the patched manifest.
    pub async fn cleanup(&self) -> Result<bool> {
        let restored = self.restore().await?;
        if restored {
            remove_if_present(&self.directory.join(LOCKFILE), false).await?;
            remove_if_present(&self.directory.join(INSTALL_DIR), true).await?;
        }
        Ok(restored)
    }

    fn manifest_error(&self, path: &Path, message: String) -> ExpfError {
        ExpfError::Manifest {
            path: path.to_path_buf(),
            message,
        }
    }

    fn restore_error(&self, message: String) -> ExpfError {
        ExpfError::ManifestRestoreFailed {
            manifest: self.manifest_path(),
            backup: self.backup_path(),
            message,
        }
    }
}

/// Apply overrides and the uWebSockets toggle to a parsed manifest.
pub fn patch_manifest(manifest: &Value, options: &ManifestOptions) -> std::result::Result<Value, String> {
    let mut patched = manifest
        .as_object()
        .cloned()
        .ok_or_else(|| "manifest is not a JSON object".to_string())?;

    if !options.overrides.is_empty() {
        let mut overrides = object_field(&patched, "overrides");
        overrides.extend(options.overrides.clone());
        patched.insert("overrides".to_string(), Value::Object(overrides));
    }

    if options.uws {
        let version = match options.overrides.get(UWS_EXPRESS_PACKAGE).and_then(Value::as_str) {
            Some(version) => version.to_string(),
            None => {
                let express = options
                    .overrides
                    .get("express")
                    .and_then(Value::as_str)
                    .or_else(|| manifest.pointer("/dependencies/express").and_then(Value::as_str))
                    .unwrap_or_default();
                uws_express_version(express).to_string()
            }
        };

        let mut dependencies = object_field(&patched, "dependencies");
        dependencies.insert(UWS_PACKAGE.to_string(), Value::String(UWS_SOURCE.to_string()));
        dependencies.insert(UWS_EXPRESS_PACKAGE.to_string(), Value::String(version));
        patched.insert("dependencies".to_string(), Value::Object(dependencies));

        if let Some(Value::Object(overrides)) = patched.get_mut("overrides") {
            overrides.shift_remove(UWS_EXPRESS_PACKAGE);
        }
    }

    Ok(Value::Object(patched))
}

/// `uwebsockets-express` release matching an express version range.
pub fn uws_express_version(express: &str) -> &'static str {
    let range = express.trim().trim_start_matches(['^', '~']);
    if range == "4" || range.starts_with("4.") {
        UWS_EXPRESS_FOR_EXPRESS_4
    } else {
        UWS_EXPRESS_LATEST
    }
}

fn object_field(object: &Map<String, Value>, key: &str) -> Map<String, Value> {
    object
        .get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(parent)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

async fn remove_if_present(path: &Path, directory: bool) -> Result<()> {
    let removed = if directory {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ExpfError::io(format!("removing {}", path.display()), e)),
    }
}
