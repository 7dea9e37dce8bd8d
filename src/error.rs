use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Code carried by [`ExpfError::ToolNotInstalled`]. Aggregation layers may
/// discard errors with this code; everything else propagates.
pub const EXECUTABLE_NOT_PRESENT: &str = "EXECUTABLE_NOT_PRESENT";

pub type Result<T, E = ExpfError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum ExpfError {
    #[error("executable not present: {executable} ({cause})")]
    ToolNotInstalled { executable: String, cause: String },

    #[error("failed to spawn {executable}: {message}")]
    ToolSpawnFailed {
        executable: String,
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("{executable} failed with {}", describe_exit(*code))]
    ToolExecutionFailed {
        executable: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("{executable} produced unexpected output: {reason}")]
    ToolOutputUnparseable {
        executable: String,
        reason: String,
        stdout: String,
    },

    #[error("{tool} does not support {option}")]
    UnsupportedOption { tool: &'static str, option: String },

    #[error("invalid load options: {0}")]
    InvalidOptions(String),

    #[error("request set is empty")]
    EmptyRequestSet,

    #[error("no load generators configured")]
    NoLoadGenerators,

    #[error("no usable load generator (not installed: {})", .0.join(", "))]
    NoUsableLoadGenerator(Vec<String>),

    #[error("failed to start server {program}: {message}")]
    ServerSpawnFailed { program: String, message: String },

    #[error("server did not print {marker:?} within {timeout:?}")]
    ReadinessTimeout { marker: String, timeout: Duration },

    #[error("server exited before it was ready ({})", describe_exit(*code))]
    ServerExited { code: Option<i32>, output: String },

    #[error("aborted: {0}")]
    Cancelled(String),

    #[error("failed to restore {} from {}: {message}", manifest.display(), backup.display())]
    ManifestRestoreFailed {
        manifest: PathBuf,
        backup: PathBuf,
        message: String,
    },

    #[error("manifest {}: {message}", path.display())]
    Manifest { path: PathBuf, message: String },

    #[error("test module {}: {message}", path.display())]
    TestModule { path: PathBuf, message: String },

    #[error("background task failed: {0}")]
    Task(String),

    #[error("{context}: {message}")]
    Io { context: String, message: String },
}

impl ExpfError {
    pub fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ToolNotInstalled { .. } => EXECUTABLE_NOT_PRESENT,
            Self::ToolSpawnFailed { .. } => "TOOL_SPAWN_FAILED",
            Self::ToolExecutionFailed { .. } => "TOOL_EXECUTION_FAILED",
            Self::ToolOutputUnparseable { .. } => "TOOL_OUTPUT_UNPARSEABLE",
            Self::UnsupportedOption { .. } => "UNSUPPORTED_OPTION",
            Self::InvalidOptions(_) => "INVALID_OPTIONS",
            Self::EmptyRequestSet => "EMPTY_REQUEST_SET",
            Self::NoLoadGenerators => "NO_LOAD_GENERATORS",
            Self::NoUsableLoadGenerator(_) => "NO_USABLE_LOAD_GENERATOR",
            Self::ServerSpawnFailed { .. } => "SERVER_SPAWN_FAILED",
            Self::ReadinessTimeout { .. } => "READINESS_TIMEOUT",
            Self::ServerExited { .. } => "SERVER_EXITED",
            Self::Cancelled(_) => "CANCELLED",
            Self::ManifestRestoreFailed { .. } => "MANIFEST_RESTORE_FAILED",
            Self::Manifest { .. } => "MANIFEST",
            Self::TestModule { .. } => "TEST_MODULE",
            Self::Task(_) => "TASK_FAILED",
            Self::Io { .. } => "IO",
        }
    }

    /// Soft failures may be filtered out by aggregation.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::ToolNotInstalled { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Captured `(stdout, stderr)` of the failing process, when there was one.
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self {
            Self::ToolSpawnFailed { stdout, stderr, .. }
            | Self::ToolExecutionFailed { stdout, stderr, .. } => Some((stdout, stderr)),
            Self::ToolOutputUnparseable { stdout, .. } => Some((stdout, "")),
            Self::ServerExited { output, .. } => Some((output, "")),
            _ => None,
        }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}
