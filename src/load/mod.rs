pub mod adapter;
pub mod autocannon;
pub mod fanout;
pub mod inprocess;
pub mod metrics;
pub mod options;
pub mod probe;
pub mod process;
pub mod result;
pub mod wrk2;

pub use adapter::LoadGenerator;
pub use fanout::{start_load, FanoutOptions, LoadSession};
pub use options::{RequestOverrides, ToolOptions, ToolOverrides};
pub use process::{ProcessHandle, ProcessRegistry, ProcessStatus, ToolCommand};
pub use result::ToolResult;

use crate::cancel::CancelSignal;
use crate::error::{ExpfError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadGeneratorKind {
    Autocannon,
    Wrk2,
    InProcess,
}

impl LoadGeneratorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Autocannon => autocannon::NAME,
            Self::Wrk2 => wrk2::NAME,
            Self::InProcess => inprocess::NAME,
        }
    }

    /// The external tools tried when nothing is configured.
    pub fn defaults() -> Vec<Self> {
        vec![Self::Autocannon, Self::Wrk2]
    }
}

impl fmt::Display for LoadGeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadGeneratorKind {
    type Err = ExpfError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "autocannon" => Ok(Self::Autocannon),
            "wrk2" | "wrk" => Ok(Self::Wrk2),
            "in-process" | "inprocess" | "native" => Ok(Self::InProcess),
            other => Err(ExpfError::InvalidOptions(format!(
                "unknown load generator: {}",
                other
            ))),
        }
    }
}

/// Everything the client phase needs to build and drive its generators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOptions {
    #[serde(default)]
    pub tool: ToolOverrides,
    #[serde(default)]
    pub generators: Vec<LoadGeneratorKind>,
    /// Replacement argv prefixes keyed by generator name.
    #[serde(default)]
    pub executables: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub parallel: bool,
}

impl LoadOptions {
    pub fn kinds(&self) -> Vec<LoadGeneratorKind> {
        if self.generators.is_empty() {
            LoadGeneratorKind::defaults()
        } else {
            self.generators.clone()
        }
    }

    /// Build one generator per configured kind, targeting `url`.
    pub fn build(&self, url: &str, cancel: &CancelSignal) -> Result<Vec<Arc<dyn LoadGenerator>>> {
        let overrides = ToolOverrides {
            url: Some(url.to_string()),
            ..Default::default()
        };
        let options = ToolOptions::default().layer(&self.tool.merged(&overrides));
        options.validate()?;

        self.kinds()
            .into_iter()
            .map(|kind| -> Result<Arc<dyn LoadGenerator>> {
                let program = self.executables.get(kind.as_str()).cloned();
                let cancel = cancel.clone();
                let generator: Arc<dyn LoadGenerator> = match (kind, program) {
                    (LoadGeneratorKind::Autocannon, Some(program)) => Arc::new(
                        autocannon::Autocannon::with_program(program, options.clone(), cancel),
                    ),
                    (LoadGeneratorKind::Autocannon, None) => {
                        Arc::new(autocannon::Autocannon::new(options.clone(), cancel))
                    }
                    (LoadGeneratorKind::Wrk2, Some(program)) => {
                        Arc::new(wrk2::Wrk2::with_program(program, options.clone(), cancel))
                    }
                    (LoadGeneratorKind::Wrk2, None) => {
                        Arc::new(wrk2::Wrk2::new(options.clone(), cancel))
                    }
                    (LoadGeneratorKind::InProcess, _) => {
                        Arc::new(inprocess::InProcess::new(options.clone(), cancel)?)
                    }
                };
                Ok(generator)
            })
            .collect()
    }
}

pub(crate) fn available_parallelism() -> Option<u32> {
    std::thread::available_parallelism()
        .ok()
        .map(|n| n.get() as u32)
}
