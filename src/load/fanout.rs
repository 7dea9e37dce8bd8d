//! Concurrent execution of every (generator, request) pair.

use crate::error::{ExpfError, Result};
use crate::load::adapter::LoadGenerator;
use crate::load::options::RequestOverrides;
use crate::load::process::ProcessHandle;
use crate::load::result::ToolResult;
use crate::requests::RequestSpec;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutOptions {
    pub parallel: bool,
}

type Pending = Vec<(&'static str, JoinHandle<Result<ToolResult>>)>;

/// Handle on a launched load phase.
pub struct LoadSession {
    generators: Vec<Arc<dyn LoadGenerator>>,
    pending: Mutex<Option<Pending>>,
    results: OnceCell<Result<Vec<ToolResult>>>,
}

/// Validate, then launch every pair immediately. Pairs are launched
/// generator-major: all requests of the first generator, then the next.
pub fn start_load(
    requests: Vec<RequestSpec>,
    generators: Vec<Arc<dyn LoadGenerator>>,
    options: FanoutOptions,
) -> Result<LoadSession> {
    if requests.is_empty() {
        return Err(ExpfError::EmptyRequestSet);
    }
    if generators.is_empty() {
        return Err(ExpfError::NoLoadGenerators);
    }

    let requests = if requests.len() > 1 && !options.parallel {
        warn!(
            requests = requests.len(),
            "running multiple request types in parallel may give unreliable results; pass --parallel to enable it. Using only the first request"
        );
        requests.into_iter().take(1).collect()
    } else {
        requests
    };

    let mut pending = Vec::with_capacity(generators.len() * requests.len());
    for generator in &generators {
        for request in &requests {
            let generator = Arc::clone(generator);
            let overrides = RequestOverrides::from(request);
            debug!(generator = generator.name(), request = %request, "launching");
            pending.push((
                generator.name(),
                tokio::spawn(async move { generator.start(&overrides).await }),
            ));
        }
    }

    Ok(LoadSession {
        generators,
        pending: Mutex::new(Some(pending)),
        results: OnceCell::new(),
    })
}

impl LoadSession {
    /// Await every launched run, in launch order. Generators that are not
    /// installed are dropped; any other failure fails the whole set.
    pub async fn results(&self) -> Result<Vec<ToolResult>> {
        self.results.get_or_init(|| self.collect()).await.clone()
    }

    async fn collect(&self) -> Result<Vec<ToolResult>> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .unwrap_or_default();

        let mut results = Vec::with_capacity(pending.len());
        let mut absent = Vec::new();
        for (name, handle) in pending {
            match handle.await {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(err)) if err.is_soft() => {
                    debug!(generator = name, error = %err, "skipping load generator");
                    if !absent.contains(&name) {
                        absent.push(name);
                    }
                }
                Ok(Err(err)) => return Err(err),
                Err(join) => return Err(ExpfError::Task(format!("{}: {}", name, join))),
            }
        }

        if results.is_empty() && !absent.is_empty() {
            return Err(ExpfError::NoUsableLoadGenerator(
                absent.into_iter().map(String::from).collect(),
            ));
        }
        Ok(results)
    }

    /// Close every generator. A failing close is logged and does not stop the others.
    pub fn close(&self) {
        for generator in &self.generators {
            if let Err(err) = generator.close() {
                warn!(generator = generator.name(), error = %err, "failed to close load generator");
            }
        }
    }

    pub fn generators(&self) -> &[Arc<dyn LoadGenerator>] {
        &self.generators
    }

    pub fn processes(&self) -> Vec<ProcessHandle> {
        self.generators.iter().flat_map(|g| g.processes()).collect()
    }
}
