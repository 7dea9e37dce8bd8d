use crate::cancel::CancelSignal;
use crate::error::Result;
use crate::load::{start_load, FanoutOptions, LoadSession, ProcessHandle, ToolResult};
use crate::runner::metadata::collect_metadata;
use crate::runner::server::Server;
use crate::runner::RunOptions;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// The load phase of a run, driven against a started [`Server`].
pub struct Client {
    metadata: Map<String, Value>,
    session: Arc<LoadSession>,
    cancel: CancelSignal,
    listener: JoinHandle<()>,
}

impl Client {
    /// Resolve the test's requests and launch the load. `None` when the run
    /// was cancelled before the client could start.
    pub async fn start(options: &RunOptions, server: &Server, cancel: &CancelSignal) -> Result<Option<Self>> {
        if cancel.is_cancelled() {
            debug!("run cancelled before the client started");
            return Ok(None);
        }

        let requests = options.test.requests().await?;
        let generators = options.load.build(server.url(), cancel)?;
        let names: Vec<Value> = generators
            .iter()
            .map(|g| Value::String(g.name().to_string()))
            .collect();
        info!(
            requests = requests.len(),
            generators = generators.len(),
            url = server.url(),
            "starting load"
        );

        let session = Arc::new(start_load(
            requests,
            generators,
            FanoutOptions {
                parallel: options.load.parallel,
            },
        )?);

        let listener = {
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                session.close();
            })
        };

        let mut metadata = collect_metadata();
        metadata.insert("loadGenerators".to_string(), Value::Array(names));
        metadata.insert("parallel".to_string(), Value::Bool(options.load.parallel));

        Ok(Some(Self {
            metadata,
            session,
            cancel: cancel.clone(),
            listener,
        }))
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub async fn results(&self) -> Result<Vec<ToolResult>> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(self.cancel.error()),
            results = self.session.results() => results,
        }
    }

    pub fn close(&self) {
        self.session.close();
    }

    pub fn processes(&self) -> Vec<ProcessHandle> {
        self.session.processes()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
