//! The server-under-test: one supervised child process (a native server or
//! a `docker run` client), its readiness wait, its artifacts and teardown.

use crate::cancel::CancelSignal;
use crate::error::{ExpfError, Result};
use crate::load::process::interrupt;
use crate::runner::artifacts::{Artifact, ResultLayout};
use crate::runner::readiness::MarkerScanner;
use crate::runner::state::{RunnerState, StateCell};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch, OnceCell};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const ABORT_GRACE: Duration = Duration::from_secs(2);
const CLOSE_GRACE: Duration = Duration::from_secs(10);
const KILL_WAIT: Duration = Duration::from_secs(5);
const CAPTURED_OUTPUT_PATH: &str = "<captured stdout+stderr>";

/// How to start a server and what to expect from it.
#[derive(Debug, Clone)]
pub struct ServerLaunch {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub marker: String,
    pub ready_timeout: Duration,
    pub url: String,
    pub metadata: Map<String, Value>,
    pub layout: Option<ResultLayout>,
    /// Report captured stdout+stderr as the `output` artifact.
    pub capture_output: bool,
    /// Container stopped with `docker kill` on force-kill.
    pub container: Option<String>,
}

impl ServerLaunch {
    pub fn new(program: impl Into<String>, marker: impl Into<String>, ready_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            marker: marker.into(),
            ready_timeout,
            url: "http://localhost:3000/".to_string(),
            metadata: Map::new(),
            layout: None,
            capture_output: false,
            container: None,
        }
    }

    pub fn command_line(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(self.args.iter()))
    }
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Interrupt,
    Kill,
}

/// Exit observed by the supervisor: `None` while running, then the exit code.
type ExitState = Option<Option<i32>>;

/// A started server-under-test.
#[derive(Debug)]
pub struct Server {
    program: String,
    pid: Option<u32>,
    url: String,
    state: StateCell,
    cancel: CancelSignal,
    metadata: Mutex<Map<String, Value>>,
    output: Arc<Mutex<String>>,
    layout: Option<ResultLayout>,
    capture_output: bool,
    control: mpsc::UnboundedSender<Control>,
    exited: watch::Receiver<ExitState>,
    closed: OnceCell<()>,
}

impl Server {
    /// Spawn the server and resolve once its readiness marker is seen.
    pub async fn launch(launch: ServerLaunch, state: StateCell, cancel: CancelSignal) -> Result<Self> {
        if cancel.is_cancelled() {
            state.transition(RunnerState::Aborted);
            return Err(cancel.error());
        }

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &launch.cwd {
            command.current_dir(cwd);
        }
        command.envs(launch.env.iter().map(|(k, v)| (k, v)));

        info!(command = %launch.command_line(), marker = %launch.marker, "starting server");
        let mut child = command.spawn().map_err(|e| {
            state.transition(RunnerState::Aborted);
            ExpfError::ServerSpawnFailed {
                program: launch.program.clone(),
                message: e.to_string(),
            }
        })?;
        let pid = child.id();

        let output = Arc::new(Mutex::new(String::new()));
        let (ready_tx, mut ready_rx) = oneshot::channel();
        if let Some(stdout) = child.stdout.take() {
            let scanner = MarkerScanner::new(launch.marker.clone());
            spawn_reader(stdout, Arc::clone(&output), Some((scanner, ready_tx)));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, Arc::clone(&output), None);
        }

        let (control, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exited) = watch::channel(None);
        tokio::spawn(supervise(child, control_rx, exit_tx, launch.container.clone()));
        tokio::spawn(abort_on_cancel(
            cancel.clone(),
            state.clone(),
            control.clone(),
            exited.clone(),
        ));

        let server = Self {
            program: launch.program.clone(),
            pid,
            url: launch.url,
            state: state.clone(),
            cancel: cancel.clone(),
            metadata: Mutex::new(launch.metadata),
            output,
            layout: launch.layout,
            capture_output: launch.capture_output,
            control,
            exited,
            closed: OnceCell::new(),
        };

        let mut exited = server.exited.clone();
        tokio::select! {
            biased;
            Ok(()) = &mut ready_rx => {
                state.transition(RunnerState::Started);
                info!(pid = ?pid, url = %server.url, "server ready");
                Ok(server)
            }
            _ = cancel.cancelled() => {
                state.transition(RunnerState::Aborted);
                Err(cancel.error())
            }
            code = wait_exit(&mut exited) => {
                state.transition(RunnerState::Aborted);
                Err(ExpfError::ServerExited { code, output: server.output() })
            }
            _ = sleep(launch.ready_timeout) => {
                warn!(timeout = ?launch.ready_timeout, "server never became ready, killing it");
                state.transition(RunnerState::Aborted);
                server.kill().await;
                Err(ExpfError::ReadinessTimeout {
                    marker: launch.marker,
                    timeout: launch.ready_timeout,
                })
            }
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> RunnerState {
        self.state.get()
    }

    pub fn metadata(&self) -> Map<String, Value> {
        lock(&self.metadata).clone()
    }

    /// Everything the server has written to stdout and stderr so far.
    pub fn output(&self) -> String {
        lock(&self.output).clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.borrow().is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exited.borrow().flatten()
    }

    /// Gather the server's artifacts. Each one is read independently; a
    /// metadata artifact is merged into [`Server::metadata`].
    pub async fn results(&self) -> Result<IndexMap<String, Artifact>> {
        if self.cancel.is_cancelled() {
            return Err(self.cancel.error());
        }

        let collect = async {
            let mut artifacts = match &self.layout {
                Some(layout) => layout.collect().await,
                None => IndexMap::new(),
            };

            if let Some(metadata) = artifacts.shift_remove("metadata") {
                let mut merged = lock(&self.metadata);
                match metadata {
                    Artifact::Json {
                        content: Value::Object(fields),
                        ..
                    } => merged.extend(fields),
                    Artifact::Error { message, .. } => {
                        merged.insert("error".to_string(), Value::String(message));
                    }
                    _ => {
                        merged.insert(
                            "error".to_string(),
                            Value::String("metadata is not a JSON object".to_string()),
                        );
                    }
                }
            }

            let file_output = artifacts.get("output").is_some_and(|a| !a.is_error());
            if self.capture_output && !file_output {
                artifacts.insert(
                    "output".to_string(),
                    Artifact::Text {
                        path: PathBuf::from(CAPTURED_OUTPUT_PATH),
                        content: self.output(),
                    },
                );
            }
            artifacts
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(self.cancel.error()),
            artifacts = collect => Ok(artifacts),
        }
    }

    /// Interrupt the server and wait for it to exit. Safe to call repeatedly.
    pub async fn close(&self) -> Result<()> {
        self.closed
            .get_or_init(|| async {
                let mut exited = self.exited.clone();
                self.state.transition(RunnerState::Closing);

                if !self.has_exited() {
                    debug!(program = %self.program, pid = ?self.pid, "closing server");
                    let _ = self.control.send(Control::Interrupt);
                    if timeout(CLOSE_GRACE, wait_exit(&mut exited)).await.is_err() {
                        warn!(grace = ?CLOSE_GRACE, "server ignored interrupt, killing it");
                        self.kill().await;
                    }
                }

                self.state.transition(RunnerState::Stopped);
                info!(program = %self.program, code = ?self.exit_code(), "server stopped");
            })
            .await;
        Ok(())
    }

    /// Force-kill and wait (bounded) for the exit to be observed.
    pub async fn kill(&self) {
        let _ = self.control.send(Control::Kill);
        let mut exited = self.exited.clone();
        if timeout(KILL_WAIT, wait_exit(&mut exited)).await.is_err() {
            warn!(program = %self.program, "server did not exit after kill");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // A cancelled run is torn down by the abort listener.
        if !self.has_exited() && !self.cancel.is_cancelled() {
            let _ = self.control.send(Control::Kill);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn wait_exit(exited: &mut watch::Receiver<ExitState>) -> Option<i32> {
    let seen = exited
        .wait_for(|state| state.is_some())
        .await
        .map(|state| state.flatten())
        .ok();
    match seen {
        Some(code) => code,
        None => exited.borrow().flatten(),
    }
}

fn spawn_reader<R>(
    mut reader: R,
    output: Arc<Mutex<String>>,
    mut readiness: Option<(MarkerScanner, oneshot::Sender<()>)>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let chunk = String::from_utf8_lossy(&buf[..n]);
            lock(&output).push_str(&chunk);
            for line in chunk.lines().filter(|l| !l.trim().is_empty()) {
                info!(target: "expf::server", "{}", line);
            }

            let seen = readiness
                .as_mut()
                .is_some_and(|(scanner, _)| scanner.feed(&chunk));
            if seen {
                if let Some((_, tx)) = readiness.take() {
                    let _ = tx.send(());
                }
            }
        }
    });
}

async fn supervise(
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<Control>,
    exit_tx: watch::Sender<ExitState>,
    container: Option<String>,
) {
    let mut open = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            message = control.recv(), if open => match message {
                Some(Control::Interrupt) => {
                    if let Err(err) = interrupt(&mut child) {
                        warn!(error = %err, "failed to interrupt server");
                    }
                }
                Some(Control::Kill) => {
                    let _ = child.start_kill();
                    if let Some(name) = &container {
                        docker_kill(name).await;
                    }
                }
                None => open = false,
            },
        }
    };

    let code = status.ok().and_then(|s| s.code());
    debug!(code = ?code, "server exited");
    let _ = exit_tx.send(Some(code));
}

async fn abort_on_cancel(
    cancel: CancelSignal,
    state: StateCell,
    control: mpsc::UnboundedSender<Control>,
    mut exited: watch::Receiver<ExitState>,
) {
    tokio::select! {
        _ = wait_exit(&mut exited) => return,
        _ = cancel.cancelled() => {}
    }

    state.transition(RunnerState::Aborted);
    info!(reason = %cancel.reason(), "aborting server");
    let _ = control.send(Control::Interrupt);
    if timeout(ABORT_GRACE, wait_exit(&mut exited)).await.is_err() {
        let _ = control.send(Control::Kill);
    }
}

async fn docker_kill(name: &str) {
    let outcome = Command::new("docker")
        .args(["kill", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(err) = outcome {
        warn!(container = name, error = %err, "docker kill failed");
    }
}
