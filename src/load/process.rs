//! Spawning and tracking external load-generator processes.

use crate::cancel::CancelSignal;
use crate::error::{ExpfError, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessStatus {
    NotStarted,
    Running,
    Closing,
    Exited,
}

/// Snapshot of one spawned process. Only status and accumulated output
/// leave the component owning the child.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessHandle {
    pub executable: String,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessHandle {
    pub fn is_live(&self) -> bool {
        matches!(self.status, ProcessStatus::Running | ProcessStatus::Closing)
    }
}

#[derive(Debug)]
struct TrackedProcess {
    handle: Mutex<ProcessHandle>,
    interrupt: Notify,
}

impl TrackedProcess {
    fn lock(&self) -> MutexGuard<'_, ProcessHandle> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(&self, stream: Stream, chunk: &str) {
        let mut handle = self.lock();
        match stream {
            Stream::Stdout => handle.stdout.push_str(chunk),
            Stream::Stderr => handle.stderr.push_str(chunk),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Processes spawned by one adapter. Appended to on spawn, read by `close()`.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    processes: Arc<Mutex<Vec<Arc<TrackedProcess>>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, executable: &str) -> Arc<TrackedProcess> {
        let tracked = Arc::new(TrackedProcess {
            handle: Mutex::new(ProcessHandle {
                executable: executable.to_string(),
                pid: None,
                status: ProcessStatus::NotStarted,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
            }),
            interrupt: Notify::new(),
        });
        self.guard().push(Arc::clone(&tracked));
        tracked
    }

    fn guard(&self) -> MutexGuard<'_, Vec<Arc<TrackedProcess>>> {
        self.processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Vec<ProcessHandle> {
        self.guard().iter().map(|p| p.lock().clone()).collect()
    }

    /// Number of processes that have been spawned and not yet observed to exit.
    pub fn running(&self) -> usize {
        self.snapshot().iter().filter(|h| h.is_live()).count()
    }

    /// Ask every live process to stop. Does not wait for exit.
    pub fn interrupt_all(&self) {
        for process in self.guard().iter() {
            let live = {
                let mut handle = process.lock();
                if handle.is_live() || handle.status == ProcessStatus::NotStarted {
                    if handle.status == ProcessStatus::Running {
                        handle.status = ProcessStatus::Closing;
                    }
                    true
                } else {
                    false
                }
            };
            if live {
                process.interrupt.notify_one();
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Resolve the platform-specific executable for an npm-installed tool.
pub fn platform_executable(name: &str) -> String {
    if cfg!(windows) {
        format!("{}.cmd", name)
    } else {
        name.to_string()
    }
}

/// One invocation of an external tool: `program... args... [trailing]`.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    name: String,
    program: Vec<String>,
    args: Vec<String>,
    trailing: Option<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl ToolCommand {
    /// `program` is the executable optionally followed by leading arguments
    /// (for example `["sh", "fake-tool.sh"]`). `name` is used in errors.
    pub fn new(name: impl Into<String>, program: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program,
            args: Vec::new(),
            trailing: None,
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn trailing(mut self, positional: impl Into<String>) -> Self {
        self.trailing = Some(positional.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn argv(&self) -> Vec<String> {
        self.program
            .iter()
            .chain(self.args.iter())
            .chain(self.trailing.iter())
            .cloned()
            .collect()
    }

    /// The invocation as one shell-escaped command line.
    pub fn command_line(&self) -> String {
        shell_words::join(self.argv())
    }

    /// Spawn, track in `registry`, and resolve with the captured output once
    /// the process exits with code 0.
    pub async fn run(
        &self,
        registry: &ProcessRegistry,
        cancel: &CancelSignal,
    ) -> Result<CapturedOutput> {
        let argv = self.argv();
        let (program, args) = argv.split_first().ok_or_else(|| {
            ExpfError::InvalidOptions(format!("no executable configured for {}", self.name))
        })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command.envs(self.env.iter().map(|(k, v)| (k, v)));

        let tracked = registry.track(&self.name);
        debug!(tool = %self.name, command = %self.command_line(), "spawning");

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let mut handle = tracked.lock();
                handle.status = ProcessStatus::Exited;
                return Err(ExpfError::ToolSpawnFailed {
                    executable: self.name.clone(),
                    message: err.to_string(),
                    stdout: handle.stdout.clone(),
                    stderr: handle.stderr.clone(),
                });
            }
        };

        {
            let mut handle = tracked.lock();
            handle.pid = child.id();
            if handle.status == ProcessStatus::NotStarted {
                handle.status = ProcessStatus::Running;
            }
        }

        let stdout = child
            .stdout
            .take()
            .map(|out| spawn_reader(out, Arc::clone(&tracked), Stream::Stdout));
        let stderr = child
            .stderr
            .take()
            .map(|err| spawn_reader(err, Arc::clone(&tracked), Stream::Stderr));

        let mut killed = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = tracked.interrupt.notified() => {
                    debug!(tool = %self.name, pid = ?child.id(), "interrupting");
                    if let Err(err) = interrupt(&mut child) {
                        warn!(tool = %self.name, error = %err, "failed to interrupt process");
                    }
                }
                _ = cancel.cancelled(), if !killed => {
                    killed = true;
                    debug!(tool = %self.name, pid = ?child.id(), "cancelled, killing");
                    let _ = child.start_kill();
                }
            }
        };

        drain(stdout).await;
        drain(stderr).await;

        let output = {
            let mut handle = tracked.lock();
            handle.status = ProcessStatus::Exited;
            handle.exit_code = status.as_ref().ok().and_then(|s| s.code());
            CapturedOutput {
                stdout: handle.stdout.clone(),
                stderr: handle.stderr.clone(),
            }
        };

        let status = status.map_err(|e| ExpfError::io(format!("waiting for {}", self.name), e))?;
        if killed || cancel.is_cancelled() {
            return Err(cancel.error());
        }
        if !status.success() {
            return Err(ExpfError::ToolExecutionFailed {
                executable: self.name.clone(),
                code: status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        debug!(tool = %self.name, stdout_bytes = output.stdout.len(), "exited");
        Ok(output)
    }
}

fn spawn_reader<R>(mut reader: R, tracked: Arc<TrackedProcess>, stream: Stream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => tracked.append(stream, &String::from_utf8_lossy(&buf[..n])),
            }
        }
    })
}

async fn drain(reader: Option<JoinHandle<()>>) {
    if let Some(reader) = reader {
        if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
            warn!("output reader did not finish within {:?}", DRAIN_TIMEOUT);
        }
    }
}

/// Deliver SIGINT on Unix. Elsewhere an interrupt degrades to a kill.
#[cfg(unix)]
pub(crate) fn interrupt(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGINT).map_err(std::io::Error::from),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
pub(crate) fn interrupt(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}
