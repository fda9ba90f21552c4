use super::protocol::{read_frame, write_frame, WorkerRequest, WorkerResponse};
use crate::error::WorkerError;
use crate::logging::WORKER_STDERR_TARGET;
use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How to start a worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
}

/// One long-lived worker subprocess. At most one request is in flight; the
/// pool guarantees exclusive access through `&mut self`.
pub struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    stderr_task: Option<JoinHandle<()>>,
    next_id: u64,
    pid: Option<u32>,
    request_timeout: Duration,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.pid)
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl WorkerProcess {
    pub fn spawn(spec: &WorkerSpec) -> Result<Self> {
        info!("Spawning worker: {} {:?}", spec.program.display(), spec.args);

        let mut command = Command::new(&spec.program);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        let mut child = command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {}", spec.program.display(), e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to get worker stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to get worker stdout"))?;
        let pid = child.id();

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            warn!(target: WORKER_STDERR_TARGET, pid = pid.unwrap_or(0), "{}", line)
                        }
                        Ok(None) => {
                            debug!(target: WORKER_STDERR_TARGET, "Worker stderr EOF");
                            break;
                        }
                        Err(e) => {
                            debug!(target: WORKER_STDERR_TARGET, "Error reading worker stderr: {}", e);
                            break;
                        }
                    }
                }
            })
        });

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            stderr_task,
            next_id: 1,
            pid,
            request_timeout: spec.request_timeout,
            shutdown_timeout: spec.shutdown_timeout,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Send one request and wait for its response.
    ///
    /// A non-zero `exit_code` in the response is a normal answer. Errors are
    /// process-level only: the worker died, stalled, or answered out of order.
    pub async fn request(&mut self, arguments: Vec<String>) -> Result<WorkerResponse, WorkerError> {
        let id = self.next_id;
        self.next_id += 1;

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| WorkerError::Crashed("worker stdin already closed".to_string()))?;
        let request = WorkerRequest { id, arguments };
        write_frame(stdin, &request)
            .await
            .map_err(|e| WorkerError::Crashed(format!("write to worker failed: {e}")))?;

        let response: WorkerResponse =
            match tokio::time::timeout(self.request_timeout, read_frame(&mut self.stdout)).await {
                Ok(Ok(Some(response))) => response,
                Ok(Ok(None)) => {
                    return Err(WorkerError::Crashed(
                        "worker closed its output mid-request".to_string(),
                    ))
                }
                Ok(Err(e)) => {
                    return Err(WorkerError::Crashed(format!(
                        "unreadable worker response: {e}"
                    )))
                }
                Err(_) => return Err(WorkerError::TimedOut(self.request_timeout)),
            };

        if response.id != id {
            return Err(WorkerError::Desync {
                expected: id,
                actual: response.id,
            });
        }
        Ok(response)
    }

    /// Close stdin so the worker can exit on its own, then force-kill it if
    /// it has not gone away within the shutdown timeout.
    pub async fn shutdown(mut self) {
        debug!("Shutting down worker {:?}", self.pid);
        drop(self.stdin.take());

        match tokio::time::timeout(self.shutdown_timeout, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Worker {:?} exited with {}", self.pid, status),
            Ok(Err(e)) => warn!("Waiting for worker {:?} failed: {}", self.pid, e),
            Err(_) => {
                warn!(
                    "Worker {:?} did not exit within {:?}, killing",
                    self.pid, self.shutdown_timeout
                );
                self.kill().await;
            }
        }
    }

    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Failed to kill worker {:?}: {}", self.pid, e);
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Some(handle) = self.stderr_task.take() {
            handle.abort();
        }
        // kill_on_drop reaps the child itself
    }
}
