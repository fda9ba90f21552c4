//! One subprocess per call: arguments in, exit code and captured output out.

use crate::error::InvokeError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// A full command invocation (cwd + program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub cwd: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(cwd: &Path, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            program: program.into(),
            args,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('\t') {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// A configured tool: fixed program and leading arguments, per-call extras.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandTemplate {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn to_spec<I, S>(&self, cwd: &Path, extra_args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = self.args.clone();
        args.extend(extra_args.into_iter().map(Into::into));
        CommandSpec::new(cwd, self.program.clone(), args)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationOutput {
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl InvocationOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined, the way tool errors are reported to clients.
    pub fn combined(&self) -> String {
        let mut s = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !s.is_empty() && !s.ends_with('\n') {
                s.push('\n');
            }
            s.push_str(&self.stderr);
        }
        s
    }
}

#[derive(Debug, Clone, Default)]
pub struct Invoker {
    default_timeout: Option<Duration>,
}

impl Invoker {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self { default_timeout }
    }

    /// Run `spec` to completion. A timeout kills the process (and its process
    /// group on unix) and fails the call; there is no retry.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<InvocationOutput, InvokeError> {
        if !spec.cwd.is_dir() {
            return Err(InvokeError::InvalidWorkingDirectory(spec.cwd.clone()));
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        debug!("Running `{}` in {}", spec, spec.cwd.display());
        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| InvokeError::Spawn {
            command: spec.to_string(),
            source,
        })?;

        let stdout_task = child.stdout.take().map(|mut stdout| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                stdout.read_to_end(&mut buf).await.map(|_| buf)
            })
        });
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                stderr.read_to_end(&mut buf).await.map(|_| buf)
            })
        });

        let status = match timeout.or(self.default_timeout) {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!("`{}` timed out after {:?}, killing", spec, limit);
                    kill_process_tree(&mut child).await;
                    if let Some(task) = stdout_task {
                        task.abort();
                    }
                    if let Some(task) = stderr_task {
                        task.abort();
                    }
                    return Err(InvokeError::TimedOut {
                        command: spec.to_string(),
                        timeout: limit,
                    });
                }
            },
            None => child.wait().await,
        }
        .map_err(|source| InvokeError::Io {
            command: spec.to_string(),
            source,
        })?;

        let stdout = collect_stream(stdout_task, spec).await?;
        let stderr = collect_stream(stderr_task, spec).await?;

        let exit_code = status.code().unwrap_or(-1);
        debug!(
            "`{}` exited with {} in {:?}",
            spec,
            exit_code,
            started.elapsed()
        );

        Ok(InvocationOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

async fn collect_stream(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
    spec: &CommandSpec,
) -> Result<String, InvokeError> {
    let Some(task) = task else {
        return Ok(String::new());
    };
    let bytes = task
        .await
        .map_err(|e| InvokeError::Io {
            command: spec.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?
        .map_err(|source| InvokeError::Io {
            command: spec.to_string(),
            source,
        })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn kill_process_tree(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child leads its own process group; take helpers down with it.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    if let Err(e) = child.kill().await {
        debug!("kill after timeout failed: {}", e);
    }
}
