//! Error types for every layer of the service.
//!
//! Component errors stay narrow (`WorkspaceError`, `WorkerError`,
//! `InvokeError`); the orchestrator folds them into `OperationError`, which
//! knows how it should be presented to a client.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace not found: {0}")]
    NotFound(String),

    #[error("invalid workspace id: {0:?}")]
    InvalidId(String),

    #[error("workspace {0} has been disposed")]
    Disposed(String),

    #[error("path escapes the workspace output directory: {0}")]
    PermissionDenied(String),

    #[error("dependency resolution failed ({exit_code}): {output}")]
    ProvisionFailed { exit_code: i32, output: String },

    #[error("failed to generate manifest: {0}")]
    Manifest(#[from] toml::ser::Error),

    #[error("dependency resolver could not run: {0}")]
    Resolver(#[source] InvokeError),

    #[error("workspace I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker pool has been shut down")]
    ShutDown,

    #[error("no worker available: {0}")]
    Unavailable(String),

    #[error("worker crashed: {0}")]
    Crashed(String),

    #[error("worker did not answer within {0:?}")]
    TimedOut(Duration),

    #[error("worker protocol desync: expected response {expected}, got {actual}")]
    Desync { expected: u64, actual: u64 },
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("working directory does not exist: {}", .0.display())]
    InvalidWorkingDirectory(PathBuf),

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    #[error("I/O error while running {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure of a client-facing operation.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unsupported import: {0}")]
    UnsupportedImport(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("toolchain rejected the request ({exit_code}): {message}")]
    ToolFailed { exit_code: i32, message: String },

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("{operation} did not finish within {limit:?}")]
    TimedOut {
        operation: &'static str,
        limit: Duration,
    },

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error(transparent)]
    Workspace(WorkspaceError),

    #[error("malformed tool output: {0}")]
    MalformedOutput(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<WorkspaceError> for OperationError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::PermissionDenied(path) => OperationError::PermissionDenied(path),
            WorkspaceError::NotFound(id) => OperationError::NotFound(id),
            // The session ended while this request was waiting on it.
            WorkspaceError::Disposed(id) => OperationError::NotFound(id),
            WorkspaceError::InvalidId(id) => {
                OperationError::BadRequest(format!("invalid session id: {id:?}"))
            }
            other => OperationError::Workspace(other),
        }
    }
}

impl OperationError {
    /// Errors caused by the request itself. These never trigger a restart.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            OperationError::BadRequest(_)
                | OperationError::UnsupportedImport(_)
                | OperationError::ToolFailed { .. }
                | OperationError::PermissionDenied(_)
                | OperationError::NotFound(_)
        )
    }

    pub fn status_code(&self) -> u16 {
        match self {
            OperationError::BadRequest(_)
            | OperationError::UnsupportedImport(_)
            | OperationError::ToolFailed { .. } => 400,
            OperationError::PermissionDenied(_) => 403,
            OperationError::NotFound(_) => 404,
            OperationError::ShuttingDown
            | OperationError::Worker(WorkerError::ShutDown)
            | OperationError::Worker(WorkerError::Unavailable(_)) => 503,
            _ => 500,
        }
    }

    /// Text safe to show to a client. Server-side failures get a generic
    /// message; the details are only logged.
    pub fn client_message(&self) -> String {
        if self.is_client_error() {
            return self.to_string();
        }
        match self.status_code() {
            503 => "Service temporarily unavailable".to_string(),
            _ => "Internal server error".to_string(),
        }
    }

    /// Whether the orchestrator should tear down and rebuild the worker pool.
    pub fn triggers_restart(&self) -> bool {
        !self.is_client_error()
            && !matches!(
                self,
                OperationError::ShuttingDown | OperationError::Worker(WorkerError::ShutDown)
            )
    }
}
