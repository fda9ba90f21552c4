// padserve library
// Session, workspace and worker orchestration for an external code toolchain

// Components
pub mod cache;
pub mod invoker;
pub mod worker;
pub mod workspace;

// Orchestration and its request/response types
pub mod imports;
pub mod orchestrator;
pub mod protocol;

// Ambient
pub mod config;
pub mod error;
pub mod logging;
pub mod path_safety;

// Re-export commonly used types
pub use cache::{InMemoryCache, RemoteCache, ResultCache};
pub use config::ServiceConfig;
pub use error::{InvokeError, OperationError, WorkerError, WorkspaceError};
pub use orchestrator::{Orchestrator, ServiceStats, SessionInfo};
pub use protocol::{
    AnalysisIssue, AnalysisResults, CompileOutcome, CompiledArtifact, SourceRequest, VersionInfo,
};
