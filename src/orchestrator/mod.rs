//! Session and operation orchestration.
//!
//! The `Orchestrator` owns every long-lived component: the session table,
//! the workspace store, the worker pool, the one-shot invoker and the
//! result cache. Each client operation runs through the same pipeline:
//! admit, resolve the session workspace, check the cache (compiles only),
//! provision, dispatch, write through. A non-client failure restarts the
//! worker pool so later requests start from a clean state.

pub mod session;
pub mod stats;

pub use session::{SessionInfo, SessionRegistry};
pub use stats::{OperationSnapshot, OperationStats, ServiceStats};

use crate::cache::{self, CacheKey, ResultCache};
use crate::config::{resolve_executable, ServiceConfig};
use crate::error::{OperationError, WorkerError, WorkspaceError};
use crate::imports::{parse_imports, required_dependencies, unapproved_imports, ImportDirective};
use crate::invoker::{CommandTemplate, Invoker};
use crate::protocol::{
    AnalysisIssue, AnalysisResults, AssistsResponse, CompileOutcome, CompleteResponse,
    CompiledArtifact, DocumentResponse, FixesResponse, FormatResponse, IssueKind, SourceRequest,
    ToolFailure, ToolVerb, VersionInfo,
};
use crate::worker::{WorkerPool, WorkerResponse, WorkerSpec};
use crate::workspace::{Workspace, WorkspaceStore};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use stats::OperationRecord;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const OUTPUT_FILE: &str = "main.js";
const SOURCE_MAP_FILE: &str = "main.js.map";

/// Slack between an operation's budget and the hard stop around it, so a
/// tool timeout inside the budget fires and cleans up first.
const DEADLINE_GRACE: Duration = Duration::from_millis(500);

/// Wall-clock budget of one operation. Tool invocations are capped at what
/// is left of it.
#[derive(Debug, Clone, Copy)]
struct Deadline(tokio::time::Instant);

impl Deadline {
    fn after(limit: Duration) -> Self {
        Self(tokio::time::Instant::now() + limit)
    }

    fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(tokio::time::Instant::now())
    }
}

/// Counts an admitted operation until dropped.
struct InFlight<'a> {
    count: &'a AtomicUsize,
    drained: &'a Notify,
}

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize, drained: &'a Notify) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self { count, drained }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Output size reported to the operation statistics.
trait OperationOutput {
    fn output_bytes(&self) -> Option<u64> {
        None
    }
}

impl OperationOutput for AnalysisResults {}
impl OperationOutput for CompleteResponse {}
impl OperationOutput for FixesResponse {}
impl OperationOutput for AssistsResponse {}
impl OperationOutput for DocumentResponse {}

impl OperationOutput for FormatResponse {
    fn output_bytes(&self) -> Option<u64> {
        Some(self.new_string.len() as u64)
    }
}

impl OperationOutput for CompileOutcome {
    fn output_bytes(&self) -> Option<u64> {
        self.artifact().map(|artifact| artifact.output.len() as u64)
    }
}

/// Extra data the modular back-end reports next to its artifact.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModularCompileReport {
    #[serde(default)]
    modules_base_url: Option<String>,
}

pub struct Orchestrator {
    config: ServiceConfig,
    store: WorkspaceStore,
    sessions: SessionRegistry,
    worker_spec: WorkerSpec,
    pool: RwLock<Arc<WorkerPool>>,
    restart_lock: Mutex<()>,
    restarts: AtomicU64,
    compiler: CommandTemplate,
    invoker: Invoker,
    cache: Arc<dyn ResultCache>,
    pending_writes: StdMutex<Vec<JoinHandle<()>>>,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    stats: OperationStats,
}

impl Orchestrator {
    /// Build every component from `config`, with the cache backend it
    /// selects, and start the worker pool.
    pub async fn start(config: ServiceConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let cache = cache::from_config(&config)?;
        Self::start_with_cache(config, cache).await
    }

    pub async fn start_with_cache(
        mut config: ServiceConfig,
        cache: Arc<dyn ResultCache>,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.workspace.root)
            .await
            .with_context(|| {
                format!(
                    "failed to create workspace root {}",
                    config.workspace.root.display()
                )
            })?;
        config.workspace.root = tokio::fs::canonicalize(&config.workspace.root).await?;

        let worker_program = resolve_executable(&config.worker.command)?;
        let compiler_program = resolve_executable(&config.compiler.command)?;
        let resolver_program = resolve_executable(&config.resolver.command)?;

        let invoker = Invoker::new(Some(config.operations.timeout()));
        let resolver = CommandTemplate::new(
            resolver_program,
            config.resolver.args.clone(),
            Duration::from_secs(config.resolver.timeout_secs),
        );
        let compiler = CommandTemplate::new(
            compiler_program,
            config.compiler.args.clone(),
            Duration::from_secs(config.compiler.timeout_secs),
        );
        let store = WorkspaceStore::new(
            config.workspace.clone(),
            config.imports.approved_library_prefixes.clone(),
            resolver,
            invoker.clone(),
        );

        let worker_spec = WorkerSpec {
            program: worker_program,
            args: config.worker.args.clone(),
            cwd: Some(config.workspace.root.clone()),
            request_timeout: config.worker.request_timeout(),
            shutdown_timeout: config.worker.shutdown_timeout(),
        };
        let pool = WorkerPool::start(worker_spec.clone(), config.worker.pool_size, 0)?;

        info!(
            "Orchestrator started (workspaces in {}, cache backend {})",
            config.workspace.root.display(),
            cache.name()
        );

        Ok(Self {
            config,
            store,
            sessions: SessionRegistry::new(),
            worker_spec,
            pool: RwLock::new(Arc::new(pool)),
            restart_lock: Mutex::new(()),
            restarts: AtomicU64::new(0),
            compiler,
            invoker,
            cache,
            pending_writes: StdMutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            stats: OperationStats::default(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub async fn pool_generation(&self) -> u64 {
        self.pool.read().await.generation()
    }

    pub async fn worker_pids(&self) -> Vec<Option<u32>> {
        let pool = self.pool.read().await.clone();
        pool.worker_pids().await
    }

    /// The live workspace of a session, if it has one.
    pub fn workspace(&self, session_id: &str) -> Option<Arc<Workspace>> {
        self.store.get(session_id).ok()
    }

    // ---- operations -------------------------------------------------------

    pub async fn analyze(&self, request: &SourceRequest) -> Result<AnalysisResults, OperationError> {
        self.run("analyze", request, |ws, deadline| {
            self.analyze_in(ws, request, deadline)
        })
            .await
    }

    /// Whole-program compile through the one-shot compiler.
    pub async fn compile(&self, request: &SourceRequest) -> Result<CompileOutcome, OperationError> {
        self.run_compile("compile", request, |ws, deadline| {
            self.compile_whole_in(ws, request, deadline)
        })
            .await
    }

    /// Modular compile through the persistent worker.
    pub async fn compile_alt(
        &self,
        request: &SourceRequest,
    ) -> Result<CompileOutcome, OperationError> {
        self.run_compile("compile_alt", request, |ws, deadline| {
            self.compile_modular_in(ws, request, deadline)
        })
        .await
    }

    pub async fn complete(
        &self,
        request: &SourceRequest,
    ) -> Result<CompleteResponse, OperationError> {
        let offset = required_offset(request)?;
        self.run("complete", request, |ws, deadline| {
            self.tool_in(ws, request, ToolVerb::Complete, Some(offset), deadline)
        })
        .await
    }

    pub async fn fixes(&self, request: &SourceRequest) -> Result<FixesResponse, OperationError> {
        let offset = required_offset(request)?;
        self.run("fixes", request, |ws, deadline| {
            self.tool_in(ws, request, ToolVerb::Fixes, Some(offset), deadline)
        })
        .await
    }

    pub async fn assists(&self, request: &SourceRequest) -> Result<AssistsResponse, OperationError> {
        let offset = required_offset(request)?;
        self.run("assists", request, |ws, deadline| {
            self.tool_in(ws, request, ToolVerb::Assists, Some(offset), deadline)
        })
        .await
    }

    pub async fn document(
        &self,
        request: &SourceRequest,
    ) -> Result<DocumentResponse, OperationError> {
        let offset = required_offset(request)?;
        self.run("document", request, |ws, deadline| {
            self.tool_in(ws, request, ToolVerb::Document, Some(offset), deadline)
        })
        .await
    }

    /// Format the snippet. A snippet the formatter rejects comes back
    /// unchanged.
    pub async fn format(&self, request: &SourceRequest) -> Result<FormatResponse, OperationError> {
        let offset = optional_offset(request)?;
        self.run("format", request, |ws, _| self.format_in(ws, request, offset))
            .await
    }

    pub fn version(&self) -> VersionInfo {
        let versions = &self.config.versions;
        VersionInfo {
            service_version: versions.service.clone(),
            toolchain_version: versions.toolchain.clone(),
            runtime_version: versions.runtime.clone(),
            supported_packages: self.config.imports.supported_packages.clone(),
        }
    }

    // ---- sessions ---------------------------------------------------------

    pub fn issue_session_id(&self) -> String {
        SessionRegistry::issue_id()
    }

    /// Forget a session and delete its workspace.
    pub async fn end_session(&self, session_id: &str) -> Result<(), OperationError> {
        let session_id = SessionRegistry::parse_id(Some(session_id))?;
        let known = self.sessions.remove(session_id).is_some();
        match self.store.dispose(session_id).await {
            Ok(()) => {
                info!("Session {} ended", session_id);
                Ok(())
            }
            Err(WorkspaceError::NotFound(_)) if known => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list()
    }

    /// Read a compiled artifact from the session's output folder.
    pub async fn read_output(
        &self,
        session_id: &str,
        relative_path: &str,
    ) -> Result<Vec<u8>, OperationError> {
        let _in_flight = self.enter()?;
        let session_id = SessionRegistry::parse_id(Some(session_id))?;
        let workspace = self.store.get(session_id)?;
        // Refuse escapes before waiting on anything.
        workspace.resolve_output(relative_path)?;
        let _guard = workspace.lock_operations().await;
        Ok(workspace.read_output(relative_path).await?)
    }

    pub async fn stats(&self) -> ServiceStats {
        let pool = self.pool.read().await.clone();
        ServiceStats::new(
            self.stats.snapshot(),
            pool.stats(),
            self.restarts.load(Ordering::Relaxed),
            self.sessions.list().len(),
            self.cache.name(),
        )
    }

    // ---- lifecycle --------------------------------------------------------

    /// Wait for every cache write started so far.
    pub async fn flush_cache_writes(&self) {
        let pending: Vec<JoinHandle<()>> = match self.pending_writes.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => return,
        };
        for result in futures::future::join_all(pending).await {
            if let Err(e) = result {
                warn!("Cache write task failed: {}", e);
            }
        }
    }

    /// Stop accepting operations, wait for admitted ones, terminate the
    /// workers, flush and close the cache, then remove every workspace.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Orchestrator shutting down");

        let drain_limit = self.config.operations.timeout() + DEADLINE_GRACE;
        if tokio::time::timeout(drain_limit, self.drain_in_flight())
            .await
            .is_err()
        {
            warn!(
                "{} operations still running after {:?}",
                self.in_flight.load(Ordering::SeqCst),
                drain_limit
            );
        }

        let pool = self.pool.read().await.clone();
        pool.shutdown().await;

        self.flush_cache_writes().await;
        self.cache.shutdown().await;

        self.store.dispose_all().await;
        self.sessions.clear();
        info!("Orchestrator shut down");
    }

    // ---- pipeline ---------------------------------------------------------

    /// Register an operation. Counted before the accepting check so that
    /// `shutdown` either sees it or it sees the shutdown.
    fn enter(&self) -> Result<InFlight<'_>, OperationError> {
        let in_flight = InFlight::enter(&self.in_flight, &self.drained);
        if !self.is_accepting() {
            return Err(OperationError::ShuttingDown);
        }
        Ok(in_flight)
    }

    async fn drain_in_flight(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    fn admit<'r>(
        &self,
        request: &'r SourceRequest,
    ) -> Result<(&'r str, InFlight<'_>), OperationError> {
        let in_flight = self.enter()?;
        let session_id = SessionRegistry::parse_id(request.session_id.as_deref())?;
        Ok((session_id, in_flight))
    }

    async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        request: &SourceRequest,
        body: F,
    ) -> Result<T, OperationError>
    where
        T: OperationOutput,
        F: FnOnce(Arc<Workspace>, Deadline) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let started = Instant::now();
        let result = match self.admit(request) {
            Ok((session_id, _in_flight)) => self.dispatch(operation, session_id, body).await,
            Err(e) => Err(e),
        };
        self.record(operation, started, &result, false);
        result
    }

    /// Like `run`, with a cache lookup in front and a write-through behind.
    async fn run_compile<F, Fut>(
        &self,
        operation: &'static str,
        request: &SourceRequest,
        body: F,
    ) -> Result<CompileOutcome, OperationError>
    where
        F: FnOnce(Arc<Workspace>, Deadline) -> Fut,
        Fut: Future<Output = Result<CompileOutcome, OperationError>>,
    {
        let started = Instant::now();
        let (session_id, _in_flight) = match self.admit(request) {
            Ok(admitted) => admitted,
            Err(e) => {
                let result = Err(e);
                self.record(operation, started, &result, false);
                return result;
            }
        };

        let key = CacheKey::build(
            operation,
            &[("returnExtra", bool_param(request.return_extra))],
            &request.source,
        );
        if let Some(artifact) = self.cached_artifact(&key).await {
            debug!("Cache hit for {} ({})", operation, key);
            let result = Ok(CompileOutcome::Success(artifact));
            self.record(operation, started, &result, true);
            return result;
        }

        let result = self.dispatch(operation, session_id, body).await;
        if let Ok(CompileOutcome::Success(artifact)) = &result {
            self.write_through(key, artifact);
        }
        self.record(operation, started, &result, false);
        result
    }

    async fn dispatch<T, F, Fut>(
        &self,
        operation: &'static str,
        session_id: &str,
        body: F,
    ) -> Result<T, OperationError>
    where
        F: FnOnce(Arc<Workspace>, Deadline) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let workspace = self.sessions.resolve(&self.store, session_id).await?;
        let generation = self.pool_generation().await;

        let limit = self.config.operations.timeout();
        let deadline = Deadline::after(limit);
        let result = match tokio::time::timeout(
            limit + DEADLINE_GRACE,
            body(workspace.clone(), deadline),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(OperationError::TimedOut { operation, limit }),
        };

        if let Err(e) = &result {
            if e.triggers_restart() && self.is_accepting() {
                error!(
                    "{} failed for session {}: {}; restarting workers",
                    operation, session_id, e
                );
                self.restart(generation, &workspace).await;
            } else {
                debug!("{} rejected for session {}: {}", operation, session_id, e);
            }
        }
        result
    }

    fn record<T: OperationOutput>(
        &self,
        operation: &'static str,
        started: Instant,
        result: &Result<T, OperationError>,
        cache_hit: bool,
    ) {
        let elapsed = started.elapsed();
        let output_bytes = result.as_ref().ok().and_then(|value| value.output_bytes());
        debug!(
            "{} finished in {:?} (ok: {}, cache hit: {}, output bytes: {:?})",
            operation,
            elapsed,
            result.is_ok(),
            cache_hit,
            output_bytes
        );
        self.stats.record(
            operation,
            OperationRecord {
                elapsed,
                success: result.is_ok(),
                cache_hit,
                output_bytes,
            },
        );
    }

    /// Replace the worker pool of `generation` and forget the workspace's
    /// provisioning. Failures seen on a pool that was already replaced do
    /// not restart again.
    async fn restart(&self, generation: u64, workspace: &Workspace) {
        workspace.reset().await;

        let _guard = self.restart_lock.lock().await;
        let current = self.pool.read().await.clone();
        if current.generation() != generation {
            debug!(
                "Worker pool generation {} already replaced by {}",
                generation,
                current.generation()
            );
            return;
        }

        let next = generation + 1;
        match WorkerPool::start(self.worker_spec.clone(), self.config.worker.pool_size, next) {
            Ok(pool) => {
                *self.pool.write().await = Arc::new(pool);
                self.restarts.fetch_add(1, Ordering::Relaxed);
                current.shutdown().await;
                info!("Worker pool restarted as generation {}", next);
            }
            Err(e) => {
                error!("Failed to restart worker pool: {}", e);
            }
        }
    }

    async fn submit(
        &self,
        verb: ToolVerb,
        workspace: &Workspace,
        offset: Option<usize>,
    ) -> Result<WorkerResponse, OperationError> {
        let pool = self.pool.read().await.clone();
        let arguments = verb.arguments(workspace.root(), &workspace.source_path(), offset);
        match pool.submit(arguments).await {
            Ok(response) => Ok(response),
            // The pool was swapped out under this request.
            Err(WorkerError::ShutDown) if self.is_accepting() => Err(WorkerError::Unavailable(
                "worker pool is restarting".to_string(),
            )
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Provision for the snippet's imports. Resolver failures are logged and
    /// the operation continues on an unprovisioned workspace.
    async fn provision_lenient(
        &self,
        workspace: &Workspace,
        dependencies: &BTreeMap<String, String>,
        deadline: Deadline,
    ) -> Result<(), OperationError> {
        match self
            .store
            .provision_within(workspace, dependencies, deadline.remaining())
            .await
        {
            Ok(()) => Ok(()),
            Err(e @ (WorkspaceError::ProvisionFailed { .. } | WorkspaceError::Resolver(_))) => {
                warn!(
                    "Continuing without dependencies in workspace {}: {}",
                    workspace.id(),
                    e
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ---- operation bodies -------------------------------------------------

    async fn analyze_in(
        &self,
        workspace: Arc<Workspace>,
        request: &SourceRequest,
        deadline: Deadline,
    ) -> Result<AnalysisResults, OperationError> {
        let imports = parse_imports(&request.source);
        let dependencies = required_dependencies(&imports, &self.config.imports);

        let _guard = workspace.lock_operations().await;
        workspace.write_source(&request.source).await?;
        self.provision_lenient(&workspace, &dependencies, deadline)
            .await?;

        let response = self.submit(ToolVerb::Analyze, &workspace, None).await?;
        let mut results: AnalysisResults = parse_tool_output(ToolVerb::Analyze, response)?;

        let approved = workspace.approved_imports().await;
        let source_name = workspace.relative_source_path();
        for import in unapproved_imports(&imports, &approved) {
            results.issues.push(AnalysisIssue {
                kind: IssueKind::Error,
                line: import.line,
                message: format!("Unsupported import: '{}'", import.uri),
                source_name: source_name.clone(),
                has_fixes: false,
                char_start: import.char_start,
                char_length: import.char_length,
            });
        }
        results.package_imports = package_names(&imports);
        Ok(results)
    }

    async fn tool_in<T: DeserializeOwned>(
        &self,
        workspace: Arc<Workspace>,
        request: &SourceRequest,
        verb: ToolVerb,
        offset: Option<usize>,
        deadline: Deadline,
    ) -> Result<T, OperationError> {
        let imports = parse_imports(&request.source);
        let dependencies = required_dependencies(&imports, &self.config.imports);

        let _guard = workspace.lock_operations().await;
        workspace.write_source(&request.source).await?;
        self.provision_lenient(&workspace, &dependencies, deadline)
            .await?;

        let response = self.submit(verb, &workspace, offset).await?;
        parse_tool_output(verb, response)
    }

    async fn format_in(
        &self,
        workspace: Arc<Workspace>,
        request: &SourceRequest,
        offset: Option<usize>,
    ) -> Result<FormatResponse, OperationError> {
        let _guard = workspace.lock_operations().await;
        workspace.write_source(&request.source).await?;

        let response = self.submit(ToolVerb::Format, &workspace, offset).await?;
        match parse_tool_output(ToolVerb::Format, response) {
            Err(OperationError::ToolFailed { exit_code, message }) => {
                debug!("Formatter rejected the snippet ({}): {}", exit_code, message);
                Ok(FormatResponse {
                    new_string: request.source.clone(),
                    offset,
                })
            }
            other => other,
        }
    }

    /// Write the snippet, provision it and check its imports. A resolver
    /// rejection becomes a failed compile.
    async fn prepare_compile(
        &self,
        workspace: &Workspace,
        request: &SourceRequest,
        deadline: Deadline,
    ) -> Result<Option<ToolFailure>, OperationError> {
        let imports = parse_imports(&request.source);
        let dependencies = required_dependencies(&imports, &self.config.imports);

        workspace.write_source(&request.source).await?;
        match self
            .store
            .provision_within(workspace, &dependencies, deadline.remaining())
            .await
        {
            Ok(()) => {}
            Err(WorkspaceError::ProvisionFailed { exit_code, output }) => {
                return Ok(Some(ToolFailure {
                    exit_code,
                    message: output,
                }));
            }
            Err(e) => return Err(e.into()),
        }

        let approved = workspace.approved_imports().await;
        if let Some(import) = unapproved_imports(&imports, &approved).first() {
            return Err(OperationError::UnsupportedImport(import.uri.clone()));
        }

        let out_dir = workspace.out_dir();
        remove_stale(&out_dir.join(OUTPUT_FILE)).await?;
        remove_stale(&out_dir.join(SOURCE_MAP_FILE)).await?;
        Ok(None)
    }

    async fn compile_whole_in(
        &self,
        workspace: Arc<Workspace>,
        request: &SourceRequest,
        deadline: Deadline,
    ) -> Result<CompileOutcome, OperationError> {
        let _guard = workspace.lock_operations().await;
        if let Some(failure) = self.prepare_compile(&workspace, request, deadline).await? {
            return Ok(CompileOutcome::Failure(failure));
        }

        let out_dir = workspace.out_dir();
        let mut args = vec![
            "--out".to_string(),
            out_dir.join(OUTPUT_FILE).display().to_string(),
        ];
        if request.return_extra {
            args.push("--source-map".to_string());
        }
        args.push(workspace.source_path().display().to_string());

        let spec = self.compiler.to_spec(workspace.root(), args);
        let limit = self.compiler.timeout.min(deadline.remaining());
        let output = self.invoker.run(&spec, Some(limit)).await?;
        if !output.success() {
            return Ok(CompileOutcome::Failure(ToolFailure {
                exit_code: output.exit_code,
                message: output.combined(),
            }));
        }

        let artifact = read_artifact(&out_dir, request.return_extra, None).await?;
        Ok(CompileOutcome::Success(artifact))
    }

    async fn compile_modular_in(
        &self,
        workspace: Arc<Workspace>,
        request: &SourceRequest,
        deadline: Deadline,
    ) -> Result<CompileOutcome, OperationError> {
        let _guard = workspace.lock_operations().await;
        if let Some(failure) = self.prepare_compile(&workspace, request, deadline).await? {
            return Ok(CompileOutcome::Failure(failure));
        }

        let response = self
            .submit(ToolVerb::CompileModular, &workspace, None)
            .await?;
        if response.exit_code != 0 {
            return Ok(CompileOutcome::Failure(ToolFailure {
                exit_code: response.exit_code,
                message: response.output,
            }));
        }

        let report: ModularCompileReport =
            serde_json::from_str(&response.output).unwrap_or_default();
        let artifact = read_artifact(
            &workspace.out_dir(),
            request.return_extra,
            report.modules_base_url,
        )
        .await?;
        Ok(CompileOutcome::Success(artifact))
    }

    // ---- cache ------------------------------------------------------------

    async fn cached_artifact(&self, key: &CacheKey) -> Option<CompiledArtifact> {
        let value = self.cache.get(key.as_str()).await?;
        match serde_json::from_str(&value) {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                warn!("Dropping unreadable cache entry {}: {}", key, e);
                self.cache.remove(key.as_str()).await;
                None
            }
        }
    }

    /// Store `artifact` in the background; the response does not wait.
    fn write_through(&self, key: CacheKey, artifact: &CompiledArtifact) {
        let value = match serde_json::to_string(artifact) {
            Ok(value) => value,
            Err(e) => {
                warn!("Could not serialize artifact for {}: {}", key, e);
                return;
            }
        };
        let cache = self.cache.clone();
        let expiration = self.config.cache.expiration();
        let task = tokio::spawn(async move {
            cache.set(key.as_str(), &value, Some(expiration)).await;
        });

        if let Ok(mut pending) = self.pending_writes.lock() {
            pending.retain(|handle| !handle.is_finished());
            pending.push(task);
        }
    }
}

fn bool_param(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn check_offset(request: &SourceRequest, offset: usize) -> Result<usize, OperationError> {
    let length = request.source.chars().count();
    if offset > length {
        return Err(OperationError::BadRequest(format!(
            "offset {offset} is past the end of the source ({length} characters)"
        )));
    }
    Ok(offset)
}

fn required_offset(request: &SourceRequest) -> Result<usize, OperationError> {
    let offset = request
        .offset
        .ok_or_else(|| OperationError::BadRequest("missing offset".to_string()))?;
    check_offset(request, offset)
}

fn optional_offset(request: &SourceRequest) -> Result<Option<usize>, OperationError> {
    request
        .offset
        .map(|offset| check_offset(request, offset))
        .transpose()
}

fn parse_tool_output<T: DeserializeOwned>(
    verb: ToolVerb,
    response: WorkerResponse,
) -> Result<T, OperationError> {
    if response.exit_code != 0 {
        return Err(OperationError::ToolFailed {
            exit_code: response.exit_code,
            message: response.output,
        });
    }
    serde_json::from_str(&response.output)
        .map_err(|e| OperationError::MalformedOutput(format!("{verb}: {e}")))
}

fn package_names(imports: &[ImportDirective]) -> Vec<String> {
    imports
        .iter()
        .filter_map(ImportDirective::package_name)
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

async fn remove_stale(path: &Path) -> Result<(), OperationError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WorkspaceError::Io(e).into()),
    }
}

async fn read_artifact(
    out_dir: &Path,
    with_source_map: bool,
    modules_base_url: Option<String>,
) -> Result<CompiledArtifact, OperationError> {
    let output = tokio::fs::read_to_string(out_dir.join(OUTPUT_FILE))
        .await
        .map_err(|e| OperationError::MalformedOutput(format!("compiler wrote no output: {e}")))?;
    let source_map = if with_source_map {
        match tokio::fs::read_to_string(out_dir.join(SOURCE_MAP_FILE)).await {
            Ok(map) => Some(map),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(WorkspaceError::Io(e).into()),
        }
    } else {
        None
    };
    Ok(CompiledArtifact {
        output,
        source_map,
        modules_base_url,
    })
}
