use super::manifest::{Manifest, LOCK_FILE, MANIFEST_FILE};
use crate::config::WorkspaceConfig;
use crate::error::WorkspaceError;
use crate::invoker::{CommandTemplate, Invoker};
use crate::path_safety;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_ID_LEN: usize = 128;

#[derive(Debug, Default)]
struct ProvisionState {
    provisioned: bool,
    dependencies: BTreeMap<String, String>,
}

/// One isolated package root.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    root: PathBuf,
    source_file: String,
    package_name: String,
    library_prefixes: Vec<String>,
    state: Mutex<ProvisionState>,
    operations: Mutex<()>,
    provisioned: AtomicBool,
    disposed: AtomicBool,
}

impl Workspace {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.root.join("lib")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root.join("out")
    }

    pub fn source_path(&self) -> PathBuf {
        self.lib_dir().join(&self.source_file)
    }

    /// Source path relative to the workspace root, as handed to tools.
    pub fn relative_source_path(&self) -> String {
        format!("lib/{}", self.source_file)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn is_provisioned(&self) -> bool {
        self.provisioned.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Serializes operations that write the snippet or read the output
    /// folder of this workspace.
    pub async fn lock_operations(&self) -> MutexGuard<'_, ()> {
        self.operations.lock().await
    }

    pub async fn dependencies(&self) -> BTreeMap<String, String> {
        self.state.lock().await.dependencies.clone()
    }

    /// Import prefixes currently usable from this workspace: the configured
    /// library prefixes, the package itself, and every provisioned dependency.
    pub async fn approved_imports(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut prefixes = self.library_prefixes.clone();
        prefixes.push(format!("package:{}/", self.package_name));
        if state.provisioned {
            prefixes.extend(state.dependencies.keys().map(|dep| format!("package:{dep}/")));
        }
        prefixes
    }

    /// Forget provisioning so the next operation resolves dependencies again.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        *state = ProvisionState::default();
        self.provisioned.store(false, Ordering::Release);
        debug!("Workspace {} reset", self.id);
    }

    pub async fn write_source(&self, source: &str) -> Result<(), WorkspaceError> {
        self.ensure_live()?;
        tokio::fs::write(self.source_path(), source).await?;
        Ok(())
    }

    /// Canonical path of an artifact under `out/`, refusing anything that
    /// would leave it.
    pub fn resolve_output(&self, relative: &str) -> Result<PathBuf, WorkspaceError> {
        path_safety::check_relative(relative)?;
        self.ensure_live()?;
        path_safety::resolve_within(&self.out_dir(), relative)
    }

    pub async fn read_output(&self, relative: &str) -> Result<Vec<u8>, WorkspaceError> {
        let path = self.resolve_output(relative)?;
        Ok(tokio::fs::read(path).await?)
    }

    fn ensure_live(&self) -> Result<(), WorkspaceError> {
        if self.is_disposed() {
            return Err(WorkspaceError::Disposed(self.id.clone()));
        }
        Ok(())
    }
}

/// Creates, provisions and disposes workspaces under one root directory.
pub struct WorkspaceStore {
    config: WorkspaceConfig,
    library_prefixes: Vec<String>,
    resolver: CommandTemplate,
    invoker: Invoker,
    workspaces: DashMap<String, Arc<OnceCell<Arc<Workspace>>>>,
}

impl WorkspaceStore {
    pub fn new(
        config: WorkspaceConfig,
        library_prefixes: Vec<String>,
        resolver: CommandTemplate,
        invoker: Invoker,
    ) -> Self {
        Self {
            config,
            library_prefixes,
            resolver,
            invoker,
            workspaces: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Return the workspace for `id`, creating it on first use. Concurrent
    /// callers with the same id all receive the same workspace. Without an
    /// id a fresh one is generated.
    pub async fn create(&self, id: Option<&str>) -> Result<Arc<Workspace>, WorkspaceError> {
        let id = match id {
            Some(id) => validate_id(id)?.to_string(),
            None => Uuid::new_v4().simple().to_string(),
        };

        loop {
            let cell = self
                .workspaces
                .entry(id.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let workspace = cell.get_or_try_init(|| self.materialize(&id)).await?;
            if !workspace.is_disposed() {
                return Ok(workspace.clone());
            }

            // A disposal of this id is in flight. It holds the operation lock
            // until the directory is gone and the entry is removed.
            debug!("Workspace {} is being disposed, waiting to recreate", id);
            drop(workspace.lock_operations().await);
            tokio::task::yield_now().await;
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<Workspace>, WorkspaceError> {
        self.workspaces
            .get(id)
            .and_then(|cell| cell.value().get().cloned())
            .filter(|workspace| !workspace.is_disposed())
            .ok_or_else(|| WorkspaceError::NotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.workspaces
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn materialize(&self, id: &str) -> Result<Arc<Workspace>, WorkspaceError> {
        let root = self.config.root.join(id);
        tokio::fs::create_dir_all(root.join("lib")).await?;
        tokio::fs::create_dir_all(root.join("out")).await?;

        let workspace = Workspace {
            id: id.to_string(),
            root,
            source_file: self.config.source_file.clone(),
            package_name: self.config.package_name.clone(),
            library_prefixes: self.library_prefixes.clone(),
            state: Mutex::new(ProvisionState::default()),
            operations: Mutex::new(()),
            provisioned: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        };
        self.write_manifest(&workspace, &BTreeMap::new()).await?;
        tokio::fs::write(workspace.lock_path(), "").await?;

        info!("Created workspace {} at {}", id, workspace.root.display());
        Ok(Arc::new(workspace))
    }

    async fn write_manifest(
        &self,
        workspace: &Workspace,
        dependencies: &BTreeMap<String, String>,
    ) -> Result<(), WorkspaceError> {
        let manifest = Manifest::new(
            &self.config.package_name,
            &self.config.package_version,
            dependencies.clone(),
        );
        tokio::fs::write(workspace.manifest_path(), manifest.render()?).await?;
        Ok(())
    }

    /// Make `dependencies` available to the workspace.
    ///
    /// Provisioning of one workspace is serialized; a request for the set
    /// that is already provisioned returns immediately. A resolver failure
    /// leaves the workspace usable but unprovisioned.
    pub async fn provision(
        &self,
        workspace: &Workspace,
        dependencies: &BTreeMap<String, String>,
    ) -> Result<(), WorkspaceError> {
        self.provision_within(workspace, dependencies, self.resolver.timeout)
            .await
    }

    /// Like [`provision`](Self::provision), with the resolver's timeout
    /// capped at `budget`.
    pub async fn provision_within(
        &self,
        workspace: &Workspace,
        dependencies: &BTreeMap<String, String>,
        budget: Duration,
    ) -> Result<(), WorkspaceError> {
        workspace.ensure_live()?;
        let mut state = workspace.state.lock().await;
        if state.provisioned && state.dependencies == *dependencies {
            debug!("Workspace {} already provisioned", workspace.id);
            return Ok(());
        }

        workspace.provisioned.store(false, Ordering::Release);
        state.provisioned = false;
        state.dependencies = dependencies.clone();
        self.write_manifest(workspace, dependencies).await?;

        let spec = self.resolver.to_spec(&workspace.root, Vec::<String>::new());
        let output = self
            .invoker
            .run(&spec, Some(self.resolver.timeout.min(budget)))
            .await
            .map_err(WorkspaceError::Resolver)?;

        if !output.success() {
            warn!(
                "Dependency resolution for workspace {} exited with {}",
                workspace.id, output.exit_code
            );
            return Err(WorkspaceError::ProvisionFailed {
                exit_code: output.exit_code,
                output: output.combined(),
            });
        }

        state.provisioned = true;
        workspace.provisioned.store(true, Ordering::Release);
        info!(
            "Provisioned workspace {} with {} dependencies",
            workspace.id,
            dependencies.len()
        );
        Ok(())
    }

    /// Remove the workspace directory. The handle stays allocated but every
    /// further use fails with `Disposed`.
    ///
    /// The id stays registered until the directory is gone, so a concurrent
    /// `create` for the same id waits and then builds a fresh workspace.
    pub async fn dispose(&self, id: &str) -> Result<(), WorkspaceError> {
        let Some(cell) = self.workspaces.get(id).map(|cell| cell.value().clone()) else {
            return Err(WorkspaceError::NotFound(id.to_string()));
        };
        // Still being created; nothing on disk belongs to a caller yet.
        let Some(workspace) = cell.get().cloned() else {
            return Err(WorkspaceError::NotFound(id.to_string()));
        };

        workspace.disposed.store(true, Ordering::Release);
        // Wait for an operation in flight on this workspace to finish.
        let _guard = workspace.lock_operations().await;
        let removed: Result<(), WorkspaceError> = match tokio::fs::remove_dir_all(&workspace.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        };
        self.forget(id, &cell);
        removed?;
        info!("Disposed workspace {}", id);
        Ok(())
    }

    /// Drop the entry for `id` if it still is `cell`.
    fn forget(&self, id: &str, cell: &Arc<OnceCell<Arc<Workspace>>>) {
        self.workspaces
            .remove_if(id, |_, current| Arc::ptr_eq(current, cell));
    }

    pub async fn dispose_all(&self) {
        for id in self.ids() {
            if let Err(e) = self.dispose(&id).await {
                warn!("Failed to dispose workspace {}: {}", id, e);
            }
        }
    }
}

/// Workspace ids become directory names, so only a conservative alphabet
/// is accepted.
pub fn validate_id(id: &str) -> Result<&str, WorkspaceError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(id)
    } else {
        Err(WorkspaceError::InvalidId(id.to_string()))
    }
}
