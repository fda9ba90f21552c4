//! Service configuration.
//!
//! Values are resolved in three layers: built-in defaults, an optional TOML
//! file, then `PADSERVE_*` environment variables.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const CONFIG_ENV_VAR: &str = "PADSERVE_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Default tracing filter; `RUST_LOG` takes precedence.
    pub log_level: String,
    pub workspace: WorkspaceConfig,
    pub worker: WorkerConfig,
    pub compiler: CompilerConfig,
    pub resolver: ResolverConfig,
    pub cache: CacheConfig,
    pub imports: ImportsConfig,
    pub versions: VersionsConfig,
    pub operations: OperationsConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            workspace: WorkspaceConfig::default(),
            worker: WorkerConfig::default(),
            compiler: CompilerConfig::default(),
            resolver: ResolverConfig::default(),
            cache: CacheConfig::default(),
            imports: ImportsConfig::default(),
            versions: VersionsConfig::default(),
            operations: OperationsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory under which one folder per workspace is created.
    pub root: PathBuf,
    /// Synthetic package name written to every manifest.
    pub package_name: String,
    pub package_version: String,
    /// File name of the snippet inside `lib/`.
    pub source_file: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("padserve-workspaces"),
            package_name: "padserve_sample".to_string(),
            package_version: "0.0.1".to_string(),
            source_file: "main.pad".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub pool_size: usize,
    pub request_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "padserve-toolchain".to_string(),
            args: vec!["--persistent".to_string()],
            pool_size: 1,
            request_timeout_secs: 30,
            shutdown_timeout_secs: 5,
        }
    }
}

impl WorkerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Whole-program compiler, run once per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            command: "padserve-toolchain".to_string(),
            args: vec!["compile-whole".to_string()],
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            command: "padserve-toolchain".to_string(),
            args: vec!["resolve".to_string()],
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Remote,
}

impl std::str::FromStr for CacheBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(CacheBackend::Memory),
            "remote" | "redis" => Ok(CacheBackend::Remote),
            other => Err(anyhow!("unknown cache backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    /// Entry bound of the in-memory LRU.
    pub capacity: usize,
    /// `redis://host:port` of the remote backend.
    pub redis_url: Option<String>,
    pub operation_timeout_ms: u64,
    pub expiration_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            capacity: 512,
            redis_url: None,
            operation_timeout_ms: 10_000,
            expiration_secs: 3600,
            reconnect_base_ms: 250,
            reconnect_cap_ms: 60_000,
        }
    }
}

impl CacheConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportsConfig {
    /// Library import prefixes every workspace accepts, e.g. `std:`.
    pub approved_library_prefixes: Vec<String>,
    /// Packages that may be imported, with the version constraint written to
    /// the manifest.
    pub supported_packages: BTreeMap<String, String>,
}

impl Default for ImportsConfig {
    fn default() -> Self {
        let supported_packages = [
            ("collection", "^1.18.0"),
            ("http", "^1.2.0"),
            ("meta", "^1.11.0"),
            ("path", "^1.9.0"),
        ]
        .into_iter()
        .map(|(name, constraint)| (name.to_string(), constraint.to_string()))
        .collect();

        Self {
            approved_library_prefixes: vec!["std:".to_string()],
            supported_packages,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionsConfig {
    pub service: String,
    pub toolchain: String,
    pub runtime: String,
}

impl Default for VersionsConfig {
    fn default() -> Self {
        Self {
            service: env!("CARGO_PKG_VERSION").to_string(),
            toolchain: "0.0.0".to_string(),
            runtime: "0.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationsConfig {
    /// Wall-clock bound of one client operation.
    pub timeout_secs: u64,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        // Long enough for a full resolve followed by a compile.
        Self { timeout_secs: 180 }
    }
}

impl OperationsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ServiceConfig {
    /// Load configuration from `path`, `$PADSERVE_CONFIG`, or the user config
    /// directory, then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match Self::config_path(path) {
            Some(path) => {
                debug!("Loading configuration from {}", path.display());
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Self::from_toml_str(&content)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir()
            .map(|dir| dir.join("padserve").join("config.toml"))
            .filter(|path| path.is_file())
    }

    /// Apply `PADSERVE_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("PADSERVE_WORKSPACE_ROOT") {
            self.workspace.root = PathBuf::from(val);
        }
        if let Some(val) = lookup("PADSERVE_WORKER_COMMAND") {
            self.worker.command = val;
        }
        if let Some(val) = lookup("PADSERVE_POOL_SIZE") {
            self.worker.pool_size = val
                .parse()
                .with_context(|| format!("PADSERVE_POOL_SIZE is not a number: {val}"))?;
        }
        if let Some(val) = lookup("PADSERVE_CACHE_BACKEND") {
            self.cache.backend = val.parse()?;
        }
        if let Some(val) = lookup("PADSERVE_REDIS_URL") {
            self.cache.redis_url = Some(val);
        }
        if let Some(val) = lookup("PADSERVE_OPERATION_TIMEOUT_SECS") {
            self.operations.timeout_secs = val.parse().with_context(|| {
                format!("PADSERVE_OPERATION_TIMEOUT_SECS is not a number: {val}")
            })?;
        }
        if let Some(val) = lookup("PADSERVE_LOG_LEVEL") {
            self.log_level = val;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.pool_size == 0 {
            return Err(anyhow!("worker.pool_size must be at least 1"));
        }
        if self.worker.command.trim().is_empty() {
            return Err(anyhow!("worker.command must not be empty"));
        }
        if self.compiler.command.trim().is_empty() {
            return Err(anyhow!("compiler.command must not be empty"));
        }
        if self.resolver.command.trim().is_empty() {
            return Err(anyhow!("resolver.command must not be empty"));
        }
        if self.cache.capacity == 0 {
            return Err(anyhow!("cache.capacity must be at least 1"));
        }
        if self.cache.backend == CacheBackend::Remote && self.cache.redis_url.is_none() {
            return Err(anyhow!("cache.redis_url is required for the remote backend"));
        }
        if self.operations.timeout_secs == 0 {
            return Err(anyhow!("operations.timeout_secs must be at least 1"));
        }
        for (name, secs) in [
            ("compiler.timeout_secs", self.compiler.timeout_secs),
            ("resolver.timeout_secs", self.resolver.timeout_secs),
        ] {
            if secs > self.operations.timeout_secs {
                return Err(anyhow!(
                    "{name} ({secs}) exceeds operations.timeout_secs ({})",
                    self.operations.timeout_secs
                ));
            }
        }
        Ok(())
    }

    /// Namespace for remote cache keys.
    pub fn cache_key_prefix(&self) -> String {
        format!("{}+{}:", self.versions.service, self.versions.toolchain)
    }
}

/// Resolve a configured command to an executable path.
///
/// Commands containing a path separator are taken as-is; bare names are
/// looked up on `PATH`.
pub fn resolve_executable(command: &str) -> Result<PathBuf> {
    let path = Path::new(command);
    if path.components().count() > 1 || path.is_absolute() {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(anyhow!("executable not found: {}", path.display()));
    }
    which::which(command).with_context(|| format!("{command} not found on PATH"))
}
