// runtime.rs — The runtime context passed through tracing, import and execution
//
// A `Runtime` owns everything that outlives a single trace: the op registry,
// the kernels, the variable store and the resource cells holding variable
// values. Code that has no explicit runtime uses `Runtime::global()`.
//
// Preconditions: none.
// Postconditions: `global()` returns the same instance for the process lifetime.
// Failure modes: `RuntimeConfig::load` → `Error::Io` / `Error::Json`.
// Side effects: `load` reads from disk.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::import::{ImportLimits, VersionBounds};
use crate::kernels::KernelRegistry;
use crate::registry::OpRegistry;
use crate::resource::ResourceManager;
use crate::variable::VariableStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub import: ImportLimits,
    pub versions: VersionBounds,
    /// dtype of variables whose request and scope name none.
    pub default_dtype: DType,
    /// Device of nodes built outside any device scope; empty leaves them unassigned.
    pub default_device: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            import: ImportLimits::default(),
            versions: VersionBounds::default(),
            default_dtype: DType::Float,
            default_device: String::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }
}

pub struct Runtime {
    id: u64,
    config: RuntimeConfig,
    registry: OpRegistry,
    kernels: KernelRegistry,
    variables: VariableStore,
    resources: ResourceManager,
    next_function: AtomicU64,
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new(RuntimeConfig::default())
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Runtime::with_registry(config, OpRegistry::with_builtin_ops())
    }

    /// A runtime whose op registry has been extended by the caller.
    pub fn with_registry(config: RuntimeConfig, registry: OpRegistry) -> Self {
        static NEXT_RUNTIME: AtomicU64 = AtomicU64::new(0);
        Runtime {
            id: NEXT_RUNTIME.fetch_add(1, Ordering::Relaxed),
            variables: VariableStore::new(config.default_dtype),
            config,
            registry,
            kernels: KernelRegistry::with_builtin_kernels(),
            resources: ResourceManager::new(),
            next_function: AtomicU64::new(0),
        }
    }

    /// The process-wide default runtime, created on first use.
    pub fn global() -> &'static Runtime {
        static GLOBAL: OnceLock<Runtime> = OnceLock::new();
        GLOBAL.get_or_init(Runtime::default)
    }

    /// Process-unique identity; never reused after the runtime is dropped.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &OpRegistry {
        &self.registry
    }

    pub fn kernels(&self) -> &KernelRegistry {
        &self.kernels
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    /// Suffix for generated function names; unique within this runtime.
    pub fn next_function_id(&self) -> u64 {
        self.next_function.fetch_add(1, Ordering::Relaxed)
    }
}
