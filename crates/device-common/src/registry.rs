//! Backend discovery and device enumeration.
//!
//! A backend is described by a TOML manifest in the backend directory:
//!
//! ```toml
//! name = "CUDA"
//! abi_version = 1
//! kind = "accelerator"
//! device_count = 2
//! memory_bytes = 8589934592
//! description = "optional"
//! ```
//!
//! The registry is loaded once and read concurrently afterwards. Activating a device returns a
//! [DeviceContext] which is then passed explicitly to every device operation.

use std::{
    collections::{BTreeMap, BTreeSet},
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    common::{BackendKind, Device, DeviceContext, DeviceRuntime},
    error::{BackendLoadError, DeviceNotFound},
};

pub const SUPPORTED_ABI_VERSION: u32 = 1;
pub const BACKEND_INSTALL_DIR_ENV: &str = "ZKACCEL_BACKEND_INSTALL_DIR";
pub const DEFAULT_BACKEND_INSTALL_DIR: &str = "/opt/zkaccel/lib/backend";
pub const CPU_MEMORY_ENV: &str = "ZKACCEL_CPU_MEMORY_BYTES";
pub const CPU_BACKEND_NAME: &str = "CPU";
pub const DEFAULT_CPU_MEMORY_BYTES: usize = 4 << 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendManifest {
    pub name: String,
    pub abi_version: u32,
    pub kind: BackendKind,
    pub device_count: usize,
    pub memory_bytes: u64,
    #[serde(default)]
    pub description: Option<String>,
}

impl BackendManifest {
    fn validate(&self, path: &Path) -> Result<(), BackendLoadError> {
        let fail = |reason: String| BackendLoadError::Integrity {
            path: path.to_path_buf(),
            reason,
        };
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(fail(format!("invalid backend name {:?}", self.name)));
        }
        if self.abi_version != SUPPORTED_ABI_VERSION {
            return Err(fail(format!(
                "abi version {} is not supported (expected {SUPPORTED_ABI_VERSION})",
                self.abi_version
            )));
        }
        if self.device_count == 0 {
            return Err(fail("backend declares no devices".to_string()));
        }
        if self.memory_bytes == 0 {
            return Err(fail("backend declares zero device memory".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Register the built-in CPU backend alongside discovered modules.
    pub include_builtin_cpu: bool,
    /// Memory budget of the CPU device.
    pub cpu_memory_bytes: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        let cpu_memory_bytes = env::var(CPU_MEMORY_ENV)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .filter(|&bytes: &usize| bytes > 0)
            .unwrap_or(DEFAULT_CPU_MEMORY_BYTES);
        Self {
            include_builtin_cpu: true,
            cpu_memory_bytes,
        }
    }
}

struct LoadedBackend {
    kind: BackendKind,
    source: Option<PathBuf>,
    runtimes: Vec<Arc<DeviceRuntime>>,
}

impl LoadedBackend {
    fn new(
        name: &str,
        kind: BackendKind,
        device_count: usize,
        memory_bytes: usize,
        source: Option<PathBuf>,
    ) -> Self {
        let runtimes = (0..device_count)
            .map(|index| {
                Arc::new(DeviceRuntime::new(
                    Device::new(name.to_string(), index),
                    kind,
                    memory_bytes,
                ))
            })
            .collect();
        Self {
            kind,
            source,
            runtimes,
        }
    }
}

/// Set of loaded compute backends and their devices.
#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<BTreeMap<String, LoadedBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding only the built-in CPU backend with the given memory budget.
    pub fn with_builtin_cpu(cpu_memory_bytes: usize) -> Self {
        let registry = Self::new();
        registry.backends.write().insert(
            CPU_BACKEND_NAME.to_string(),
            LoadedBackend::new(
                CPU_BACKEND_NAME,
                BackendKind::Cpu,
                1,
                cpu_memory_bytes,
                None,
            ),
        );
        registry
    }

    /// Directory scanned when no explicit path is given.
    pub fn default_install_dir() -> PathBuf {
        env::var_os(BACKEND_INSTALL_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKEND_INSTALL_DIR))
    }

    pub fn load_backends(&self, path: Option<&Path>) -> Result<BTreeSet<String>, BackendLoadError> {
        self.load_backends_with(path, &LoadOptions::default())
    }

    /// Scans `path` (or the default directory) for backend manifests and registers them.
    ///
    /// Backends that are already registered are skipped, so repeated loads are harmless.
    /// Returns the names of all registered backends.
    #[tracing::instrument(level = "info", skip_all)]
    pub fn load_backends_with(
        &self,
        path: Option<&Path>,
        options: &LoadOptions,
    ) -> Result<BTreeSet<String>, BackendLoadError> {
        let manifests = match path {
            Some(dir) => {
                if !dir.is_dir() {
                    return Err(BackendLoadError::MissingDirectory {
                        path: dir.to_path_buf(),
                    });
                }
                read_manifests(dir)?
            }
            None => {
                let dir = Self::default_install_dir();
                if dir.is_dir() {
                    read_manifests(&dir)?
                } else {
                    tracing::debug!("backend directory {} not found", dir.display());
                    Vec::new()
                }
            }
        };

        let mut backends = self.backends.write();
        if options.include_builtin_cpu && !backends.contains_key(CPU_BACKEND_NAME) {
            backends.insert(
                CPU_BACKEND_NAME.to_string(),
                LoadedBackend::new(
                    CPU_BACKEND_NAME,
                    BackendKind::Cpu,
                    1,
                    options.cpu_memory_bytes,
                    None,
                ),
            );
        }
        for (source, manifest) in manifests {
            if backends.contains_key(&manifest.name) {
                tracing::debug!(backend = %manifest.name, "backend already registered");
                continue;
            }
            let memory_bytes = usize::try_from(manifest.memory_bytes).map_err(|_| {
                BackendLoadError::Integrity {
                    path: source.clone(),
                    reason: format!("memory_bytes {} exceeds host limits", manifest.memory_bytes),
                }
            })?;
            tracing::info!(
                backend = %manifest.name,
                kind = %manifest.kind,
                devices = manifest.device_count,
                "loaded backend"
            );
            backends.insert(
                manifest.name.clone(),
                LoadedBackend::new(
                    &manifest.name,
                    manifest.kind,
                    manifest.device_count,
                    memory_bytes,
                    Some(source),
                ),
            );
        }

        if backends.is_empty() {
            return Err(BackendLoadError::NoBackends);
        }
        Ok(backends.keys().cloned().collect())
    }

    pub fn loaded_backends(&self) -> BTreeSet<String> {
        self.backends.read().keys().cloned().collect()
    }

    /// Every device of every loaded backend, ordered by backend name and index.
    pub fn list_devices(&self) -> Vec<Device> {
        self.backends
            .read()
            .values()
            .flat_map(|backend| backend.runtimes.iter().map(|rt| rt.device.clone()))
            .collect()
    }

    pub fn backend_kind(&self, name: &str) -> Option<BackendKind> {
        self.backends.read().get(name).map(|backend| backend.kind)
    }

    /// Manifest the backend was loaded from. `None` for the built-in CPU backend.
    pub fn backend_source(&self, name: &str) -> Option<PathBuf> {
        self.backends
            .read()
            .get(name)
            .and_then(|backend| backend.source.clone())
    }

    pub fn create_device(&self, backend: &str, index: usize) -> Result<Device, DeviceNotFound> {
        self.runtime(backend, index).map(|rt| rt.device.clone())
    }

    /// Binds `device` to a new execution context.
    pub fn set_active_device(&self, device: &Device) -> Result<DeviceContext, DeviceNotFound> {
        let runtime = self.runtime(device.backend(), device.index())?;
        tracing::debug!(%device, "activated device");
        Ok(DeviceContext::new(runtime))
    }

    fn runtime(&self, backend: &str, index: usize) -> Result<Arc<DeviceRuntime>, DeviceNotFound> {
        self.backends
            .read()
            .get(backend)
            .and_then(|loaded| loaded.runtimes.get(index))
            .cloned()
            .ok_or_else(|| DeviceNotFound {
                backend: backend.to_string(),
                index,
            })
    }
}

fn read_manifests(dir: &Path) -> Result<Vec<(PathBuf, BackendManifest)>, BackendLoadError> {
    let io_err = |source| BackendLoadError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    paths.retain(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"));
    paths.sort();

    let mut seen = BTreeSet::new();
    let mut manifests = Vec::with_capacity(paths.len());
    for path in paths {
        let text = fs::read_to_string(&path).map_err(|source| BackendLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let manifest: BackendManifest =
            toml::from_str(&text).map_err(|source| BackendLoadError::Manifest {
                path: path.clone(),
                source,
            })?;
        manifest.validate(&path)?;
        if !seen.insert(manifest.name.clone()) {
            return Err(BackendLoadError::Duplicate {
                name: manifest.name,
            });
        }
        manifests.push((path, manifest));
    }
    Ok(manifests)
}
