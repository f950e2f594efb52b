use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use zkaccel_device_common::registry::LoadOptions;
use zkaccel_msm::config::{self, DeviceType};

use crate::error::SdkError;

/// Engine settings, loadable from TOML:
///
/// ```toml
/// backend_dir = "/opt/zkaccel/lib/backend"
/// include_cpu = true
/// preferred_backend = "CUDA"
/// device_index = 0
/// precompute_factor = 2
/// device_type = "auto"
/// gpu_min_size = 4096
/// ```
///
/// Omitted fields fall back to the environment-derived defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory of backend manifests. `None` uses the install directory.
    pub backend_dir: Option<PathBuf>,
    /// Register the built-in CPU backend.
    pub include_cpu: bool,
    pub cpu_memory_bytes: usize,
    /// Accelerator backend chosen by [BackendSelector::Auto](crate::BackendSelector::Auto).
    /// `None` takes the first loaded accelerator backend.
    pub preferred_backend: Option<String>,
    pub device_index: usize,
    /// Precompute factor for proving-key bases on accelerator devices.
    pub precompute_factor: usize,
    /// Where [BackendSelector::Auto](crate::BackendSelector::Auto) sends proofs.
    pub device_type: DeviceType,
    /// Smallest MSM sent to an accelerator when `device_type` is `auto`.
    pub gpu_min_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let load = LoadOptions::default();
        Self {
            backend_dir: None,
            include_cpu: load.include_builtin_cpu,
            cpu_memory_bytes: load.cpu_memory_bytes,
            preferred_backend: None,
            device_index: 0,
            precompute_factor: config::precompute_factor(),
            device_type: config::device_type(),
            gpu_min_size: config::gpu_min_size(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SdkError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SdkError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SdkError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            include_builtin_cpu: self.include_cpu,
            cpu_memory_bytes: self.cpu_memory_bytes,
        }
    }
}
