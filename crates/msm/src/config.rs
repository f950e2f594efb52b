//! Process-wide MSM tuning, read once from the environment.
//!
//! - `ZKACCEL_DEVICE`: `auto` (default), `gpu` or `cpu`. Selects where proof MSMs run when the
//!   caller leaves the choice to the engine.
//! - `ZKACCEL_GPU_MIN_SIZE`: smallest MSM routed to an accelerator in `auto` mode
//!   (default 2^12 points).
//! - `ZKACCEL_MSM_PRECOMPUTE`: base precompute factor, clamped to 1..=8 (default 1).
//! - `ZKACCEL_MSM_WINDOW`: bucket window size in bits, 0 picks one from the input size.

use std::{fmt, sync::OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const DEVICE_ENV: &str = "ZKACCEL_DEVICE";
pub const GPU_MIN_SIZE_ENV: &str = "ZKACCEL_GPU_MIN_SIZE";
pub const PRECOMPUTE_ENV: &str = "ZKACCEL_MSM_PRECOMPUTE";
pub const WINDOW_ENV: &str = "ZKACCEL_MSM_WINDOW";

pub const DEFAULT_GPU_MIN_SIZE: usize = 1 << 12;
pub const MAX_PRECOMPUTE_FACTOR: usize = 8;
pub const MAX_WINDOW_BITS: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Accelerator for large MSMs, CPU for small ones.
    Auto,
    #[serde(alias = "accelerator")]
    Gpu,
    Cpu,
}

impl DeviceType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "auto" => Some(DeviceType::Auto),
            "gpu" | "accelerator" => Some(DeviceType::Gpu),
            "cpu" => Some(DeviceType::Cpu),
            _ => None,
        }
    }

    pub fn from_env() -> Self {
        std::env::var(DEVICE_ENV)
            .ok()
            .and_then(|s| {
                let parsed = Self::parse(&s);
                if parsed.is_none() {
                    warn!("Unknown {DEVICE_ENV} value '{s}', using auto");
                }
                parsed
            })
            .unwrap_or(DeviceType::Auto)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Auto => write!(f, "auto"),
            DeviceType::Gpu => write!(f, "gpu"),
            DeviceType::Cpu => write!(f, "cpu"),
        }
    }
}

pub fn device_type() -> DeviceType {
    static DEVICE_TYPE: OnceLock<DeviceType> = OnceLock::new();
    *DEVICE_TYPE.get_or_init(|| {
        let dt = DeviceType::from_env();
        if dt != DeviceType::Auto {
            info!("Device type from {DEVICE_ENV}: {dt}");
        }
        dt
    })
}

pub fn gpu_min_size() -> usize {
    static MIN_SIZE: OnceLock<usize> = OnceLock::new();
    *MIN_SIZE.get_or_init(|| {
        std::env::var(GPU_MIN_SIZE_ENV)
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .map(|v| {
                debug!("accelerator threshold={v} points (from {GPU_MIN_SIZE_ENV})");
                v
            })
            .unwrap_or(DEFAULT_GPU_MIN_SIZE)
    })
}

/// Whether an MSM over `size` points should be sent to an accelerator.
pub fn should_use_accelerator(size: usize) -> bool {
    route(device_type(), size, gpu_min_size())
}

pub fn route(device_type: DeviceType, size: usize, min_size: usize) -> bool {
    match device_type {
        DeviceType::Gpu => true,
        DeviceType::Cpu => false,
        DeviceType::Auto => size >= min_size,
    }
}

pub fn precompute_factor() -> usize {
    static PRECOMPUTE: OnceLock<usize> = OnceLock::new();
    *PRECOMPUTE.get_or_init(|| {
        std::env::var(PRECOMPUTE_ENV)
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .map(|v| {
                let factor = v.clamp(1, MAX_PRECOMPUTE_FACTOR);
                if factor > 1 {
                    info!("MSM base precomputation enabled: factor={factor} ({factor}x base memory)");
                }
                factor
            })
            .unwrap_or(1)
    })
}

/// Window size in bits; 0 lets the kernel choose.
pub fn msm_window_bits() -> usize {
    static WINDOW: OnceLock<usize> = OnceLock::new();
    *WINDOW.get_or_init(|| {
        std::env::var(WINDOW_ENV)
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .map(|v| {
                let bits = v.min(MAX_WINDOW_BITS);
                debug!("MSM window_bits={bits} (from {WINDOW_ENV})");
                bits
            })
            .unwrap_or(0)
    })
}
