pub use zkaccel_device_common as device_common;
pub use zkaccel_gpu_backend as gpu_backend;
pub use zkaccel_groth16 as groth16;
pub use zkaccel_msm as msm;

pub mod config;
pub mod engine;
pub mod error;
pub mod utils;

pub use config::EngineConfig;
pub use engine::{BackendRun, BackendSelector, ComparisonReport, Groth16Engine};
pub use error::SdkError;
