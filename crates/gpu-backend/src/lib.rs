//! Accelerated Groth16 prover device.
//!
//! [GpuDevice] keeps the proving-key bases resident in device memory and computes the five
//! proving MSMs with the device MSM engine, G1 work and G2 work on separate streams.

mod data_transporter;
pub mod error;
mod gpu_backend;
mod gpu_device;
mod prover_backend;

pub use data_transporter::GpuProvingKey;
pub use error::GpuProverError;
pub use gpu_device::GpuDevice;
pub use prover_backend::GpuBackend;
