//! Multi-scalar multiplication over the device runtime.
//!
//! [msm::msm] computes `sum_i s_i * P_i` for one or more independent instances on whatever
//! device the [DeviceContext](zkaccel_device_common::common::DeviceContext) addresses. CPU
//! devices run arkworks' variable-base MSM; accelerator devices run a windowed bucket kernel.
//! Both produce the same group elements.

pub mod config;
pub mod error;
pub mod msm;
pub mod pippenger;

pub use error::MsmError;
pub use msm::{msm, msm_async, msm_host, precompute_bases, MsmConfig, MsmHandle, MsmInput};
