use std::{collections::HashMap, fmt, sync::Arc};

use ark_ec::pairing::Pairing;
use getset::{CopyGetters, Getters};
use parking_lot::Mutex;
use zkaccel_device_common::common::DeviceContext;
use zkaccel_groth16::prover::ProverDevice;

use crate::{data_transporter::GpuProvingKey, prover_backend::GpuBackend};

/// Prover device bound to one device context.
///
/// Clones share the proving key cache. Each proof runs on streams of its own, so one device
/// can serve concurrent provers.
#[derive(Getters, CopyGetters)]
pub struct GpuDevice<E: Pairing> {
    #[getset(get = "pub")]
    ctx: DeviceContext,
    #[getset(get_copy = "pub")]
    precompute_factor: usize,
    pub(crate) key_cache: Arc<Mutex<HashMap<u64, Arc<GpuProvingKey<E>>>>>,
}

impl<E: Pairing> GpuDevice<E> {
    /// Uses the precompute factor configured through the environment.
    pub fn new(ctx: DeviceContext) -> Self {
        Self::with_precompute_factor(ctx, zkaccel_msm::config::precompute_factor())
    }

    pub fn with_precompute_factor(ctx: DeviceContext, precompute_factor: usize) -> Self {
        Self {
            ctx,
            precompute_factor,
            key_cache: Default::default(),
        }
    }

    /// Number of proving keys resident on the device.
    pub fn cached_keys(&self) -> usize {
        self.key_cache.lock().len()
    }

    /// Drops this device's references to cached proving keys. Device memory is released once
    /// no prover holds them any more.
    pub fn clear_cache(&self) {
        self.key_cache.lock().clear();
    }
}

impl<E: Pairing> Clone for GpuDevice<E> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            precompute_factor: self.precompute_factor,
            key_cache: self.key_cache.clone(),
        }
    }
}

impl<E: Pairing> fmt::Debug for GpuDevice<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuDevice")
            .field("device", self.ctx.device())
            .field("precompute_factor", &self.precompute_factor)
            .finish()
    }
}

impl<E: Pairing> ProverDevice<GpuBackend<E>> for GpuDevice<E> {
    fn name(&self) -> String {
        self.ctx.device().to_string()
    }
}
