use std::sync::Arc;

use ark_ec::{pairing::Pairing, CurveGroup};
use ark_ff::Zero;
use ark_groth16::ProvingKey;
use tracing::instrument;
use zkaccel_device_common::{
    common::DeviceContext,
    copy::MemCopyH2D,
    d_buffer::{DeviceBuffer, DeviceRepr},
    error::MemCopyError,
    memory_manager::MemTracker,
    stream::{device_metrics_span, Pending, Stream},
};
use zkaccel_groth16::{
    proof::{MsmOutputs, MsmScalars},
    prover::MsmProver,
};
use zkaccel_msm::{msm_async, MsmConfig, MsmError, MsmHandle};

use crate::{
    data_transporter::GpuProvingKey, error::GpuProverError, gpu_device::GpuDevice,
    prover_backend::GpuBackend,
};

impl<E: Pairing> MsmProver<GpuBackend<E>> for GpuDevice<E> {
    /// Queues the G2 MSM on one stream and the four G1 MSMs on another, then waits on both.
    #[instrument(
        name = "gpu_msms",
        level = "debug",
        skip_all,
        fields(device = %self.ctx().device())
    )]
    fn compute_msms(
        &self,
        _pk: &ProvingKey<E>,
        dpk: &Arc<GpuProvingKey<E>>,
        scalars: &MsmScalars<E::ScalarField>,
    ) -> Result<MsmOutputs<E>, GpuProverError> {
        let ctx = self.ctx();
        let mem = MemTracker::start(ctx, "compute_msms");
        let g1_stream = ctx.create_stream()?;
        let g2_stream = ctx.create_stream()?;
        let cfg = MsmConfig::default().with_precompute_factor(dpk.factor);

        let g2_assignment = upload(ctx, scalars.assignment(), &g2_stream)?;
        let b_g2 = launch::<E::G2>(ctx, &g2_assignment, dpk.b_g2.as_ref(), &cfg, &g2_stream)?;

        // Scalar uploads stay alive until their MSMs have been waited on.
        let (a, b_g1, h, l, _inputs) = device_metrics_span(&g1_stream, "gpu_g1_msm_ms", || {
            let assignment = upload(ctx, scalars.assignment(), &g1_stream)?;
            let a = launch::<E::G1>(ctx, &assignment, dpk.a.as_ref(), &cfg, &g1_stream)?;
            let b_g1 = launch::<E::G1>(ctx, &assignment, dpk.b_g1.as_ref(), &cfg, &g1_stream)?;
            let h_scalars = upload(ctx, scalars.h(), &g1_stream)?;
            let h = launch::<E::G1>(ctx, &h_scalars, dpk.h.as_ref(), &cfg, &g1_stream)?;
            let l_scalars = upload(ctx, scalars.witness(), &g1_stream)?;
            let l = launch::<E::G1>(ctx, &l_scalars, dpk.l.as_ref(), &cfg, &g1_stream)?;
            Ok::<_, GpuProverError>((a, b_g1, h, l, (assignment, h_scalars, l_scalars)))
        })??;

        let outputs = MsmOutputs {
            a: resolve(a)?,
            b_g1: resolve(b_g1)?,
            b_g2: resolve(b_g2)?,
            h: resolve(h)?,
            l: resolve(l)?,
        };
        g1_stream.synchronize()?;
        g2_stream.synchronize()?;
        mem.emit_metrics();
        Ok(outputs)
    }
}

/// Queues an upload of `host` on `stream`. Empty slices need no buffer.
fn upload<'s, T: DeviceRepr>(
    ctx: &DeviceContext,
    host: &[T],
    stream: &'s Stream,
) -> Result<Option<Pending<'s, DeviceBuffer<T>>>, MemCopyError> {
    if host.is_empty() {
        return Ok(None);
    }
    host.to_device_async(ctx, stream).map(Some)
}

fn launch<'s, G: CurveGroup>(
    ctx: &DeviceContext,
    scalars: &Option<Pending<'_, DeviceBuffer<G::ScalarField>>>,
    bases: Option<&DeviceBuffer<G::Affine>>,
    cfg: &MsmConfig,
    stream: &'s Stream,
) -> Result<Option<MsmHandle<'s, G>>, MsmError> {
    let scalars = scalars.as_ref().and_then(Pending::ordered);
    match (scalars, bases) {
        (Some(scalars), Some(bases)) => {
            msm_async(ctx, scalars.into(), bases.into(), cfg, stream).map(Some)
        }
        _ => Ok(None),
    }
}

/// An MSM over no terms is the identity.
fn resolve<G: CurveGroup>(handle: Option<MsmHandle<'_, G>>) -> Result<G, MsmError> {
    handle.map_or_else(|| Ok(G::zero()), MsmHandle::wait_one)
}
