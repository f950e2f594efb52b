use std::{
    hash::{DefaultHasher, Hasher},
    io,
    sync::Arc,
};

use ark_ec::{pairing::Pairing, CurveGroup};
use ark_groth16::ProvingKey;
use ark_serialize::{CanonicalSerialize, SerializationError};
use tracing::instrument;
use zkaccel_device_common::{
    common::DeviceContext, d_buffer::DeviceBuffer, memory_manager::MemTracker, stream::Stream,
};
use zkaccel_groth16::prover::DeviceDataTransporter;
use zkaccel_msm::{precompute_bases, MsmError, MsmInput};

use crate::{error::GpuProverError, gpu_device::GpuDevice, prover_backend::GpuBackend};

/// Proving key bases resident in device memory, expanded by `factor`.
///
/// The constant terms `a_query[0]`, `b_g1_query[0]` and `b_g2_query[0]` stay on the host; only
/// the bases multiplied by the assignment are uploaded. Empty queries have no buffer.
pub struct GpuProvingKey<E: Pairing> {
    pub factor: usize,
    pub a: Option<DeviceBuffer<E::G1Affine>>,
    pub b_g1: Option<DeviceBuffer<E::G1Affine>>,
    pub b_g2: Option<DeviceBuffer<E::G2Affine>>,
    pub h: Option<DeviceBuffer<E::G1Affine>>,
    pub l: Option<DeviceBuffer<E::G1Affine>>,
}

impl<E: Pairing> GpuProvingKey<E> {
    #[instrument(
        name = "upload_proving_key",
        level = "info",
        skip_all,
        fields(device = %ctx.device(), factor)
    )]
    pub fn upload(
        ctx: &DeviceContext,
        pk: &ProvingKey<E>,
        factor: usize,
    ) -> Result<Self, GpuProverError> {
        let mem = MemTracker::start(ctx, "upload_proving_key");
        let stream = ctx.create_stream()?;
        let dpk = Self {
            factor,
            a: upload_bases::<E::G1>(ctx, &pk.a_query[1..], factor, &stream)?,
            b_g1: upload_bases::<E::G1>(ctx, &pk.b_g1_query[1..], factor, &stream)?,
            b_g2: upload_bases::<E::G2>(ctx, &pk.b_g2_query[1..], factor, &stream)?,
            h: upload_bases::<E::G1>(ctx, &pk.h_query, factor, &stream)?,
            l: upload_bases::<E::G1>(ctx, &pk.l_query, factor, &stream)?,
        };
        mem.emit_metrics();
        Ok(dpk)
    }
}

fn upload_bases<G: CurveGroup>(
    ctx: &DeviceContext,
    bases: &[G::Affine],
    factor: usize,
    stream: &Stream,
) -> Result<Option<DeviceBuffer<G::Affine>>, MsmError> {
    if bases.is_empty() {
        return Ok(None);
    }
    precompute_bases::<G>(ctx, MsmInput::Host(bases), factor, Some(stream)).map(Some)
}

struct HashWriter(DefaultHasher);

impl io::Write for HashWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Identifies a proving key by its full contents, query bases included.
pub(crate) fn key_fingerprint<E: Pairing>(pk: &ProvingKey<E>) -> Result<u64, SerializationError> {
    let mut hasher = HashWriter(DefaultHasher::new());
    pk.serialize_uncompressed(&mut hasher)?;
    Ok(hasher.0.finish())
}

impl<E: Pairing> DeviceDataTransporter<GpuBackend<E>> for GpuDevice<E> {
    fn transport_pk_to_device(
        &self,
        pk: &ProvingKey<E>,
    ) -> Result<Arc<GpuProvingKey<E>>, GpuProverError> {
        let fingerprint = key_fingerprint(pk)?;
        if let Some(dpk) = self.key_cache.lock().get(&fingerprint) {
            tracing::debug!(fingerprint, "proving key cache hit");
            metrics::counter!("gpu_pk_cache_hits").increment(1);
            return Ok(dpk.clone());
        }
        metrics::counter!("gpu_pk_uploads").increment(1);
        // Uploads run unlocked; a racing upload of the same key loses to the first insert.
        let dpk = Arc::new(GpuProvingKey::upload(
            self.ctx(),
            pk,
            self.precompute_factor(),
        )?);
        Ok(self
            .key_cache
            .lock()
            .entry(fingerprint)
            .or_insert(dpk)
            .clone())
    }
}
