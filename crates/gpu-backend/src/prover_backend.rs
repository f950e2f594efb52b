use std::{marker::PhantomData, sync::Arc};

use ark_ec::pairing::Pairing;
use zkaccel_groth16::prover::ProverBackend;

use crate::{data_transporter::GpuProvingKey, error::GpuProverError};

#[derive(Clone, Copy, Debug)]
pub struct GpuBackend<E>(PhantomData<E>);

impl<E> Default for GpuBackend<E> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<E: Pairing> ProverBackend for GpuBackend<E> {
    type Engine = E;
    type DeviceProvingKey = Arc<GpuProvingKey<E>>;
    type Error = GpuProverError;
}
