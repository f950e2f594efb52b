//! CPU [ProverBackend] implementation.

use std::{convert::Infallible, marker::PhantomData};

use ark_ec::pairing::Pairing;
use ark_groth16::ProvingKey;
use zkaccel_msm::pippenger::ark_msm;

use crate::{
    proof::{MsmOutputs, MsmScalars},
    prover::{DeviceDataTransporter, MsmProver, ProverBackend, ProverDevice},
};

#[derive(Clone, Copy, Debug)]
pub struct CpuBackend<E>(PhantomData<E>);

impl<E> Default for CpuBackend<E> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

/// Runs the MSMs on the host thread pool, reading the bases straight from the host key.
#[derive(Clone, Copy, Debug, Default, derive_new::new)]
pub struct CpuDevice;

impl<E: Pairing> ProverBackend for CpuBackend<E> {
    type Engine = E;
    type DeviceProvingKey = ();
    type Error = Infallible;
}

impl<E: Pairing> ProverDevice<CpuBackend<E>> for CpuDevice {
    fn name(&self) -> String {
        "CPU".to_string()
    }
}

impl<E: Pairing> DeviceDataTransporter<CpuBackend<E>> for CpuDevice {
    fn transport_pk_to_device(&self, _pk: &ProvingKey<E>) -> Result<(), Infallible> {
        Ok(())
    }
}

impl<E: Pairing> MsmProver<CpuBackend<E>> for CpuDevice {
    fn compute_msms(
        &self,
        pk: &ProvingKey<E>,
        _dpk: &(),
        scalars: &MsmScalars<E::ScalarField>,
    ) -> Result<MsmOutputs<E>, Infallible> {
        let assignment = scalars.assignment();
        let ((a, b_g1), (b_g2, (h, l))) = rayon::join(
            || {
                rayon::join(
                    || ark_msm::<E::G1>(assignment, &pk.a_query[1..], 1),
                    || ark_msm::<E::G1>(assignment, &pk.b_g1_query[1..], 1),
                )
            },
            || {
                rayon::join(
                    || ark_msm::<E::G2>(assignment, &pk.b_g2_query[1..], 1),
                    || {
                        rayon::join(
                            || ark_msm::<E::G1>(scalars.h(), &pk.h_query, 1),
                            || ark_msm::<E::G1>(scalars.witness(), &pk.l_query, 1),
                        )
                    },
                )
            },
        );
        Ok(MsmOutputs { a, b_g1, b_g2, h, l })
    }
}
