use std::time::Instant;

use ark_ec::pairing::Pairing;
use ark_ff::UniformRand;
use ark_groth16::{
    r1cs_to_qap::{LibsnarkReduction, R1CSToQAP},
    Proof, ProvingKey,
};
use ark_poly::GeneralEvaluationDomain;
use rand::RngCore;
use tracing::{info, info_span, instrument};

use crate::{
    error::ProverError,
    keygen::{check_key_shape, ConstraintSystem},
    proof::{combine, MsmScalars},
    witness::Witness,
};

mod cpu_backend;
mod hal;

pub use cpu_backend::*;
pub use hal::*;

/// Drives a Groth16 proof: witness checks and the QAP witness map on the host, the five MSMs on
/// the device, and the final blinded combination on the host.
#[derive(derive_new::new)]
pub struct Coordinator<PB: ProverBackend, PD> {
    pub backend: PB,
    pub device: PD,
}

impl<PB, PD> Coordinator<PB, PD>
where
    PB: ProverBackend,
    PD: ProverDevice<PB>,
{
    /// Transports `pk` to the device and proves with fresh blinding factors from `rng`.
    pub fn prove<R: RngCore>(
        &self,
        cs: &ConstraintSystem<<PB::Engine as Pairing>::ScalarField>,
        pk: &ProvingKey<PB::Engine>,
        witness: &Witness<<PB::Engine as Pairing>::ScalarField>,
        rng: &mut R,
    ) -> Result<Proof<PB::Engine>, ProverError> {
        let dpk = self
            .device
            .transport_pk_to_device(pk)
            .map_err(ProverError::device)?;
        let r = UniformRand::rand(rng);
        let s = UniformRand::rand(rng);
        self.prove_with_blinding(cs, pk, &dpk, witness, r, s)
    }

    /// Proves with the given device key and blinding factors. Deterministic in its inputs.
    #[instrument(
        name = "groth16_prove",
        level = "info",
        skip_all,
        fields(device = %self.device.name())
    )]
    pub fn prove_with_blinding(
        &self,
        cs: &ConstraintSystem<<PB::Engine as Pairing>::ScalarField>,
        pk: &ProvingKey<PB::Engine>,
        dpk: &PB::DeviceProvingKey,
        witness: &Witness<<PB::Engine as Pairing>::ScalarField>,
        r: <PB::Engine as Pairing>::ScalarField,
        s: <PB::Engine as Pairing>::ScalarField,
    ) -> Result<Proof<PB::Engine>, ProverError> {
        check_key_shape(cs, pk)?;
        cs.is_satisfied_by(witness)?;

        let h = info_span!("witness_map").in_scope(|| {
            let full_assignment: Vec<_> = witness
                .instance()
                .iter()
                .chain(witness.witness())
                .copied()
                .collect();
            LibsnarkReduction::witness_map_from_matrices::<
                <PB::Engine as Pairing>::ScalarField,
                GeneralEvaluationDomain<<PB::Engine as Pairing>::ScalarField>,
            >(
                cs.matrices(),
                cs.num_instance_variables(),
                cs.num_constraints(),
                &full_assignment,
            )
        })?;
        let scalars = MsmScalars::new(witness, h, pk.h_query.len());

        let start = Instant::now();
        let outputs = info_span!("compute_msms")
            .in_scope(|| self.device.compute_msms(pk, dpk, &scalars))
            .map_err(ProverError::device)?;
        let elapsed = start.elapsed();
        metrics::histogram!("groth16_msm_seconds", "device" => self.device.name())
            .record(elapsed.as_secs_f64());
        info!(msm_ms = elapsed.as_millis() as u64, "msm stage done");

        Ok(combine(pk, &outputs, r, s))
    }
}
