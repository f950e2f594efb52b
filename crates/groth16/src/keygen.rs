//! Circuit compilation and trusted setup.

use ark_ec::pairing::Pairing;
use ark_ff::PrimeField;
use ark_groth16::{Groth16, ProvingKey, VerifyingKey};
use ark_relations::r1cs::{
    self, ConstraintMatrices, ConstraintSynthesizer, OptimizationGoal, SynthesisError,
    SynthesisMode,
};
use ark_snark::SNARK;
use getset::Getters;
use rand::{CryptoRng, RngCore};
use rayon::prelude::*;
use tracing::instrument;

use crate::{error::ProverError, witness::Witness};

/// A compiled rank-1 constraint system: `(A z) * (B z) = (C z)` row by row, where
/// `z = instance || witness` and `instance[0] = 1`.
#[derive(Clone, Debug, Getters)]
pub struct ConstraintSystem<F: PrimeField> {
    #[getset(get = "pub")]
    matrices: ConstraintMatrices<F>,
}

impl<F: PrimeField> ConstraintSystem<F> {
    pub fn num_constraints(&self) -> usize {
        self.matrices.num_constraints
    }

    /// Number of instance variables, including the constant one.
    pub fn num_instance_variables(&self) -> usize {
        self.matrices.num_instance_variables
    }

    /// Number of public inputs a verifier supplies.
    pub fn num_public_inputs(&self) -> usize {
        self.matrices.num_instance_variables - 1
    }

    pub fn num_witness_variables(&self) -> usize {
        self.matrices.num_witness_variables
    }

    /// Checks `witness` against every constraint. Reports the first violated row.
    pub fn is_satisfied_by(&self, witness: &Witness<F>) -> Result<(), ProverError> {
        witness.check_shape(self)?;
        let z: Vec<F> = witness
            .instance()
            .iter()
            .chain(witness.witness())
            .copied()
            .collect();
        let eval = |row: &[(F, usize)]| -> F {
            row.iter().map(|&(coeff, col)| coeff * z[col]).sum()
        };
        let m = &self.matrices;
        let unsatisfied = (0..m.num_constraints)
            .into_par_iter()
            .find_first(|&i| eval(&m.a[i]) * eval(&m.b[i]) != eval(&m.c[i]));
        match unsatisfied {
            Some(index) => Err(ProverError::UnsatisfiedConstraints { index }),
            None => Ok(()),
        }
    }
}

/// Synthesizes `circuit` in setup mode and extracts its constraint matrices.
#[instrument(name = "compile_circuit", level = "info", skip_all)]
pub fn compile<F, C>(circuit: C) -> Result<ConstraintSystem<F>, ProverError>
where
    F: PrimeField,
    C: ConstraintSynthesizer<F>,
{
    let cs = r1cs::ConstraintSystem::new_ref();
    cs.set_optimization_goal(OptimizationGoal::Constraints);
    cs.set_mode(SynthesisMode::Setup);
    circuit.generate_constraints(cs.clone())?;
    cs.finalize();
    let matrices = cs.to_matrices().ok_or(ProverError::MissingMatrices)?;
    tracing::info!(
        constraints = matrices.num_constraints,
        instance = matrices.num_instance_variables,
        witness = matrices.num_witness_variables,
        "compiled circuit"
    );
    Ok(ConstraintSystem { matrices })
}

/// Circuit-specific Groth16 setup.
#[instrument(name = "groth16_setup", level = "info", skip_all)]
pub fn setup<E, C, R>(
    circuit: C,
    rng: &mut R,
) -> Result<(ProvingKey<E>, VerifyingKey<E>), SynthesisError>
where
    E: Pairing,
    C: ConstraintSynthesizer<E::ScalarField>,
    R: RngCore + CryptoRng,
{
    Groth16::<E>::circuit_specific_setup(circuit, rng)
}

/// Checks that `pk` was generated for a circuit with the shape of `cs`.
pub(crate) fn check_key_shape<E: Pairing>(
    cs: &ConstraintSystem<E::ScalarField>,
    pk: &ProvingKey<E>,
) -> Result<(), ProverError> {
    let num_variables = cs.num_instance_variables() + cs.num_witness_variables();
    if pk.a_query.len() != num_variables
        || pk.b_g1_query.len() != num_variables
        || pk.b_g2_query.len() != num_variables
    {
        return Err(ProverError::KeyMismatch(format!(
            "query length {} does not match {num_variables} variables",
            pk.a_query.len()
        )));
    }
    if pk.l_query.len() != cs.num_witness_variables() {
        return Err(ProverError::KeyMismatch(format!(
            "l_query length {} does not match {} witness variables",
            pk.l_query.len(),
            cs.num_witness_variables()
        )));
    }
    if pk.vk.gamma_abc_g1.len() != cs.num_instance_variables() {
        return Err(ProverError::KeyMismatch(format!(
            "verifying key expects {} public inputs",
            pk.vk.gamma_abc_g1.len().saturating_sub(1)
        )));
    }
    Ok(())
}
