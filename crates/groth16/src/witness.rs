use ark_ff::{One, PrimeField};
use ark_relations::r1cs::{
    self, ConstraintSynthesizer, OptimizationGoal, SynthesisError, SynthesisMode,
};
use getset::Getters;
use tracing::instrument;

use crate::{error::ProverError, keygen::ConstraintSystem};

/// Full assignment of a circuit: the instance vector, led by the constant one, and the private
/// witness vector.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
pub struct Witness<F: PrimeField> {
    #[getset(get = "pub")]
    instance: Vec<F>,
    #[getset(get = "pub")]
    witness: Vec<F>,
}

/// Public inputs only, in the order the verifying key expects them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicWitness<F: PrimeField>(pub Vec<F>);

impl<F: PrimeField> Witness<F> {
    /// Synthesizes the assignment of `circuit` without building constraint matrices.
    #[instrument(name = "generate_witness", level = "info", skip_all)]
    pub fn new<C: ConstraintSynthesizer<F>>(circuit: C) -> Result<Self, SynthesisError> {
        let cs = r1cs::ConstraintSystem::new_ref();
        cs.set_optimization_goal(OptimizationGoal::Constraints);
        cs.set_mode(SynthesisMode::Prove {
            construct_matrices: false,
        });
        circuit.generate_constraints(cs.clone())?;
        cs.finalize();
        let inner = cs.borrow().ok_or(SynthesisError::MissingCS)?;
        Ok(Self {
            instance: inner.instance_assignment.clone(),
            witness: inner.witness_assignment.clone(),
        })
    }

    /// Builds an assignment from public and private values directly.
    pub fn from_assignment(public: Vec<F>, witness: Vec<F>) -> Self {
        let mut instance = Vec::with_capacity(public.len() + 1);
        instance.push(F::one());
        instance.extend(public);
        Self { instance, witness }
    }

    pub fn public(&self) -> PublicWitness<F> {
        PublicWitness(self.instance[1..].to_vec())
    }

    pub(crate) fn check_shape(&self, cs: &ConstraintSystem<F>) -> Result<(), ProverError> {
        if self.instance.len() != cs.num_instance_variables()
            || self.witness.len() != cs.num_witness_variables()
            || self.instance.first() != Some(&F::one())
        {
            return Err(ProverError::WitnessShape {
                expected_instance: cs.num_instance_variables(),
                expected_witness: cs.num_witness_variables(),
                instance: self.instance.len(),
                witness: self.witness.len(),
            });
        }
        Ok(())
    }
}

impl<F: PrimeField> PublicWitness<F> {
    pub fn values(&self) -> &[F] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use ark_bn254::Fr;

    use super::*;
    use crate::{keygen::compile, test_utils::CubicCircuit};

    #[test]
    fn test_cubic_assignment() {
        let w = Witness::new(CubicCircuit::new(Fr::from(3u64), Fr::from(35u64), 2)).unwrap();
        assert_eq!(w.instance(), &vec![Fr::from(1u64), Fr::from(35u64)]);
        assert_eq!(
            w.witness(),
            &vec![Fr::from(3u64), Fr::from(9u64), Fr::from(27u64)]
        );
        assert_eq!(w.public().values(), &[Fr::from(35u64)]);
    }

    #[test]
    fn test_shape_mismatch() {
        let cs = compile::<Fr, _>(CubicCircuit::<Fr>::new_blank(1)).unwrap();
        let w = Witness::from_assignment(vec![Fr::from(35u64)], vec![Fr::from(3u64)]);
        assert!(matches!(
            cs.is_satisfied_by(&w),
            Err(ProverError::WitnessShape {
                expected_witness: 3,
                witness: 1,
                ..
            })
        ));
    }
}
