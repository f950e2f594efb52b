use ark_ff::{Field, PrimeField};
use ark_relations::{
    lc,
    r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError, Variable},
};

/// Proves knowledge of a secret `x` with `x^3 + x + 5 == y`, for public `y`.
///
/// The equality is asserted `repetitions` times so the constraint count, and with it the MSM
/// sizes, scale with a single parameter.
#[derive(Clone, Copy, Debug)]
pub struct CubicCircuit<F: PrimeField> {
    pub x: Option<F>,
    pub y: Option<F>,
    pub repetitions: usize,
}

impl<F: PrimeField> CubicCircuit<F> {
    pub fn new(x: F, y: F, repetitions: usize) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            repetitions,
        }
    }

    /// Circuit without an assignment, for compilation and setup.
    pub fn new_blank(repetitions: usize) -> Self {
        Self {
            x: None,
            y: None,
            repetitions,
        }
    }
}

impl<F: PrimeField> ConstraintSynthesizer<F> for CubicCircuit<F> {
    fn generate_constraints(self, cs: ConstraintSystemRef<F>) -> Result<(), SynthesisError> {
        let x_val = self.x;
        let x2_val = x_val.map(|x| x.square());
        let x3_val = x_val.zip(x2_val).map(|(x, x2)| x * x2);

        let x = cs.new_witness_variable(|| x_val.ok_or(SynthesisError::AssignmentMissing))?;
        let y = cs.new_input_variable(|| self.y.ok_or(SynthesisError::AssignmentMissing))?;
        let x2 = cs.new_witness_variable(|| x2_val.ok_or(SynthesisError::AssignmentMissing))?;
        let x3 = cs.new_witness_variable(|| x3_val.ok_or(SynthesisError::AssignmentMissing))?;

        cs.enforce_constraint(lc!() + x, lc!() + x, lc!() + x2)?;
        cs.enforce_constraint(lc!() + x2, lc!() + x, lc!() + x3)?;
        for _ in 0..self.repetitions {
            cs.enforce_constraint(
                lc!() + x3 + x + (F::from(5u64), Variable::One),
                lc!() + Variable::One,
                lc!() + y,
            )?;
        }
        Ok(())
    }
}
