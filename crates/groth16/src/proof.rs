//! Inputs and outputs of the MSM stage, and their combination into a proof.

use ark_ec::{pairing::Pairing, AffineRepr, CurveGroup};
use ark_ff::{PrimeField, Zero};
use ark_groth16::{Proof, ProvingKey};
use getset::Getters;

use crate::witness::Witness;

/// Scalar vectors of the five proving-key MSMs.
///
/// `assignment` is the instance without its leading one, followed by the witness. It multiplies
/// the non-constant tails of `a_query`, `b_g1_query` and `b_g2_query`. Its witness suffix
/// multiplies `l_query`, and `h` multiplies `h_query`.
#[derive(Clone, Debug, Getters)]
pub struct MsmScalars<F: PrimeField> {
    #[getset(get = "pub")]
    assignment: Vec<F>,
    num_public: usize,
    #[getset(get = "pub")]
    h: Vec<F>,
}

impl<F: PrimeField> MsmScalars<F> {
    /// `h` is truncated to `h_len`, the length of the key's `h_query`.
    pub fn new(witness: &Witness<F>, mut h: Vec<F>, h_len: usize) -> Self {
        h.truncate(h_len);
        let num_public = witness.instance().len() - 1;
        let assignment = witness.instance()[1..]
            .iter()
            .chain(witness.witness())
            .copied()
            .collect();
        Self {
            assignment,
            num_public,
            h,
        }
    }

    pub fn witness(&self) -> &[F] {
        &self.assignment[self.num_public..]
    }
}

/// Results of the five MSMs, before blinding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsmOutputs<E: Pairing> {
    /// `sum a_query[i+1] * assignment[i]`
    pub a: E::G1,
    /// `sum b_g1_query[i+1] * assignment[i]`
    pub b_g1: E::G1,
    /// `sum b_g2_query[i+1] * assignment[i]`
    pub b_g2: E::G2,
    /// `sum h_query[i] * h[i]`
    pub h: E::G1,
    /// `sum l_query[i] * witness[i]`
    pub l: E::G1,
}

/// Assembles the proof from the MSM outputs and the blinding factors `r` and `s`.
pub fn combine<E: Pairing>(
    pk: &ProvingKey<E>,
    outputs: &MsmOutputs<E>,
    r: E::ScalarField,
    s: E::ScalarField,
) -> Proof<E> {
    let vk = &pk.vk;
    let a = pk.delta_g1 * r
        + pk.a_query[0].into_group()
        + outputs.a
        + vk.alpha_g1.into_group();
    let b_g2 = vk.delta_g2 * s
        + pk.b_g2_query[0].into_group()
        + outputs.b_g2
        + vk.beta_g2.into_group();
    let b_g1 = if r.is_zero() {
        E::G1::zero()
    } else {
        pk.delta_g1 * s
            + pk.b_g1_query[0].into_group()
            + outputs.b_g1
            + pk.beta_g1.into_group()
    };
    let c = a * s + b_g1 * r - pk.delta_g1 * (r * s) + outputs.l + outputs.h;
    Proof {
        a: a.into_affine(),
        b: b_g2.into_affine(),
        c: c.into_affine(),
    }
}
