//! Host implementations of the MSM kernels.
//!
//! These run inside device kernels: the bucket method on accelerator devices, arkworks'
//! `VariableBaseMSM` on CPU devices. Both accept bases expanded by [expand_bases], laid out as
//! `factor` blocks of `n` points where block `j` holds `2^(j*l) * P_i`.

use ark_ec::{CurveGroup, VariableBaseMSM};
use ark_ff::{BigInteger, PrimeField, Zero};
use rayon::prelude::*;

/// Bits of scalar handled by each block of precomputed bases.
pub fn chunk_bits<F: PrimeField>(factor: usize) -> usize {
    (F::MODULUS_BIT_SIZE as usize).div_ceil(factor)
}

/// Window size for a bucket MSM over `size` terms.
pub fn default_window_bits(size: usize) -> usize {
    if size < 32 {
        3
    } else {
        // ~ ln(size) + 2
        let log2 = (usize::BITS - size.leading_zeros()) as usize;
        log2 * 69 / 100 + 2
    }
}

/// Expands each base `P` into `[P, 2^l P, ..., 2^((factor-1) l) P]`.
pub fn expand_bases<G: CurveGroup>(bases: &[G::Affine], factor: usize) -> Vec<G::Affine> {
    if factor == 1 {
        return bases.to_vec();
    }
    let l = chunk_bits::<G::ScalarField>(factor);
    let n = bases.len();
    let columns: Vec<Vec<G>> = bases
        .par_iter()
        .map(|base| {
            let mut current: G = (*base).into();
            let mut column = Vec::with_capacity(factor);
            for _ in 0..factor {
                column.push(current);
                for _ in 0..l {
                    current.double_in_place();
                }
            }
            column
        })
        .collect();

    let mut expanded = vec![G::zero(); n * factor];
    for (i, column) in columns.into_iter().enumerate() {
        for (j, point) in column.into_iter().enumerate() {
            expanded[j * n + i] = point;
        }
    }
    G::normalize_batch(&expanded)
}

/// Bucket (Pippenger) MSM, parallel over windows.
///
/// `bases.len()` must be `scalars.len() * factor`.
pub fn bucket_msm<G: CurveGroup>(
    scalars: &[G::ScalarField],
    bases: &[G::Affine],
    factor: usize,
    window_bits: usize,
) -> G {
    let n = scalars.len();
    debug_assert_eq!(bases.len(), n * factor);
    let bigints: Vec<_> = scalars.par_iter().map(|s| s.into_bigint()).collect();

    let l = chunk_bits::<G::ScalarField>(factor);
    let c = if window_bits == 0 {
        default_window_bits(n * factor)
    } else {
        window_bits
    };
    let num_windows = l.div_ceil(c);

    let window_sums: Vec<G> = (0..num_windows)
        .into_par_iter()
        .map(|w| {
            let start = w * c;
            let width = c.min(l - start);
            let mut buckets = vec![G::zero(); (1 << width) - 1];
            for j in 0..factor {
                let offset = j * l + start;
                let block = &bases[j * n..(j + 1) * n];
                for (scalar, base) in bigints.iter().zip(block) {
                    let digit = window_digit(scalar.as_ref(), offset, width);
                    if digit != 0 {
                        buckets[digit - 1] += *base;
                    }
                }
            }
            // sum_{d} d * bucket[d] via running sums
            let mut running = G::zero();
            let mut sum = G::zero();
            for bucket in buckets.into_iter().rev() {
                running += bucket;
                sum += running;
            }
            sum
        })
        .collect();

    let lowest = window_sums.first().copied().unwrap_or_else(G::zero);
    lowest
        + window_sums[1..]
            .iter()
            .rev()
            .fold(G::zero(), |mut total, sum| {
                total += sum;
                for _ in 0..c {
                    total.double_in_place();
                }
                total
            })
}

/// MSM through arkworks, accepting the same expanded base layout as [bucket_msm].
pub fn ark_msm<G: CurveGroup>(scalars: &[G::ScalarField], bases: &[G::Affine], factor: usize) -> G {
    if factor == 1 {
        return G::msm_unchecked(bases, scalars);
    }
    let l = chunk_bits::<G::ScalarField>(factor);
    let bits: Vec<Vec<bool>> = scalars
        .par_iter()
        .map(|s| s.into_bigint().to_bits_le())
        .collect();
    let chunks: Vec<<G::ScalarField as PrimeField>::BigInt> = (0..factor)
        .flat_map(|j| {
            bits.iter().map(move |b| {
                let lo = (j * l).min(b.len());
                let hi = ((j + 1) * l).min(b.len());
                <G::ScalarField as PrimeField>::BigInt::from_bits_le(&b[lo..hi])
            })
        })
        .collect();
    G::msm_bigint(bases, &chunks)
}

/// Bits `[offset, offset + width)` of a little-endian limb array.
fn window_digit(limbs: &[u64], offset: usize, width: usize) -> usize {
    let limb = offset / 64;
    let shift = offset % 64;
    if limb >= limbs.len() {
        return 0;
    }
    let mut value = limbs[limb] >> shift;
    if shift + width > 64 && limb + 1 < limbs.len() {
        value |= limbs[limb + 1] << (64 - shift);
    }
    (value & ((1u64 << width) - 1)) as usize
}

#[cfg(test)]
mod tests {
    use ark_bn254::{Fr, G1Affine, G1Projective};
    use ark_ec::AffineRepr;
    use ark_ff::UniformRand;
    use rand::{rngs::StdRng, SeedableRng};
    use test_case::test_case;

    use super::*;

    fn naive(scalars: &[Fr], bases: &[G1Affine]) -> G1Projective {
        scalars
            .iter()
            .zip(bases)
            .map(|(s, b)| b.mul_bigint(s.into_bigint()))
            .sum()
    }

    fn inputs(n: usize) -> (Vec<Fr>, Vec<G1Affine>) {
        let mut rng = StdRng::from_seed([7; 32]);
        let scalars = (0..n).map(|_| Fr::rand(&mut rng)).collect();
        let bases = (0..n).map(|_| G1Affine::rand(&mut rng)).collect();
        (scalars, bases)
    }

    #[test]
    fn test_window_digit_crosses_limbs() {
        let limbs = [0xF000_0000_0000_0000u64, 0b1011];
        assert_eq!(window_digit(&limbs, 60, 8), 0xBF);
        assert_eq!(window_digit(&limbs, 0, 4), 0);
        assert_eq!(window_digit(&limbs, 200, 4), 0);
    }

    #[test_case(1, 1, 0)]
    #[test_case(5, 1, 3)]
    #[test_case(64, 1, 0)]
    #[test_case(64, 2, 0)]
    #[test_case(33, 3, 5)]
    #[test_case(100, 8, 0)]
    fn test_bucket_msm_matches_naive(n: usize, factor: usize, window_bits: usize) {
        let (scalars, bases) = inputs(n);
        let expanded = expand_bases::<G1Projective>(&bases, factor);
        let got: G1Projective = bucket_msm(&scalars, &expanded, factor, window_bits);
        assert_eq!(got, naive(&scalars, &bases));
    }

    #[test_case(17, 1)]
    #[test_case(17, 4)]
    fn test_ark_msm_with_precompute(n: usize, factor: usize) {
        let (scalars, bases) = inputs(n);
        let expanded = expand_bases::<G1Projective>(&bases, factor);
        let got: G1Projective = ark_msm(&scalars, &expanded, factor);
        assert_eq!(got, naive(&scalars, &bases));
    }

    #[test]
    fn test_edge_scalars() {
        let (_, bases) = inputs(4);
        let scalars = vec![Fr::zero(), Fr::from(1u64), -Fr::from(1u64), Fr::from(2u64)];
        let got: G1Projective = bucket_msm(&scalars, &bases, 1, 4);
        assert_eq!(got, naive(&scalars, &bases));
        assert!(bucket_msm::<G1Projective>(&[Fr::zero()], &[G1Affine::generator()], 1, 0).is_zero());
    }
}
