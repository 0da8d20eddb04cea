//! C3: SSS codec. Shamir-style `(k, N)` split/reconstruct over a prime field
//! on fixed-size byte chunks, grounded in `examples/original_source/client/sam/sss.py`'s
//! 3-byte-chunk scheme.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::codec::tensor;
use crate::error::ReconstructError;
use crate::types::ParameterMap;

/// Bytes per secret chunk. `PRIME` must exceed `2^(8*CHUNK_SIZE)`.
const CHUNK_SIZE: usize = 3;
/// A Mersenne prime, comfortably larger than `2^24`.
const PRIME: u64 = 2_147_483_647;

/// One of the `N` self-describing blobs produced by `split`. Each bundle
/// carries every chunk's share point for a single polynomial share index, so
/// bundles from different splits (different `bundle_id`) must never be mixed
/// during reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareBundle {
    bundle_id: u64,
    share_index: u32,
    k: u32,
    total_length: usize,
    points: Vec<(u32, u64)>,
}

impl ShareBundle {
    pub fn share_index(&self) -> u32 {
        self.share_index
    }
}

fn mod_pow(mut base: u64, mut exp: u64, modulus: u64) -> u64 {
    let mut result = 1u64;
    base %= modulus;
    while exp > 0 {
        if exp & 1 == 1 {
            result = (result as u128 * base as u128 % modulus as u128) as u64;
        }
        exp >>= 1;
        base = (base as u128 * base as u128 % modulus as u128) as u64;
    }
    result
}

fn mod_inv(a: u64, modulus: u64) -> u64 {
    // Fermat's little theorem; `modulus` is prime.
    mod_pow(a % modulus, modulus - 2, modulus)
}

fn mod_add(a: u64, b: u64, modulus: u64) -> u64 {
    (a + b) % modulus
}

fn mod_mul(a: u64, b: u64, modulus: u64) -> u64 {
    (a as u128 * b as u128 % modulus as u128) as u64
}

fn eval_polynomial(coeffs: &[u64], x: u64, modulus: u64) -> u64 {
    let mut acc = 0u64;
    let mut pow = 1u64;
    for &c in coeffs {
        acc = mod_add(acc, mod_mul(c, pow, modulus), modulus);
        pow = mod_mul(pow, x, modulus);
    }
    acc
}

/// Splits `pmap` into `n` bundles with reconstruction threshold `k`. Each
/// chunk's polynomial coefficients (above the constant term) are drawn
/// independently at random, so fewer than `k` bundles carry zero information
/// about any given chunk's secret value.
pub fn split(pmap: &ParameterMap, k: u32, n: u32) -> Vec<ShareBundle> {
    assert!(k >= 1 && n >= k, "SSS requires 1 <= k <= n");

    let encoded = tensor::encode(pmap);
    let total_length = encoded.len();
    let bundle_id: u64 = rand::thread_rng().gen();

    let mut points_per_share: Vec<Vec<(u32, u64)>> = (0..n).map(|_| Vec::new()).collect();

    let mut rng = rand::thread_rng();
    for (chunk_index, chunk) in encoded.chunks(CHUNK_SIZE).enumerate() {
        let mut padded = [0u8; CHUNK_SIZE];
        padded[..chunk.len()].copy_from_slice(chunk);
        let secret = padded
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64);

        let mut coeffs = vec![secret];
        for _ in 1..k {
            coeffs.push(rng.gen_range(1..PRIME));
        }

        for share_index in 1..=n {
            let y = eval_polynomial(&coeffs, share_index as u64, PRIME);
            points_per_share[(share_index - 1) as usize].push((chunk_index as u32, y));
        }
    }

    points_per_share
        .into_iter()
        .enumerate()
        .map(|(i, points)| ShareBundle {
            bundle_id,
            share_index: (i + 1) as u32,
            k,
            total_length,
            points,
        })
        .collect()
}

/// Reconstructs `pmap` from at least `k` bundles produced by the same
/// `split` call. Any further bundles beyond `k` are ignored.
pub fn reconstruct(bundles: &[ShareBundle]) -> Result<ParameterMap, ReconstructError> {
    if bundles.is_empty() {
        return Err(ReconstructError::InsufficientShares { k: 1, got: 0 });
    }
    let k = bundles[0].k as usize;
    if bundles.len() < k {
        return Err(ReconstructError::InsufficientShares {
            k,
            got: bundles.len(),
        });
    }
    let bundle_id = bundles[0].bundle_id;
    if bundles.iter().any(|b| b.bundle_id != bundle_id) {
        return Err(ReconstructError::MixedBundles);
    }

    let chosen = &bundles[..k];
    let total_length = chosen[0].total_length;
    let num_chunks = chosen[0].points.len();

    let mut out = Vec::with_capacity(num_chunks * CHUNK_SIZE);
    for chunk_index in 0..num_chunks {
        let xs_ys: Vec<(u64, u64)> = chosen
            .iter()
            .map(|b| {
                let (_, y) = b.points[chunk_index];
                (b.share_index as u64, y)
            })
            .collect();

        let mut secret = 0u64;
        for (i, &(xi, yi)) in xs_ys.iter().enumerate() {
            let mut num = 1i128;
            let mut den = 1i128;
            for (j, &(xj, _)) in xs_ys.iter().enumerate() {
                if i == j {
                    continue;
                }
                num = (num * (0 - xj as i128)).rem_euclid(PRIME as i128);
                den = (den * (xi as i128 - xj as i128)).rem_euclid(PRIME as i128);
            }
            let lagrange_coeff = mod_mul(num as u64, mod_inv(den as u64, PRIME), PRIME);
            secret = mod_add(secret, mod_mul(yi, lagrange_coeff, PRIME), PRIME);
        }

        let bytes = secret.to_be_bytes();
        out.extend_from_slice(&bytes[bytes.len() - CHUNK_SIZE..]);
    }

    out.truncate(total_length);
    if out.len() != total_length {
        return Err(ReconstructError::LengthMismatch {
            expected: total_length,
            actual: out.len(),
        });
    }

    tensor::decode(&out).map_err(|_| ReconstructError::LengthMismatch {
        expected: total_length,
        actual: out.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DType, Tensor};

    fn sample_map() -> ParameterMap {
        let mut map = ParameterMap::new();
        map.insert(
            "w",
            Tensor::new(DType::F32, vec![4], (0..16u8).collect()),
        );
        map
    }

    #[test]
    fn reconstructs_from_exactly_k_bundles() {
        let map = sample_map();
        let bundles = split(&map, 2, 3);
        let chosen = vec![bundles[0].clone(), bundles[2].clone()];
        let reconstructed = reconstruct(&chosen).unwrap();
        assert_eq!(map, reconstructed);
    }

    #[test]
    fn reconstructs_from_any_k_of_n_combination() {
        let map = sample_map();
        let bundles = split(&map, 3, 5);
        for combo in [[0, 1, 2], [1, 2, 4], [0, 3, 4]] {
            let chosen: Vec<_> = combo.iter().map(|&i| bundles[i].clone()).collect();
            assert_eq!(reconstruct(&chosen).unwrap(), map);
        }
    }

    #[test]
    fn fewer_than_k_bundles_errors() {
        let map = sample_map();
        let bundles = split(&map, 3, 5);
        let chosen = vec![bundles[0].clone(), bundles[1].clone()];
        assert!(reconstruct(&chosen).is_err());
    }

    #[test]
    fn mixed_bundles_from_different_splits_are_rejected() {
        let map = sample_map();
        let bundles_a = split(&map, 2, 3);
        let bundles_b = split(&map, 2, 3);
        let mixed = vec![bundles_a[0].clone(), bundles_b[1].clone()];
        assert!(matches!(
            reconstruct(&mixed),
            Err(ReconstructError::MixedBundles)
        ));
    }
}
