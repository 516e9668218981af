//! Hyperdimensional signatures for binary descriptors.
//!
//! A descriptor is read as a bipolar vector (bit 1 = +1, bit 0 = -1) and
//! projected onto a fixed set of random bipolar basis vectors. The sign of
//! each projection gives one bit of the hypervector; folding groups of
//! hypervector bits by majority vote yields a short signature whose Hamming
//! distance approximately follows the descriptor distance.

use log::debug;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Largest basis a database may ask for.
pub const MAX_HD_DIMENSIONS: usize = 1 << 16;
/// Largest descriptor a basis is generated for, in 32-bit words.
pub const MAX_DESCRIPTOR_WORDS: usize = 64;

/// Random bipolar basis, regenerated from `(seed, dimensions, descriptor_bits)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdBasis {
    seed: u64,
    descriptor_bits: usize,
    vectors: Vec<Vec<u32>>,
}

impl HdBasis {
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn dimensions(&self) -> usize {
        self.vectors.len()
    }

    pub fn descriptor_bits(&self) -> usize {
        self.descriptor_bits
    }

    pub fn descriptor_words(&self) -> usize {
        words_for_bits(self.descriptor_bits)
    }

    pub fn vectors(&self) -> &[Vec<u32>] {
        &self.vectors
    }
}

/// Projected descriptor, one bit per basis dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hypervector {
    dimensions: usize,
    bits: Vec<u32>,
}

impl Hypervector {
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn words(&self) -> &[u32] {
        &self.bits
    }

    /// Returns the bipolar component (+1 / -1) for `dimension`.
    pub fn component(&self, dimension: usize) -> i8 {
        if bit(&self.bits, dimension) { 1 } else { -1 }
    }
}

/// Generates the projection basis. Pure in its inputs: equal arguments give
/// bit-identical vectors in every process and across builds, since ChaCha8
/// output is fixed for a seed.
pub fn generate_basis(seed: u64, dimension_count: usize, descriptor_bits: usize) -> HdBasis {
    assert!(dimension_count > 0, "basis needs at least one dimension");
    assert!(descriptor_bits > 0, "descriptor length must be positive");

    let words = words_for_bits(descriptor_bits);
    let tail = tail_mask(descriptor_bits);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let vectors = (0..dimension_count)
        .map(|_| {
            let mut vector: Vec<u32> = (0..words).map(|_| rng.next_u32()).collect();
            if let Some(last) = vector.last_mut() {
                *last &= tail;
            }
            vector
        })
        .collect();

    debug!(
        target: "imtrack_core::hd",
        "Generated {} basis vectors of {} bits (seed {:#x})",
        dimension_count,
        descriptor_bits,
        seed
    );

    HdBasis {
        seed,
        descriptor_bits,
        vectors,
    }
}

/// Signed projection of `descriptor` onto every basis vector, collapsed to
/// one bit per dimension. Zero projections map to +1.
///
/// Panics when the descriptor length does not match the basis.
pub fn project_descriptor(descriptor: &[u32], basis: &HdBasis) -> Hypervector {
    assert_eq!(
        descriptor.len(),
        basis.descriptor_words(),
        "descriptor has {} words but the basis expects {}",
        descriptor.len(),
        basis.descriptor_words()
    );

    let n = basis.descriptor_bits as i64;
    let tail = tail_mask(basis.descriptor_bits);
    let last = descriptor.len() - 1;
    let dimensions = basis.dimensions();
    let mut bits = vec![0u32; words_for_bits(dimensions)];

    for (dim, vector) in basis.vectors.iter().enumerate() {
        let mut disagreements = 0i64;
        for (i, (&d, &b)) in descriptor.iter().zip(vector.iter()).enumerate() {
            let mut diff = d ^ b;
            if i == last {
                diff &= tail;
            }
            disagreements += diff.count_ones() as i64;
        }
        // <x, b> over bipolar vectors = agreements - disagreements
        let dot = n - 2 * disagreements;
        if dot >= 0 {
            bits[dim / 32] |= 1 << (dim % 32);
        }
    }

    Hypervector { dimensions, bits }
}

/// Folds consecutive groups of hypervector bits into one signature bit by
/// majority vote. A tied group takes the value of its first bit.
///
/// Panics when `signature_bits` does not divide the hypervector dimension.
pub fn compress_to_signature(hypervector: &Hypervector, signature_bits: usize) -> Vec<u32> {
    assert!(signature_bits > 0, "signature must have at least one bit");
    assert_eq!(
        hypervector.dimensions % signature_bits,
        0,
        "signature bits ({signature_bits}) must divide hypervector dimension ({})",
        hypervector.dimensions
    );

    let group = hypervector.dimensions / signature_bits;
    let mut signature = vec![0u32; words_for_bits(signature_bits)];
    for out in 0..signature_bits {
        let start = out * group;
        let ones = (start..start + group)
            .filter(|&i| bit(&hypervector.bits, i))
            .count();
        let set = match (2 * ones).cmp(&group) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => bit(&hypervector.bits, start),
        };
        if set {
            signature[out / 32] |= 1 << (out % 32);
        }
    }
    signature
}

/// Descriptor → signature in one call, bound to a basis.
#[derive(Debug, Clone)]
pub struct HdEncoder {
    basis: HdBasis,
    signature_bits: usize,
}

impl HdEncoder {
    pub fn new(basis: HdBasis, signature_bits: usize) -> Self {
        assert_eq!(
            basis.dimensions() % signature_bits,
            0,
            "signature bits must divide the basis dimension"
        );
        Self {
            basis,
            signature_bits,
        }
    }

    pub fn basis(&self) -> &HdBasis {
        &self.basis
    }

    pub fn signature_bits(&self) -> usize {
        self.signature_bits
    }

    pub fn signature_words(&self) -> usize {
        words_for_bits(self.signature_bits)
    }

    pub fn signature(&self, descriptor: &[u32]) -> Vec<u32> {
        let hv = project_descriptor(descriptor, &self.basis);
        compress_to_signature(&hv, self.signature_bits)
    }
}

pub fn hamming_distance(a: &[u32], b: &[u32]) -> u32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

pub fn words_for_bits(bits: usize) -> usize {
    bits.div_ceil(32)
}

fn tail_mask(bits: usize) -> u32 {
    match bits % 32 {
        0 => u32::MAX,
        rem => (1u32 << rem) - 1,
    }
}

#[inline]
fn bit(words: &[u32], index: usize) -> bool {
    words[index / 32] >> (index % 32) & 1 == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn signature(basis: &HdBasis, descriptor: &[u32]) -> Vec<u32> {
        compress_to_signature(&project_descriptor(descriptor, basis), 128)
    }

    #[test]
    fn basis_is_reproducible() {
        let a = generate_basis(42, 256, 64);
        let b = generate_basis(42, 256, 64);
        assert_eq!(a, b);
        assert_ne!(a, generate_basis(43, 256, 64));
    }

    #[test]
    fn basis_words_are_pinned_for_a_seed() {
        // Stored signatures were produced from these words; they must never drift.
        let basis = generate_basis(7, 2, 256);
        assert_eq!(
            basis.vectors()[0][..4],
            [0x23d7_43bb, 0x2865_5334, 0x2e9b_293a, 0x2b01_59d3]
        );
        assert_eq!(basis.vectors()[0][7], 0xba0b_b7b6);
        assert_eq!(basis.vectors()[1][0], 0x1237_db88);
    }

    #[test]
    fn basis_masks_unused_tail_bits() {
        let basis = generate_basis(1, 32, 40);
        assert!(basis.vectors().iter().all(|v| v.len() == 2 && v[1] >> 8 == 0));
    }

    #[test]
    fn projection_and_compression_are_deterministic() {
        let basis = generate_basis(9, 512, 256);
        let descriptor = [0xDEAD_BEEF, 1, 2, 3, 4, 5, 6, 0xFFFF_0000];
        let hv = project_descriptor(&descriptor, &basis);
        assert_eq!(hv, project_descriptor(&descriptor, &basis));
        assert_eq!(hv.dimensions(), 512);
        assert_eq!(
            compress_to_signature(&hv, 128),
            compress_to_signature(&hv, 128)
        );
    }

    #[test]
    fn signature_distance_follows_descriptor_distance() {
        let basis = generate_basis(0x5EED, 1024, 64);
        let x = [0xFFFF_FFFF, 0xFFFF_FFFF];
        let y = [0xFFFF_FFFE, 0xFFFF_FFFF];
        let z = [0, 0];

        let sx = signature(&basis, &x);
        let near = hamming_distance(&sx, &signature(&basis, &y));
        let far = hamming_distance(&sx, &signature(&basis, &z));
        assert!(near < far, "near {near} should be below far {far}");
    }

    #[test]
    fn random_neighbours_stay_closer_than_strangers() {
        let basis = generate_basis(3, 1024, 256);
        let mut rng = SmallRng::seed_from_u64(11);
        let mut closer = 0;
        for _ in 0..20 {
            let x: Vec<u32> = (0..8).map(|_| rng.r#gen()).collect();
            let mut y = x.clone();
            for _ in 0..8 {
                let b = rng.gen_range(0..256);
                y[b / 32] ^= 1 << (b % 32);
            }
            let z: Vec<u32> = (0..8).map(|_| rng.r#gen()).collect();
            let sx = signature(&basis, &x);
            if hamming_distance(&sx, &signature(&basis, &y))
                < hamming_distance(&sx, &signature(&basis, &z))
            {
                closer += 1;
            }
        }
        assert!(closer >= 18, "only {closer}/20 neighbours were closer");
    }

    #[test]
    #[should_panic]
    fn projection_rejects_length_mismatch() {
        let basis = generate_basis(1, 64, 256);
        project_descriptor(&[0u32; 4], &basis);
    }

    #[test]
    fn encoder_produces_fixed_width_signatures() {
        let encoder = HdEncoder::new(generate_basis(5, 1024, 256), 128);
        let sig = encoder.signature(&[7u32; 8]);
        assert_eq!(sig.len(), encoder.signature_words());
        assert_eq!(sig.len(), 4);
    }
}
