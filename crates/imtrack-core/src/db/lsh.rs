use std::collections::HashMap;

use log::trace;

use super::DatabaseLevel;

/// Bucket key: the lowest `bits` bits of the first signature word.
pub fn bucket_key(signature: &[u32], bits: u32) -> u32 {
    let word = signature.first().copied().unwrap_or(0);
    if bits >= 32 { word } else { word & ((1u32 << bits) - 1) }
}

/// Signature-bucket index over the keypoints of one database level.
///
/// Keypoints are inserted in stored order (strongest first, as compiled), so
/// a full bucket keeps the most distinctive keypoints and drops the rest.
#[derive(Debug, Clone, Default)]
pub struct BucketTable {
    bits: u32,
    capacity: usize,
    buckets: HashMap<u32, Vec<usize>>,
    dropped: usize,
}

impl BucketTable {
    pub fn build(level: &DatabaseLevel, bits: u32, capacity: usize) -> Self {
        let mut buckets: HashMap<u32, Vec<usize>> = HashMap::new();
        let mut dropped = 0;
        for (idx, kp) in level.keypoints.iter().enumerate() {
            let bucket = buckets.entry(bucket_key(&kp.signature, bits)).or_default();
            if bucket.len() < capacity {
                bucket.push(idx);
            } else {
                dropped += 1;
            }
        }
        trace!(
            target: "imtrack_core::db",
            "Bucketed {} keypoints into {} buckets ({} over capacity)",
            level.keypoints.len(),
            buckets.len(),
            dropped
        );
        Self {
            bits,
            capacity,
            buckets,
            dropped,
        }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Keypoints that did not fit into their bucket.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn bucket(&self, key: u32) -> &[usize] {
        self.buckets.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Candidate keypoint indices for a query signature. With `multi_probe`
    /// the buckets whose key differs from the query key in exactly one bit
    /// are visited as well. Each key maps to a distinct bucket, so the
    /// result never repeats an index.
    pub fn candidates(&self, signature: &[u32], multi_probe: bool, out: &mut Vec<usize>) {
        out.clear();
        let key = bucket_key(signature, self.bits);
        out.extend_from_slice(self.bucket(key));
        if multi_probe {
            for bit in 0..self.bits.min(32) {
                out.extend_from_slice(self.bucket(key ^ (1u32 << bit)));
            }
        }
    }
}
