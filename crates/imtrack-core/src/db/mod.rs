//! Compiled feature database: per-target scale levels of described
//! keypoints, the binary codec, and the LSH bucket tables built at load time.

pub mod codec;
pub mod lsh;

use log::debug;
use nalgebra::Vector2;

use crate::error::CorruptDatabaseError;
use crate::hd::{HdEncoder, MAX_DESCRIPTOR_WORDS, MAX_HD_DIMENSIONS, generate_basis};

pub use codec::{FORMAT_VERSION, MAGIC, decode, encode};
pub use lsh::{BucketTable, bucket_key};

/// Keypoint of one pyramid level, in that level's pixel space.
#[derive(Debug, Clone, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub descriptor: Vec<u32>,
    pub signature: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseLevel {
    pub scale: f32,
    pub keypoints: Vec<Keypoint>,
}

impl DatabaseLevel {
    /// Position of keypoint `index` on the target plane, in original target
    /// pixels.
    pub fn world_point(&self, index: usize) -> Vector2<f64> {
        let kp = &self.keypoints[index];
        let scale = self.scale as f64;
        Vector2::new(kp.x as f64 / scale, kp.y as f64 / scale)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetDatabase {
    pub target_index: usize,
    pub width: u32,
    pub height: u32,
    pub levels: Vec<DatabaseLevel>,
}

impl TargetDatabase {
    pub fn keypoint_count(&self) -> usize {
        self.levels.iter().map(|l| l.keypoints.len()).sum()
    }
}

/// Every compiled target plus the parameters needed to regenerate the
/// hyperdimensional basis the signatures were computed with.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureDatabase {
    pub descriptor_words: usize,
    pub signature_words: usize,
    pub hd_seed: u64,
    pub hd_dimensions: usize,
    pub targets: Vec<TargetDatabase>,
}

impl FeatureDatabase {
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CorruptDatabaseError> {
        decode(bytes)
    }

    pub fn signature_bits(&self) -> usize {
        self.signature_words * 32
    }

    /// Regenerates the basis from the stored seed and dimension count.
    pub fn encoder(&self) -> Result<HdEncoder, CorruptDatabaseError> {
        let signature_bits = self.signature_bits();
        if self.hd_dimensions == 0 || signature_bits == 0 || self.hd_dimensions % signature_bits != 0 {
            return Err(CorruptDatabaseError::InvalidLayout(format!(
                "{} hypervector dimensions cannot fold into {} signature bits",
                self.hd_dimensions, signature_bits
            )));
        }
        if self.hd_dimensions > MAX_HD_DIMENSIONS {
            return Err(CorruptDatabaseError::InvalidLayout(format!(
                "basis of {} dimensions (at most {MAX_HD_DIMENSIONS})",
                self.hd_dimensions
            )));
        }
        if self.descriptor_words == 0 || self.descriptor_words > MAX_DESCRIPTOR_WORDS {
            return Err(CorruptDatabaseError::InvalidLayout(format!(
                "descriptor length of {} words",
                self.descriptor_words
            )));
        }
        let basis = generate_basis(self.hd_seed, self.hd_dimensions, self.descriptor_words * 32);
        debug!(
            target: "imtrack_core::db",
            "Regenerated basis ({} dims, seed {:#x}) for {} targets",
            self.hd_dimensions,
            self.hd_seed,
            self.targets.len()
        );
        Ok(HdEncoder::new(basis, signature_bits))
    }
}
