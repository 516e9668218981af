//! Binary layout (all little-endian):
//!
//! ```text
//! magic "IMTKFDB\0" | version u16 | descriptor_words u16 | signature_words u16 | target_count u32
//! per target:  width u32 | height u32 | level_count u32
//! per level:   scale f32 | keypoint_count u32
//! per keypoint: x f32 | y f32 | descriptor u32 * descriptor_words | signature u32 * signature_words
//! trailer:     hd_seed u64 | hd_dimensions u32
//! checksum:    crc32 u32 over every preceding byte
//! ```

use crc32fast::Hasher;
use log::{debug, warn};

use super::{DatabaseLevel, FeatureDatabase, Keypoint, TargetDatabase};
use crate::error::CorruptDatabaseError;
use crate::hd::{MAX_DESCRIPTOR_WORDS, MAX_HD_DIMENSIONS};

pub const MAGIC: &[u8; 8] = b"IMTKFDB\0";
pub const FORMAT_VERSION: u16 = 1;

const HEADER_LEN: usize = MAGIC.len() + 2 + 2 + 2 + 4;
const TARGET_HEADER_LEN: usize = 12;
const LEVEL_HEADER_LEN: usize = 8;
const TRAILER_LEN: usize = 8 + 4;
const CHECKSUM_LEN: usize = 4;

pub fn encode(db: &FeatureDatabase) -> Vec<u8> {
    let keypoint_len = 8 + 4 * (db.descriptor_words + db.signature_words);
    let keypoints: usize = db.targets.iter().map(|t| t.keypoint_count()).sum();
    let levels: usize = db.targets.iter().map(|t| t.levels.len()).sum();
    let mut out = Vec::with_capacity(
        HEADER_LEN
            + db.targets.len() * TARGET_HEADER_LEN
            + levels * LEVEL_HEADER_LEN
            + keypoints * keypoint_len
            + TRAILER_LEN
            + CHECKSUM_LEN,
    );

    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(db.descriptor_words as u16).to_le_bytes());
    out.extend_from_slice(&(db.signature_words as u16).to_le_bytes());
    out.extend_from_slice(&(db.targets.len() as u32).to_le_bytes());

    for target in &db.targets {
        out.extend_from_slice(&target.width.to_le_bytes());
        out.extend_from_slice(&target.height.to_le_bytes());
        out.extend_from_slice(&(target.levels.len() as u32).to_le_bytes());
        for level in &target.levels {
            out.extend_from_slice(&level.scale.to_le_bytes());
            out.extend_from_slice(&(level.keypoints.len() as u32).to_le_bytes());
            for kp in &level.keypoints {
                debug_assert_eq!(kp.descriptor.len(), db.descriptor_words);
                debug_assert_eq!(kp.signature.len(), db.signature_words);
                out.extend_from_slice(&kp.x.to_le_bytes());
                out.extend_from_slice(&kp.y.to_le_bytes());
                for word in kp.descriptor.iter().chain(kp.signature.iter()) {
                    out.extend_from_slice(&word.to_le_bytes());
                }
            }
        }
    }

    out.extend_from_slice(&db.hd_seed.to_le_bytes());
    out.extend_from_slice(&(db.hd_dimensions as u32).to_le_bytes());

    let mut hasher = Hasher::new();
    hasher.update(&out);
    let checksum = hasher.finalize();
    out.extend_from_slice(&checksum.to_le_bytes());

    debug!(
        target: "imtrack_core::db",
        "Encoded {} targets / {} levels / {} keypoints into {} bytes",
        db.targets.len(),
        levels,
        keypoints,
        out.len()
    );
    out
}

pub fn decode(bytes: &[u8]) -> Result<FeatureDatabase, CorruptDatabaseError> {
    let mut reader = Reader::new(bytes);

    let magic = reader.take(MAGIC.len(), "magic")?;
    if magic != MAGIC {
        return Err(CorruptDatabaseError::BadMagic);
    }
    let version = reader.u16("version")?;
    if version != FORMAT_VERSION {
        warn!(target: "imtrack_core::db", "Refusing database format version {version}");
        return Err(CorruptDatabaseError::UnsupportedVersion {
            found: version,
            expected: FORMAT_VERSION,
        });
    }

    let descriptor_words = reader.u16("descriptor width")? as usize;
    let signature_words = reader.u16("signature width")? as usize;
    if descriptor_words == 0 || signature_words == 0 || descriptor_words > MAX_DESCRIPTOR_WORDS {
        return Err(CorruptDatabaseError::InvalidLayout(format!(
            "descriptor words {descriptor_words}, signature words {signature_words}"
        )));
    }
    let keypoint_len = 8 + 4 * (descriptor_words + signature_words);

    let target_count = reader.count("target count", TARGET_HEADER_LEN)?;
    let mut targets = Vec::with_capacity(target_count);
    for target_index in 0..target_count {
        let width = reader.u32("target width")?;
        let height = reader.u32("target height")?;
        let level_count = reader.count("level count", LEVEL_HEADER_LEN)?;
        let mut levels = Vec::with_capacity(level_count);
        for _ in 0..level_count {
            let scale = reader.f32("level scale")?;
            if !(scale.is_finite() && scale > 0.0) {
                return Err(CorruptDatabaseError::InvalidLayout(format!(
                    "target {target_index} has level scale {scale}"
                )));
            }
            let keypoint_count = reader.count("keypoint count", keypoint_len)?;
            let mut keypoints = Vec::with_capacity(keypoint_count);
            for _ in 0..keypoint_count {
                let x = reader.f32("keypoint x")?;
                let y = reader.f32("keypoint y")?;
                let descriptor = reader.words(descriptor_words, "descriptor")?;
                let signature = reader.words(signature_words, "signature")?;
                keypoints.push(Keypoint {
                    x,
                    y,
                    descriptor,
                    signature,
                });
            }
            levels.push(DatabaseLevel { scale, keypoints });
        }
        targets.push(TargetDatabase {
            target_index,
            width,
            height,
            levels,
        });
    }

    let hd_seed = reader.u64("basis seed")?;
    let hd_dimensions = reader.u32("basis dimensions")? as usize;
    if hd_dimensions == 0 || hd_dimensions > MAX_HD_DIMENSIONS {
        return Err(CorruptDatabaseError::InvalidLayout(format!(
            "basis of {hd_dimensions} dimensions (at most {MAX_HD_DIMENSIONS})"
        )));
    }

    let body_len = reader.position();
    let expected = reader.u32("checksum")?;
    if reader.remaining() > 0 {
        return Err(CorruptDatabaseError::TrailingBytes(reader.remaining()));
    }
    let mut hasher = Hasher::new();
    hasher.update(&bytes[..body_len]);
    let actual = hasher.finalize();
    if actual != expected {
        return Err(CorruptDatabaseError::ChecksumMismatch { expected, actual });
    }

    let db = FeatureDatabase {
        descriptor_words,
        signature_words,
        hd_seed,
        hd_dimensions,
        targets,
    };
    debug!(
        target: "imtrack_core::db",
        "Decoded {} targets ({} bytes)",
        db.targets.len(),
        bytes.len()
    );
    Ok(db)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize, context: &'static str) -> Result<&'a [u8], CorruptDatabaseError> {
        if len > self.remaining() {
            return Err(CorruptDatabaseError::Truncated {
                context,
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, context: &'static str) -> Result<[u8; N], CorruptDatabaseError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, context)?);
        Ok(out)
    }

    fn u16(&mut self, context: &'static str) -> Result<u16, CorruptDatabaseError> {
        Ok(u16::from_le_bytes(self.array(context)?))
    }

    fn u32(&mut self, context: &'static str) -> Result<u32, CorruptDatabaseError> {
        Ok(u32::from_le_bytes(self.array(context)?))
    }

    fn u64(&mut self, context: &'static str) -> Result<u64, CorruptDatabaseError> {
        Ok(u64::from_le_bytes(self.array(context)?))
    }

    fn f32(&mut self, context: &'static str) -> Result<f32, CorruptDatabaseError> {
        Ok(f32::from_le_bytes(self.array(context)?))
    }

    /// Reads an element count and checks the buffer can still hold that
    /// many elements of at least `min_element_len` bytes before anything is
    /// allocated for them.
    fn count(&mut self, context: &'static str, min_element_len: usize) -> Result<usize, CorruptDatabaseError> {
        let count = self.u32(context)? as usize;
        let needed = count.checked_mul(min_element_len).unwrap_or(usize::MAX);
        if needed > self.remaining() {
            return Err(CorruptDatabaseError::Truncated {
                context,
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(count)
    }

    fn words(&mut self, count: usize, context: &'static str) -> Result<Vec<u32>, CorruptDatabaseError> {
        let raw = self.take(count * 4, context)?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_database(targets: usize, levels: usize, keypoints: usize) -> FeatureDatabase {
        let mut seed = 0x1234_5678u32;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };
        FeatureDatabase {
            descriptor_words: 8,
            signature_words: 4,
            hd_seed: 99,
            hd_dimensions: 1024,
            targets: (0..targets)
                .map(|t| TargetDatabase {
                    target_index: t,
                    width: 320 + t as u32,
                    height: 240,
                    levels: (0..levels)
                        .map(|l| DatabaseLevel {
                            scale: 2f32.powf(-(l as f32) / 3.0),
                            keypoints: (0..keypoints)
                                .map(|k| Keypoint {
                                    x: k as f32 * 1.25 + 0.1,
                                    y: l as f32 * 3.5 + 0.7,
                                    descriptor: (0..8).map(|_| next()).collect(),
                                    signature: (0..4).map(|_| next()).collect(),
                                })
                                .collect(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn round_trip_is_exact() {
        let db = sample_database(3, 4, 17);
        let bytes = encode(&db);
        let decoded = decode(&bytes).expect("decode");
        assert_eq!(decoded, db);
    }

    #[test]
    fn empty_database_round_trips() {
        let db = sample_database(0, 0, 0);
        assert_eq!(decode(&encode(&db)).expect("decode"), db);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = encode(&sample_database(1, 1, 2));
        bytes[0] = b'X';
        assert_eq!(decode(&bytes), Err(CorruptDatabaseError::BadMagic));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = encode(&sample_database(1, 1, 2));
        bytes[8..10].copy_from_slice(&7u16.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(CorruptDatabaseError::UnsupportedVersion { found: 7, .. })
        ));
    }

    #[test]
    fn rejects_every_truncation() {
        let bytes = encode(&sample_database(2, 2, 3));
        for cut in 0..bytes.len() {
            assert!(decode(&bytes[..cut]).is_err(), "cut at {cut} was accepted");
        }
    }

    #[test]
    fn rejects_count_overrunning_buffer() {
        let mut bytes = encode(&sample_database(1, 1, 2));
        // target_count sits right after the fixed header fields
        bytes[14..18].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(CorruptDatabaseError::Truncated { context: "target count", .. })
        ));
    }

    #[test]
    fn rejects_flipped_payload_byte() {
        let mut bytes = encode(&sample_database(1, 2, 4));
        let idx = HEADER_LEN + TARGET_HEADER_LEN + LEVEL_HEADER_LEN + 9;
        bytes[idx] ^= 0x40;
        assert!(matches!(
            decode(&bytes),
            Err(CorruptDatabaseError::ChecksumMismatch { .. })
        ));
    }

    fn with_checksum(mut bytes: Vec<u8>) -> Vec<u8> {
        let body = bytes.len() - CHECKSUM_LEN;
        let mut hasher = Hasher::new();
        hasher.update(&bytes[..body]);
        let crc = hasher.finalize();
        bytes[body..].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    #[test]
    fn rejects_oversized_basis_with_valid_checksum() {
        let mut db = sample_database(1, 1, 2);
        db.hd_dimensions = 0x1000_0000;
        assert!(matches!(
            decode(&encode(&db)),
            Err(CorruptDatabaseError::InvalidLayout(_))
        ));

        db.hd_dimensions = 0;
        assert!(matches!(
            decode(&encode(&db)),
            Err(CorruptDatabaseError::InvalidLayout(_))
        ));
    }

    #[test]
    fn rejects_oversized_descriptor_width() {
        let mut bytes = encode(&sample_database(0, 0, 0));
        bytes[10..12].copy_from_slice(&u16::MAX.to_le_bytes());
        assert!(matches!(
            decode(&with_checksum(bytes)),
            Err(CorruptDatabaseError::InvalidLayout(_))
        ));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = encode(&sample_database(1, 1, 1));
        bytes.push(0);
        assert_eq!(decode(&bytes), Err(CorruptDatabaseError::TrailingBytes(1)));
    }
}
