//! Frame-to-database descriptor matching.
//!
//! On the exhaustive path every keypoint of a level is a candidate. On the
//! LSH path the signature bucket of the query proposes a nearest keypoint,
//! and only a proposal under the Hamming threshold is verified against the
//! whole level. Verification runs the exhaustive search, so the LSH path can
//! only drop correspondences the exhaustive path would find, never add one.

use log::{debug, trace, warn};
use nalgebra::Vector2;
use tracing::debug_span;

use crate::config::MatcherParams;
use crate::db::{BucketTable, DatabaseLevel, FeatureDatabase, TargetDatabase};
use crate::detect::FeaturePoint;
use crate::error::CorruptDatabaseError;
use crate::hd::{HdEncoder, hamming_distance};

/// Stored keypoints per target re-signed at load to confirm the regenerated
/// basis matches the one the database was compiled with.
const SIGNATURE_SPOT_CHECKS: usize = 8;

/// A frame keypoint ready for matching.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPoint {
    pub x: f32,
    pub y: f32,
    pub descriptor: Vec<u32>,
    /// Empty when the LSH pre-filter is disabled.
    pub signature: Vec<u32>,
}

/// One accepted frame-to-database match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub query_index: usize,
    pub keypoint_index: usize,
    /// Frame pixel position of the query keypoint.
    pub screen: Vector2<f64>,
    /// Target-plane position (z = 0) in original target pixels.
    pub world: Vector2<f64>,
    pub distance: u32,
}

/// Correspondences of one target, all taken from a single pyramid level.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetMatches {
    pub target_index: usize,
    pub level_index: Option<usize>,
    pub correspondences: Vec<Correspondence>,
}

impl TargetMatches {
    pub fn len(&self) -> usize {
        self.correspondences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.correspondences.is_empty()
    }
}

/// A loaded database together with its regenerated encoder and one bucket
/// table per target level. Read-only once built.
#[derive(Debug, Clone)]
pub struct SearchIndex {
    database: FeatureDatabase,
    encoder: HdEncoder,
    tables: Vec<Vec<BucketTable>>,
}

impl SearchIndex {
    pub fn new(database: FeatureDatabase, params: &MatcherParams) -> Result<Self, CorruptDatabaseError> {
        let encoder = database.encoder()?;
        if params.bucket_bits as usize > encoder.signature_bits() {
            return Err(CorruptDatabaseError::InvalidLayout(format!(
                "bucket key of {} bits exceeds {}-bit signatures",
                params.bucket_bits,
                encoder.signature_bits()
            )));
        }
        let stale = database.targets.iter().find(|target| {
            target
                .levels
                .iter()
                .flat_map(|level| &level.keypoints)
                .take(SIGNATURE_SPOT_CHECKS)
                .any(|kp| encoder.signature(&kp.descriptor) != kp.signature)
        });
        if let Some(target) = stale {
            warn!(
                target: "imtrack_core::matcher",
                "Target {} signatures disagree with basis seed {:#x}",
                target.target_index,
                database.hd_seed
            );
            return Err(CorruptDatabaseError::InvalidLayout(format!(
                "stored signatures of target {} do not match the regenerated basis",
                target.target_index
            )));
        }
        let tables = database
            .targets
            .iter()
            .map(|target| {
                target
                    .levels
                    .iter()
                    .map(|level| BucketTable::build(level, params.bucket_bits, params.bucket_capacity))
                    .collect()
            })
            .collect();
        debug!(
            target: "imtrack_core::matcher",
            "Search index ready: {} targets, {}-bit bucket keys",
            database.targets.len(),
            params.bucket_bits
        );
        Ok(Self {
            database,
            encoder,
            tables,
        })
    }

    pub fn database(&self) -> &FeatureDatabase {
        &self.database
    }

    pub fn encoder(&self) -> &HdEncoder {
        &self.encoder
    }

    pub fn target_count(&self) -> usize {
        self.database.targets.len()
    }

    pub fn target(&self, target_index: usize) -> Option<&TargetDatabase> {
        self.database.targets.get(target_index)
    }

    pub fn table(&self, target_index: usize, level_index: usize) -> Option<&BucketTable> {
        self.tables.get(target_index)?.get(level_index)
    }
}

#[derive(Debug, Clone)]
pub struct Matcher {
    params: MatcherParams,
}

impl Matcher {
    pub fn new(params: MatcherParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &MatcherParams {
        &self.params
    }

    /// Keeps the `max_query_points` strongest keypoints and computes their
    /// signatures when the LSH path is enabled.
    pub fn prepare(&self, features: &[FeaturePoint], encoder: &HdEncoder) -> Vec<QueryPoint> {
        let mut order: Vec<usize> = (0..features.len()).collect();
        order.sort_by(|&a, &b| {
            features[b]
                .score
                .partial_cmp(&features[a].score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order.truncate(self.params.max_query_points);

        order
            .into_iter()
            .map(|i| {
                let feature = &features[i];
                QueryPoint {
                    x: feature.x,
                    y: feature.y,
                    signature: if self.params.use_lsh {
                        encoder.signature(&feature.descriptor)
                    } else {
                        Vec::new()
                    },
                    descriptor: feature.descriptor.clone(),
                }
            })
            .collect()
    }

    /// Matches against every level of the target and keeps the level with the
    /// most correspondences (the finer level on ties).
    pub fn match_target(&self, queries: &[QueryPoint], index: &SearchIndex, target_index: usize) -> TargetMatches {
        let _span = debug_span!("match_target", target_index).entered();
        let mut best = TargetMatches {
            target_index,
            level_index: None,
            correspondences: Vec::new(),
        };
        let Some(target) = index.target(target_index) else {
            return best;
        };

        for (level_index, level) in target.levels.iter().enumerate() {
            let table = if self.params.use_lsh {
                index.table(target_index, level_index)
            } else {
                None
            };
            let correspondences = self.match_level(queries, level, table);
            trace!(
                target: "imtrack_core::matcher",
                "Target {target_index} level {level_index}: {} correspondences",
                correspondences.len()
            );
            if correspondences.len() > best.correspondences.len() {
                best.level_index = Some(level_index);
                best.correspondences = correspondences;
            }
        }

        debug!(
            target: "imtrack_core::matcher",
            "Target {target_index}: {} correspondences from {} queries (level {:?})",
            best.correspondences.len(),
            queries.len(),
            best.level_index
        );
        best
    }

    pub fn match_all(&self, queries: &[QueryPoint], index: &SearchIndex) -> Vec<TargetMatches> {
        (0..index.target_count())
            .map(|target_index| self.match_target(queries, index, target_index))
            .collect()
    }

    /// Best / second-best search over one level. A `None` table means every
    /// keypoint of the level is a candidate.
    pub fn match_level(
        &self,
        queries: &[QueryPoint],
        level: &DatabaseLevel,
        table: Option<&BucketTable>,
    ) -> Vec<Correspondence> {
        let mut correspondences = Vec::new();
        let mut candidates = Vec::new();
        let mut verified = 0usize;

        for (query_index, query) in queries.iter().enumerate() {
            if let Some(table) = table {
                table.candidates(&query.signature, self.params.multi_probe, &mut candidates);
                let proposal = nearest_two(&query.descriptor, level, candidates.iter().copied());
                if !proposal.is_some_and(|nearest| nearest.best_distance < self.params.max_hamming) {
                    continue;
                }
                verified += 1;
            }

            let Some(nearest) = nearest_two(&query.descriptor, level, 0..level.keypoints.len()) else {
                continue;
            };
            if self.passes_filters(nearest.best_distance, nearest.second_distance) {
                correspondences.push(Correspondence {
                    query_index,
                    keypoint_index: nearest.keypoint_index,
                    screen: Vector2::new(query.x as f64, query.y as f64),
                    world: level.world_point(nearest.keypoint_index),
                    distance: nearest.best_distance,
                });
            }
        }

        if table.is_some() {
            trace!(
                target: "imtrack_core::matcher",
                "Bucket lookup kept {verified} of {} queries for verification",
                queries.len()
            );
        }
        correspondences
    }

    /// Absolute threshold, then the ratio test. Without a runner-up the
    /// ratio is undefined and the match is rejected.
    pub fn passes_filters(&self, best_distance: u32, second_best_distance: u32) -> bool {
        if best_distance >= self.params.max_hamming || second_best_distance == u32::MAX {
            return false;
        }
        (best_distance as f32) < self.params.ratio_threshold * second_best_distance as f32
    }
}

#[derive(Debug, Clone, Copy)]
struct Nearest {
    keypoint_index: usize,
    best_distance: u32,
    /// `u32::MAX` when there was a single candidate.
    second_distance: u32,
}

fn nearest_two(descriptor: &[u32], level: &DatabaseLevel, candidates: impl Iterator<Item = usize>) -> Option<Nearest> {
    let mut best_keypoint = None;
    let mut best_distance = u32::MAX;
    let mut second_distance = u32::MAX;
    for keypoint_index in candidates {
        let distance = hamming_distance(descriptor, &level.keypoints[keypoint_index].descriptor);
        if best_keypoint.is_none() || distance < best_distance {
            second_distance = best_distance;
            best_distance = distance;
            best_keypoint = Some(keypoint_index);
        } else if distance < second_distance {
            second_distance = distance;
        }
    }
    best_keypoint.map(|keypoint_index| Nearest {
        keypoint_index,
        best_distance,
        second_distance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Keypoint;
    use crate::hd::generate_basis;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    const SIGNATURE_BITS: usize = 128;

    fn random_descriptor(rng: &mut SmallRng) -> Vec<u32> {
        (0..8).map(|_| rng.r#gen()).collect()
    }

    fn with_noise(descriptor: &[u32], flips: usize, rng: &mut SmallRng) -> Vec<u32> {
        let mut out = descriptor.to_vec();
        for _ in 0..flips {
            let bit = rng.gen_range(0..256);
            out[bit / 32] ^= 1 << (bit % 32);
        }
        out
    }

    fn fixture(count: usize) -> (SearchIndex, Vec<Vec<u32>>, SmallRng) {
        let mut rng = SmallRng::seed_from_u64(42);
        let encoder = HdEncoder::new(generate_basis(5, 1024, 256), SIGNATURE_BITS);
        let descriptors: Vec<Vec<u32>> = (0..count).map(|_| random_descriptor(&mut rng)).collect();
        let keypoints = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| Keypoint {
                x: (i % 20) as f32 * 10.0,
                y: (i / 20) as f32 * 10.0,
                signature: encoder.signature(d),
                descriptor: d.clone(),
            })
            .collect();
        let database = FeatureDatabase {
            descriptor_words: 8,
            signature_words: 4,
            hd_seed: 5,
            hd_dimensions: 1024,
            targets: vec![TargetDatabase {
                target_index: 0,
                width: 200,
                height: 200,
                levels: vec![
                    DatabaseLevel {
                        scale: 1.0,
                        keypoints,
                    },
                    DatabaseLevel {
                        scale: 0.5,
                        keypoints: Vec::new(),
                    },
                ],
            }],
        };
        let index = SearchIndex::new(database, &MatcherParams::default()).expect("index");
        (index, descriptors, rng)
    }

    fn queries_for(matcher: &Matcher, index: &SearchIndex, descriptors: &[Vec<u32>]) -> Vec<QueryPoint> {
        let features: Vec<FeaturePoint> = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| FeaturePoint {
                x: i as f32,
                y: 2.0 * i as f32,
                score: 100.0 - i as f32,
                angle: 0.0,
                descriptor: d.clone(),
            })
            .collect();
        matcher.prepare(&features, index.encoder())
    }

    #[test]
    fn filters_apply_threshold_then_ratio() {
        let matcher = Matcher::new(MatcherParams::default());
        assert!(matcher.passes_filters(10, 100));
        assert!(!matcher.passes_filters(64, u32::MAX));
        assert!(!matcher.passes_filters(10, u32::MAX));
        assert!(!matcher.passes_filters(40, 45));
        assert!(!matcher.passes_filters(0, 0));
    }

    #[test]
    fn index_rejects_signatures_from_another_basis() {
        let (index, _, _) = fixture(30);
        let mut database = index.database().clone();
        database.hd_seed = 6;
        assert!(matches!(
            SearchIndex::new(database, &MatcherParams::default()),
            Err(CorruptDatabaseError::InvalidLayout(_))
        ));
    }

    #[test]
    fn prepare_keeps_strongest_points() {
        let (index, descriptors, _) = fixture(10);
        let matcher = Matcher::new(MatcherParams {
            max_query_points: 3,
            ..MatcherParams::default()
        });
        let queries = queries_for(&matcher, &index, &descriptors);
        assert_eq!(queries.len(), 3);
        assert_eq!(queries[0].descriptor, descriptors[0]);
        assert_eq!(queries[0].signature.len(), 4);
    }

    #[test]
    fn exhaustive_path_finds_noisy_copies() {
        let (index, descriptors, mut rng) = fixture(120);
        let matcher = Matcher::new(MatcherParams {
            use_lsh: false,
            ..MatcherParams::default()
        });
        let noisy: Vec<Vec<u32>> = descriptors.iter().take(40).map(|d| with_noise(d, 6, &mut rng)).collect();
        let queries = queries_for(&matcher, &index, &noisy);
        let result = matcher.match_target(&queries, &index, 0);
        assert_eq!(result.level_index, Some(0));
        assert_eq!(result.len(), 40);
        for c in &result.correspondences {
            assert_eq!(c.keypoint_index, c.query_index);
        }
    }

    #[test]
    fn lsh_path_is_subset_of_exhaustive() {
        let (index, descriptors, mut rng) = fixture(200);
        let mut queries_src: Vec<Vec<u32>> = descriptors.iter().take(60).map(|d| with_noise(d, 4, &mut rng)).collect();
        queries_src.extend((0..20).map(|_| random_descriptor(&mut rng)));

        let lsh = Matcher::new(MatcherParams::default());
        let exhaustive = Matcher::new(MatcherParams {
            use_lsh: false,
            ..MatcherParams::default()
        });
        let queries = queries_for(&lsh, &index, &queries_src);
        let level = &index.target(0).expect("target").levels[0];

        let pruned = lsh.match_level(&queries, level, index.table(0, 0));
        let full = exhaustive.match_level(&queries, level, None);
        assert!(!pruned.is_empty());
        for c in &pruned {
            assert!(
                full.iter()
                    .any(|f| f.query_index == c.query_index && f.keypoint_index == c.keypoint_index),
                "LSH accepted query {} -> {} that the exhaustive path rejects",
                c.query_index,
                c.keypoint_index
            );
        }
    }

    fn set_bits(count: usize, offset: usize) -> Vec<u32> {
        let mut descriptor = vec![0u32; 8];
        for bit in offset..offset + count {
            descriptor[bit / 32] |= 1 << (bit % 32);
        }
        descriptor
    }

    #[test]
    fn ambiguous_match_split_across_buckets_is_rejected() {
        // A and B are nearly the same distance from the query but sit in
        // buckets that multi-probe from the query key does not reach.
        let keypoint = |descriptor: Vec<u32>, key: u32| Keypoint {
            x: 0.0,
            y: 0.0,
            descriptor,
            signature: vec![key, 0, 0, 0],
        };
        let level = DatabaseLevel {
            scale: 1.0,
            keypoints: vec![
                keypoint(set_bits(10, 0), 1),
                keypoint(set_bits(11, 100), 2),
                keypoint(set_bits(120, 128), 1),
            ],
        };
        let params = MatcherParams::default();
        let table = BucketTable::build(&level, params.bucket_bits, params.bucket_capacity);
        assert_eq!(table.bucket(1), &[0, 2]);
        assert_eq!(table.bucket(2), &[1]);

        let query = |descriptor: Vec<u32>| QueryPoint {
            x: 0.0,
            y: 0.0,
            descriptor,
            signature: vec![1, 0, 0, 0],
        };
        let queries = vec![query(vec![0; 8]), query(set_bits(118, 129))];

        let lsh = Matcher::new(params);
        let exhaustive = Matcher::new(MatcherParams {
            use_lsh: false,
            ..params
        });
        let pruned = lsh.match_level(&queries, &level, Some(&table));
        let full = exhaustive.match_level(&queries, &level, None);
        assert_eq!(pruned, full);
        assert_eq!(pruned.len(), 1);
        assert_eq!((pruned[0].query_index, pruned[0].keypoint_index), (1, 2));
    }

    #[test]
    fn lone_keypoint_has_no_runner_up() {
        let level = DatabaseLevel {
            scale: 1.0,
            keypoints: vec![Keypoint {
                x: 0.0,
                y: 0.0,
                descriptor: vec![0; 8],
                signature: vec![0; 4],
            }],
        };
        let query = QueryPoint {
            x: 0.0,
            y: 0.0,
            descriptor: vec![0; 8],
            signature: vec![0; 4],
        };
        let matcher = Matcher::new(MatcherParams::default());
        assert!(matcher.match_level(&[query], &level, None).is_empty());
    }

    #[test]
    fn world_points_are_unscaled() {
        let level = DatabaseLevel {
            scale: 0.5,
            keypoints: vec![Keypoint {
                x: 10.0,
                y: 4.0,
                descriptor: vec![0; 8],
                signature: vec![0; 4],
            }],
        };
        assert_eq!(level.world_point(0), Vector2::new(20.0, 8.0));
    }
}
