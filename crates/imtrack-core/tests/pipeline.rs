use approx::assert_relative_eq;
use image::{GrayImage, Luma};
use imtrack_core::camera::CameraIntrinsics;
use imtrack_core::compiler::{Compiler, TargetImage};
use imtrack_core::config::EngineConfig;
use imtrack_core::db::FeatureDatabase;
use imtrack_core::detect::FeatureDetector;
use imtrack_core::img::prefilter;
use imtrack_core::matcher::{Matcher, SearchIndex};
use imtrack_core::pose::{PlanarObservation, PoseEstimator};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn poster(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut rng = SmallRng::seed_from_u64(seed);
    let squares: Vec<(u32, u32, u32, u8)> = (0..width * height / 600)
        .map(|_| {
            (
                rng.gen_range(0..width),
                rng.gen_range(0..height),
                rng.gen_range(8..28),
                rng.gen_range(110..=250),
            )
        })
        .collect();
    GrayImage::from_fn(width, height, |x, y| {
        let ripple = (x as f32 * 0.21).sin() * (y as f32 * 0.17).cos() * 8.0;
        let mut value = 35.0 + ripple;
        for &(sx, sy, size, shade) in &squares {
            if (sx..sx + size).contains(&x) && (sy..sy + size).contains(&y) {
                value = shade as f32 + ripple;
            }
        }
        Luma([value.clamp(0.0, 255.0) as u8])
    })
}

#[test]
fn exported_database_recovers_the_reference_pose() {
    let config = EngineConfig::default();
    let target = poster(320, 240, 11);
    let bytes = Compiler::new(&config)
        .expect("compiler")
        .export(&[TargetImage::from_gray(&target)], |_| {})
        .expect("export");

    let database = FeatureDatabase::from_bytes(&bytes).expect("decode");
    assert_eq!(database.targets.len(), 1);
    assert_eq!(database.targets[0].width, 320);
    let index = SearchIndex::new(database, &config.matcher).expect("index");

    let features = FeatureDetector::new(config.detector).detect(&prefilter(&target, config.pyramid.blur_sigma));
    let matcher = Matcher::new(config.matcher);
    let queries = matcher.prepare(&features, index.encoder());
    let matches = matcher.match_target(&queries, &index, 0);
    assert!(matches.len() >= config.pose.min_inliers, "{} correspondences", matches.len());
    assert_eq!(matches.level_index, Some(0));

    let observations: Vec<PlanarObservation> = matches
        .correspondences
        .iter()
        .map(|c| PlanarObservation {
            world: c.world,
            screen: c.screen,
        })
        .collect();
    let camera = CameraIntrinsics::new(500.0, 500.0, 160.0, 120.0, 320, 240);
    let estimator = PoseEstimator::new(config.pose);
    let estimate = estimator.estimate(&observations, &camera).expect("pose");
    assert!(estimator.accepts(&estimate));
    assert_relative_eq!(estimate.pose.translation.x, -160.0, epsilon = 1.0);
    assert_relative_eq!(estimate.pose.translation.y, -120.0, epsilon = 1.0);
    assert_relative_eq!(estimate.pose.translation.z, 500.0, epsilon = 2.0);
}

#[test]
fn blank_frame_produces_no_correspondences() {
    let config = EngineConfig::default();
    let database = Compiler::new(&config)
        .expect("compiler")
        .compile(&[TargetImage::from_gray(&poster(320, 240, 11))], |_| {})
        .expect("compile");
    let index = SearchIndex::new(database, &config.matcher).expect("index");

    let blank = GrayImage::from_pixel(320, 240, Luma([60]));
    let features = FeatureDetector::new(config.detector).detect(&blank);
    assert!(features.is_empty());
    let matcher = Matcher::new(config.matcher);
    let queries = matcher.prepare(&features, index.encoder());
    assert!(matcher.match_target(&queries, &index, 0).is_empty());
}
