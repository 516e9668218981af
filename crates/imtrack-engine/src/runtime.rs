//! Frame loop: detection for scanning targets, patch tracking for tracked
//! ones, and an all-or-nothing commit of the results into the track states.

use imtrack_core::camera::CameraIntrinsics;
use imtrack_core::compiler::{Compiler, TargetImage};
use imtrack_core::config::EngineConfig;
use imtrack_core::db::FeatureDatabase;
use imtrack_core::detect::DESCRIPTOR_WORDS;
use imtrack_core::img::Frame;
use imtrack_core::matcher::SearchIndex;
use imtrack_core::pose::{MIN_CORRESPONDENCES, Pose, solve_planar_pnp};
use imtrack_core::track::{PatchTracker, TrackStep, TrackedPoint, accepted_observations};
use log::{debug, info, trace};
use rayon::prelude::*;
use tracing::debug_span;

use crate::cancel::CancellationToken;
use crate::detection::{DetectionAttempt, FeatureDetection, FrameDetector, PointTracker};
use crate::error::EngineError;
use crate::events::{FoundPayload, LostPayload, TrackerEvent, TrackerListener, UpdatePayload, dispatch};
use crate::extension::{ExtensionRegistry, TrackerExtension};
use crate::state::{TargetTrack, TrackPhase, Transition};

/// Where the runtime gets its targets from.
#[derive(Debug, Clone)]
pub enum TargetSource {
    /// A serialized feature database.
    Database(Vec<u8>),
    /// Raw reference images, compiled at startup with the runtime's config.
    Images(Vec<TargetImage>),
}

impl TargetSource {
    pub fn load(self, config: &EngineConfig) -> Result<FeatureDatabase, EngineError> {
        let database = match self {
            TargetSource::Database(bytes) => FeatureDatabase::from_bytes(&bytes)?,
            TargetSource::Images(images) => Compiler::new(config)?.compile(&images, |_| {})?,
        };
        if database.descriptor_words != DESCRIPTOR_WORDS {
            return Err(EngineError::IncompatibleDescriptors {
                found: database.descriptor_words,
                expected: DESCRIPTOR_WORDS,
            });
        }
        if database.targets.is_empty() {
            return Err(EngineError::NoTargets);
        }
        Ok(database)
    }
}

/// Tracking work for one target, computed before anything is committed.
struct TrackingOutcome {
    target_index: usize,
    points: Vec<TrackedPoint>,
    step: TrackStep,
    pose: Option<Pose>,
}

pub struct ImageTracker<D: FrameDetector = FeatureDetection, P: PointTracker = PatchTracker> {
    config: EngineConfig,
    camera: CameraIntrinsics,
    detector: D,
    tracker: P,
    targets: Vec<TargetTrack>,
    extensions: ExtensionRegistry,
    listener: Box<dyn TrackerListener>,
    cancel: CancellationToken,
    frames_seen: u64,
}

impl ImageTracker {
    /// Loads or compiles the targets and builds the default pipeline.
    pub fn new(
        source: TargetSource,
        camera: CameraIntrinsics,
        config: EngineConfig,
        listener: Box<dyn TrackerListener>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let database = source.load(&config)?;
        let index = SearchIndex::new(database, &config.matcher)?;
        let detector = FeatureDetection::new(index, camera, &config);
        let tracker = PatchTracker::new(config.tracking, config.filter);
        Self::with_components(detector, tracker, camera, config, listener)
    }
}

impl<D: FrameDetector, P: PointTracker> ImageTracker<D, P> {
    pub fn with_components(
        detector: D,
        tracker: P,
        camera: CameraIntrinsics,
        config: EngineConfig,
        listener: Box<dyn TrackerListener>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if !camera.is_valid() {
            return Err(EngineError::InvalidCamera(format!("{camera:?}")));
        }
        let targets = (0..detector.target_count()).map(TargetTrack::new).collect();
        info!(
            target: "imtrack_engine::runtime",
            "Image tracker ready with {} targets ({}x{} camera)",
            detector.target_count(),
            camera.width,
            camera.height
        );
        Ok(Self {
            config,
            camera,
            detector,
            tracker,
            targets,
            extensions: ExtensionRegistry::new(),
            listener,
            cancel: CancellationToken::new(),
            frames_seen: 0,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn register_extension(&mut self, extension: Box<dyn TrackerExtension>) {
        self.extensions.register(extension);
    }

    /// Handle for stopping the loop from elsewhere, for example while
    /// [`run`](Self::run) is blocking another thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn targets(&self) -> &[TargetTrack] {
        &self.targets
    }

    pub fn target(&self, target_index: usize) -> Option<&TargetTrack> {
        self.targets.get(target_index)
    }

    /// Stops the tracker. Pending results are discarded, every target returns
    /// to Scanning without events, and later frames are ignored.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.release();
    }

    fn release(&mut self) {
        for target in &mut self.targets {
            target.reset();
        }
        debug!(target: "imtrack_engine::runtime", "Tracker stopped, per-target state released");
    }

    /// Processes frames in order until the iterator ends or the tracker is
    /// cancelled. Returns the number of frames processed.
    pub fn run<I>(&mut self, frames: I) -> usize
    where
        I: IntoIterator<Item = Frame>,
    {
        let mut processed = 0;
        for frame in frames {
            if self.cancel.is_cancelled() {
                break;
            }
            self.process_frame(&frame);
            processed += 1;
        }
        processed
    }

    /// Runs one frame through the pipeline and returns the emitted events,
    /// which have also been delivered to the listener.
    pub fn process_frame(&mut self, frame: &Frame) -> Vec<TrackerEvent> {
        if self.cancel.is_cancelled() {
            self.release_if_needed();
            return Vec::new();
        }
        let _span = debug_span!("process_frame", frame_id = frame.frame_id).entered();

        self.extensions.before_process(frame);
        for target in &mut self.targets {
            target.begin_frame();
        }
        let scan_due = self.frames_seen % self.config.scheduler.scan_interval as u64 == 0;
        self.frames_seen += 1;

        // Compute everything against an unchanged state.
        let to_detect = self.detection_targets(scan_due);
        let attempts = self.detector.detect(frame, &to_detect);
        let outcomes = self.track_targets(frame);

        if self.cancel.is_cancelled() {
            trace!(target: "imtrack_engine::runtime", "Frame {} discarded after cancellation", frame.frame_id);
            self.release_if_needed();
            return Vec::new();
        }

        let mut events = Vec::new();
        for attempt in attempts {
            self.commit_detection(frame, attempt, &mut events);
        }
        for outcome in outcomes {
            self.commit_tracking(frame, outcome, &mut events);
        }

        for event in &events {
            dispatch(self.listener.as_mut(), event);
        }
        events
    }

    fn release_if_needed(&mut self) {
        if self.targets.iter().any(|t| t.phase() != TrackPhase::Scanning || !t.points().is_empty()) {
            self.release();
        }
    }

    /// Warmup targets every frame; Scanning targets on the scan cadence, and
    /// only as many as still fit under `max_tracked_targets`.
    fn detection_targets(&self, scan_due: bool) -> Vec<usize> {
        let engaged = self
            .targets
            .iter()
            .filter(|t| matches!(t.phase(), TrackPhase::Warmup | TrackPhase::Tracking))
            .count();
        let free_slots = if scan_due {
            self.config.scheduler.max_tracked_targets.saturating_sub(engaged)
        } else {
            0
        };
        let warming = self
            .targets
            .iter()
            .filter(|t| t.phase() == TrackPhase::Warmup)
            .map(TargetTrack::target_index);
        let scanning = self
            .targets
            .iter()
            .filter(|t| t.phase() == TrackPhase::Scanning)
            .map(TargetTrack::target_index)
            .take(free_slots);
        warming.chain(scanning).collect()
    }

    fn track_targets(&self, frame: &Frame) -> Vec<TrackingOutcome> {
        let camera = &self.camera;
        let tracker = &self.tracker;
        self.targets
            .par_iter()
            .filter(|t| t.phase() == TrackPhase::Tracking)
            .map(|target| {
                let mut points = target.points().to_vec();
                let step = tracker.step(frame, &mut points);
                let observations = accepted_observations(&points);
                let pose = if observations.len() >= MIN_CORRESPONDENCES {
                    solve_planar_pnp(&observations, camera).ok()
                } else {
                    None
                };
                TrackingOutcome {
                    target_index: target.target_index(),
                    points,
                    step,
                    pose,
                }
            })
            .collect()
    }

    fn commit_detection(&mut self, frame: &Frame, attempt: DetectionAttempt, events: &mut Vec<TrackerEvent>) {
        self.extensions.after_match(&attempt);
        let Some(target) = self.targets.get_mut(attempt.target_index) else {
            return;
        };

        // A confirmation that cannot seed enough templates would be lost
        // again without ever tracking, so it counts as a failed detection.
        let mut success = attempt.is_success();
        let mut seeded = None;
        if let Some(detection) = attempt.detection()
            && target.confirms_on_success(self.config.tracking.warmup_tolerance)
        {
            let points = self.tracker.seed(frame, &detection.inliers);
            if points.len() < self.config.tracking.min_tracked_points {
                debug!(
                    target: "imtrack_engine::runtime",
                    "Target {} confirmation dropped in frame {}: {} of {} trackable points",
                    attempt.target_index,
                    frame.frame_id,
                    points.len(),
                    self.config.tracking.min_tracked_points
                );
                success = false;
            } else {
                seeded = Some(points);
            }
        }

        let pose = attempt.detection().map(|d| d.pose);
        let transition = target.apply_detection(success, pose, self.config.tracking.warmup_tolerance);
        if transition != Transition::Found {
            return;
        }
        let (Some(detection), Some(points)) = (attempt.detection(), seeded) else {
            return;
        };

        info!(
            target: "imtrack_engine::runtime",
            "Target {} found in frame {} ({} inliers, {} tracked points)",
            attempt.target_index,
            frame.frame_id,
            detection.inliers.len(),
            points.len()
        );
        let pose = self.extensions.filter_pose(attempt.target_index, detection.pose);
        target.set_points(points);
        target.set_pose(pose);
        events.push(TrackerEvent::Found(FoundPayload {
            target_index: attempt.target_index,
            frame_id: frame.frame_id,
        }));
        if self.extensions.should_show(attempt.target_index) {
            events.push(TrackerEvent::Update(update_payload(target, frame.frame_id)));
        }
    }

    fn commit_tracking(&mut self, frame: &Frame, outcome: TrackingOutcome, events: &mut Vec<TrackerEvent>) {
        let target_index = outcome.target_index;
        self.extensions.after_track(target_index, &outcome.points);
        let pose = outcome
            .pose
            .and_then(|pose| self.extensions.filter_pose(target_index, pose));
        let good = outcome.step.accepted >= self.config.tracking.min_tracked_points;
        let Some(target) = self.targets.get_mut(target_index) else {
            return;
        };

        target.set_points(outcome.points);
        target.set_pose(pose);
        match target.apply_tracking(good, self.config.tracking.miss_tolerance) {
            Transition::Lost => {
                info!(
                    target: "imtrack_engine::runtime",
                    "Target {target_index} lost in frame {}",
                    frame.frame_id
                );
                events.push(TrackerEvent::Lost(LostPayload {
                    target_index,
                    frame_id: frame.frame_id,
                }));
            }
            _ => {
                trace!(
                    target: "imtrack_engine::runtime",
                    "Target {target_index}: {}/{} points accepted, misses {}",
                    outcome.step.accepted,
                    outcome.step.total,
                    target.miss_count()
                );
                if self.extensions.should_show(target_index) {
                    events.push(TrackerEvent::Update(update_payload(target, frame.frame_id)));
                }
            }
        }
    }
}

fn update_payload(target: &TargetTrack, frame_id: u64) -> UpdatePayload {
    let points = target.points();
    UpdatePayload {
        target_index: target.target_index(),
        frame_id,
        screen_points: points.iter().map(|p| p.screen).collect(),
        reliabilities: points.iter().map(|p| p.reliability).collect(),
        stabilities: points.iter().map(|p| p.stability).collect(),
        pose: target.pose().copied(),
    }
}

impl<D: FrameDetector, P: PointTracker> std::fmt::Debug for ImageTracker<D, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageTracker")
            .field("targets", &self.targets)
            .field("extensions", &self.extensions)
            .field("stopped", &self.is_stopped())
            .field("frames_seen", &self.frames_seen)
            .finish()
    }
}
