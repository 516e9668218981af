//! Per-target detect/track lifecycle.
//!
//! ```text
//! Scanning --detect ok--> Warmup --warmup_tolerance successes--> Tracking
//!    ^                      |                                      |
//!    +------ detect fail ---+             misses > miss_tolerance  |
//!    +---------------- next frame <-- Lost <-----------------------+
//! ```

use imtrack_core::pose::Pose;
use imtrack_core::track::TrackedPoint;
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackPhase {
    Scanning,
    Warmup,
    Tracking,
    Lost,
}

/// Observable result of applying one frame to a [`TargetTrack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    /// Warmup completed; the target is now tracked.
    Found,
    /// Too many consecutive tracking misses.
    Lost,
}

/// Track state of one registered target. Mutated only by the runtime's
/// commit step.
#[derive(Debug, Clone)]
pub struct TargetTrack {
    target_index: usize,
    phase: TrackPhase,
    good_count: u32,
    miss_count: u32,
    points: Vec<TrackedPoint>,
    pose: Option<Pose>,
}

impl TargetTrack {
    pub fn new(target_index: usize) -> Self {
        Self {
            target_index,
            phase: TrackPhase::Scanning,
            good_count: 0,
            miss_count: 0,
            points: Vec::new(),
            pose: None,
        }
    }

    pub fn target_index(&self) -> usize {
        self.target_index
    }

    pub fn phase(&self) -> TrackPhase {
        self.phase
    }

    /// Consecutive successful detections since leaving Scanning.
    pub fn good_count(&self) -> u32 {
        self.good_count
    }

    /// Consecutive failed tracking frames.
    pub fn miss_count(&self) -> u32 {
        self.miss_count
    }

    pub fn points(&self) -> &[TrackedPoint] {
        &self.points
    }

    pub fn pose(&self) -> Option<&Pose> {
        self.pose.as_ref()
    }

    /// Whether this frame should run detection for the target.
    pub fn wants_detection(&self) -> bool {
        matches!(self.phase, TrackPhase::Scanning | TrackPhase::Warmup)
    }

    /// Lost only lasts for the frame that reported it.
    pub fn begin_frame(&mut self) {
        if self.phase == TrackPhase::Lost {
            self.phase = TrackPhase::Scanning;
        }
    }

    /// True when one more successful detection would confirm the target.
    pub fn confirms_on_success(&self, warmup_tolerance: u32) -> bool {
        self.wants_detection() && self.good_count + 1 >= warmup_tolerance
    }

    /// Applies a detection result while Scanning or Warmup.
    pub fn apply_detection(&mut self, success: bool, pose: Option<Pose>, warmup_tolerance: u32) -> Transition {
        if !self.wants_detection() {
            return Transition::None;
        }
        if !success {
            if self.phase == TrackPhase::Warmup {
                debug!(
                    target: "imtrack_engine::state",
                    "Target {} failed detection during warmup after {} successes",
                    self.target_index,
                    self.good_count
                );
            }
            self.reset();
            return Transition::None;
        }

        self.good_count += 1;
        self.pose = pose;
        if self.good_count >= warmup_tolerance {
            self.phase = TrackPhase::Tracking;
            self.miss_count = 0;
            debug!(
                target: "imtrack_engine::state",
                "Target {} confirmed after {} detections",
                self.target_index,
                self.good_count
            );
            Transition::Found
        } else {
            self.phase = TrackPhase::Warmup;
            Transition::None
        }
    }

    /// Applies the outcome of a tracking frame while Tracking.
    pub fn apply_tracking(&mut self, good: bool, miss_tolerance: u32) -> Transition {
        if self.phase != TrackPhase::Tracking {
            return Transition::None;
        }
        if good {
            self.miss_count = 0;
            return Transition::None;
        }
        self.miss_count += 1;
        if self.miss_count > miss_tolerance {
            debug!(
                target: "imtrack_engine::state",
                "Target {} lost after {} missed frames",
                self.target_index,
                self.miss_count
            );
            self.points.clear();
            self.pose = None;
            self.good_count = 0;
            self.miss_count = 0;
            self.phase = TrackPhase::Lost;
            Transition::Lost
        } else {
            Transition::None
        }
    }

    pub fn set_points(&mut self, points: Vec<TrackedPoint>) {
        self.points = points;
    }

    pub fn set_pose(&mut self, pose: Option<Pose>) {
        self.pose = pose;
    }

    /// Back to Scanning with every per-point resource released.
    pub fn reset(&mut self) {
        self.phase = TrackPhase::Scanning;
        self.good_count = 0;
        self.miss_count = 0;
        self.points.clear();
        self.pose = None;
    }
}
