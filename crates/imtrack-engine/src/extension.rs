//! Optional hooks into the frame pipeline.
//!
//! Every hook has a no-op default, so an extension implements only the ones
//! it needs. Hooks run on the frame loop's thread during the commit step.

use imtrack_core::img::Frame;
use imtrack_core::pose::Pose;
use imtrack_core::track::TrackedPoint;
use log::debug;

use crate::detection::DetectionAttempt;

pub trait TrackerExtension: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Before any work is done for `frame`.
    fn before_process(&self, _frame: &Frame) {}

    /// After detection ran for one target.
    fn after_match(&self, _attempt: &DetectionAttempt) {}

    /// After the tracked points of one target were updated.
    fn after_track(&self, _target_index: usize, _points: &[TrackedPoint]) {}

    /// May replace the pose reported for a target, or drop it with `None`.
    fn filter_pose(&self, _target_index: usize, pose: Pose) -> Option<Pose> {
        Some(pose)
    }

    /// Returning false suppresses this frame's update event for the target.
    fn should_show(&self, _target_index: usize) -> bool {
        true
    }
}

#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Box<dyn TrackerExtension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: Box<dyn TrackerExtension>) {
        debug!(target: "imtrack_engine::extension", "Registered extension {}", extension.name());
        self.extensions.push(extension);
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn before_process(&self, frame: &Frame) {
        for ext in &self.extensions {
            ext.before_process(frame);
        }
    }

    pub fn after_match(&self, attempt: &DetectionAttempt) {
        for ext in &self.extensions {
            ext.after_match(attempt);
        }
    }

    pub fn after_track(&self, target_index: usize, points: &[TrackedPoint]) {
        for ext in &self.extensions {
            ext.after_track(target_index, points);
        }
    }

    /// Threads the pose through every extension in registration order; the
    /// first `None` drops it.
    pub fn filter_pose(&self, target_index: usize, pose: Pose) -> Option<Pose> {
        self.extensions
            .iter()
            .try_fold(pose, |pose, ext| ext.filter_pose(target_index, pose))
    }

    pub fn should_show(&self, target_index: usize) -> bool {
        self.extensions.iter().all(|ext| ext.should_show(target_index))
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.extensions.iter().map(|ext| ext.name()))
            .finish()
    }
}
