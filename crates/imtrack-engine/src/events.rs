use imtrack_core::pose::Pose;
use nalgebra::Vector2;

/// Per-frame output for a tracked target. The three point vectors are
/// parallel: entry `i` of each describes the same tracked point.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePayload {
    pub target_index: usize,
    pub frame_id: u64,
    /// Filtered screen positions, in frame pixels.
    pub screen_points: Vec<Vector2<f64>>,
    /// Correlation score of each point in this frame; 0 when rejected.
    pub reliabilities: Vec<f32>,
    /// Running acceptance rate of each point, in [0, 1].
    pub stabilities: Vec<f32>,
    pub pose: Option<Pose>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundPayload {
    pub target_index: usize,
    pub frame_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostPayload {
    pub target_index: usize,
    pub frame_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Update(UpdatePayload),
    Found(FoundPayload),
    Lost(LostPayload),
}

impl TrackerEvent {
    pub fn target_index(&self) -> usize {
        match self {
            TrackerEvent::Update(p) => p.target_index,
            TrackerEvent::Found(p) => p.target_index,
            TrackerEvent::Lost(p) => p.target_index,
        }
    }
}

/// Callback bundle receiving lifecycle and point events, in frame order.
pub trait TrackerListener: Send {
    fn on_update(&mut self, _payload: &UpdatePayload) {}
    fn on_found(&mut self, _payload: &FoundPayload) {}
    fn on_lost(&mut self, _payload: &LostPayload) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl TrackerListener for NullListener {}

pub(crate) fn dispatch(listener: &mut dyn TrackerListener, event: &TrackerEvent) {
    match event {
        TrackerEvent::Update(p) => listener.on_update(p),
        TrackerEvent::Found(p) => listener.on_found(p),
        TrackerEvent::Lost(p) => listener.on_lost(p),
    }
}
