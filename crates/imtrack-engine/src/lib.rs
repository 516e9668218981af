pub mod cancel;
pub mod detection;
pub mod error;
pub mod events;
pub mod extension;
pub mod logging;
pub mod runtime;
pub mod state;

pub use cancel::CancellationToken;
pub use detection::{Detection, DetectionAttempt, DetectionFailure, FeatureDetection, FrameDetector, PointTracker};
pub use error::EngineError;
pub use events::{FoundPayload, LostPayload, NullListener, TrackerEvent, TrackerListener, UpdatePayload};
pub use extension::{ExtensionRegistry, TrackerExtension};
pub use runtime::{ImageTracker, TargetSource};
pub use state::{TargetTrack, TrackPhase, Transition};
