pub mod camera;
pub mod compiler;
pub mod config;
pub mod db;
pub mod detect;
pub mod error;
pub mod hd;
pub mod img;
pub mod matcher;
pub mod pose;
pub mod track;

pub use camera::CameraIntrinsics;
pub use compiler::{Compiler, PixelFormat, TargetImage};
pub use config::EngineConfig;
pub use db::FeatureDatabase;
pub use error::{CompileError, ConfigError, CorruptDatabaseError, PoseError};
pub use img::Frame;
pub use pose::Pose;
