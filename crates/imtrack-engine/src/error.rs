use imtrack_core::error::{CompileError, ConfigError, CorruptDatabaseError};
use thiserror::Error;

/// Failures while setting up an [`ImageTracker`](crate::ImageTracker).
/// Nothing that happens while processing frames is reported this way.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Database(#[from] CorruptDatabaseError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid camera intrinsics: {0}")]
    InvalidCamera(String),

    #[error("database descriptors are {found} words wide, the detector produces {expected}")]
    IncompatibleDescriptors { found: usize, expected: usize },

    #[error("target source contains no targets")]
    NoTargets,
}
