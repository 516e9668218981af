use thiserror::Error;

/// A serialized feature database could not be materialized.
///
/// Loading is all-or-nothing: whenever one of these is returned no part of
/// the buffer has been handed to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CorruptDatabaseError {
    #[error("database magic marker is missing or invalid")]
    BadMagic,

    #[error("unsupported database format version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },

    #[error("database truncated while reading {context}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        context: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("database checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("{0} unexpected bytes after database checksum")]
    TrailingBytes(usize),

    #[error("invalid database layout: {0}")]
    InvalidLayout(String),
}

/// The direct pose solver could not produce a pose for this set of
/// correspondences. The tracker treats both variants as a failed detection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PoseError {
    #[error("at least 4 correspondences are required, got {found}")]
    InsufficientCorrespondences { found: usize },

    #[error("degenerate point configuration: {0}")]
    DegeneratePose(&'static str),
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("no target images supplied")]
    NoTargets,

    #[error("target {index} has an empty image ({width}x{height})")]
    EmptyImage { index: usize, width: u32, height: u32 },

    #[error("target {index} pixel buffer holds {actual} bytes, expected {expected}")]
    BufferSizeMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("target {index} is {width}x{height}, below the {minimum}px minimum side length")]
    ImageTooSmall {
        index: usize,
        width: u32,
        height: u32,
        minimum: u32,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}
