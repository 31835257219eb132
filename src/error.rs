// Engine error taxonomy
// Every fallible engine operation returns one of these; the command bridge
// turns them into booleans/defaults before they reach the host.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt stream: {0}")]
    CorruptStream(String),

    #[error("Seek to frame {requested} is out of range (track has {total} frames)")]
    SeekOutOfRange { requested: u64, total: u64 },

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio engine is not initialized")]
    EngineNotInitialized,

    #[error("Cannot {op} while {state}")]
    InvalidState { op: &'static str, state: &'static str },

    #[error("Failed to load track: {reason}")]
    LoadError { reason: Box<EngineError> },
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Wrap a failure that happened while loading a track
    pub fn load(reason: EngineError) -> Self {
        match reason {
            // Never nest load errors
            err @ EngineError::LoadError { .. } => err,
            other => EngineError::LoadError { reason: Box::new(other) },
        }
    }

    /// The underlying cause, looking through `LoadError`
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::LoadError { reason } => reason.root(),
            other => other,
        }
    }

    /// Stable numeric code handed across the native boundary
    pub fn code(&self) -> i32 {
        match self.root() {
            EngineError::FileNotFound(_) => 1,
            EngineError::UnsupportedFormat(_) => 2,
            EngineError::CorruptStream(_) => 3,
            EngineError::SeekOutOfRange { .. } => 4,
            EngineError::DeviceUnavailable(_) => 5,
            EngineError::EngineNotInitialized => 6,
            EngineError::InvalidState { .. } => 7,
            EngineError::LoadError { .. } => 8,
        }
    }
}
