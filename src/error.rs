//! Error taxonomy for the mask engine.
//!
//! Load failures are fatal to a session and surface to the caller.  Sequence
//! errors flag programming mistakes in stroke handling.  Worker errors travel
//! back inside the response envelope.  History integrity errors are only ever
//! produced by the validation entry point, never thrown mid-operation.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ops::worker::JobKind;

/// Largest accepted image edge, in pixels.
pub const MAX_IMAGE_DIM: u32 = 8192;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("image dimensions {width}×{height} outside 1–{max} px", max = MAX_IMAGE_DIM)]
    InvalidDimensions { width: u32, height: u32 },
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("no rendering surface is attached to the session")]
    MissingSurface,
}

impl From<image::ImageError> for LoadError {
    fn from(e: image::ImageError) -> Self {
        LoadError::Decode(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("no active stroke")]
    NoActiveStroke,
    #[error("a stroke is already active")]
    StrokeAlreadyActive,
}

/// Raised when the mask holds values other than 0 and 255.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("mask holds {count} non-binary values")]
    NonBinary { count: usize },
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum WorkerError {
    #[error("unknown message type '{0}'")]
    UnknownMessageType(String),
    #[error("payload does not match message type (expected {expected:?}, found {found:?})")]
    PayloadMismatch { expected: JobKind, found: JobKind },
    #[error("buffer holds {actual} bytes, expected {expected}")]
    InvalidBuffer { expected: usize, actual: usize },
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("worker job panicked: {0}")]
    Panicked(String),
    #[error("worker channel disconnected")]
    Disconnected,
}

impl From<Box<bincode::ErrorKind>> for WorkerError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        WorkerError::Serialization(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryIntegrityError {
    #[error("current index {current} outside [-1, {last}]")]
    CurrentIndexOutOfBounds { current: isize, last: isize },
    #[error("duplicate stroke id {0}")]
    DuplicateStrokeId(Uuid),
    #[error("duplicate checkpoint id {0}")]
    DuplicateCheckpointId(Uuid),
    #[error("checkpoint {id} references stroke index {stroke_index} (history holds {len} strokes)")]
    DanglingCheckpoint {
        id: Uuid,
        stroke_index: isize,
        len: usize,
    },
    #[error("checkpoints are not sorted by stroke index")]
    UnsortedCheckpoints,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("checkpoint index {stroke_index} outside [-1, {len}) strokes")]
    CheckpointOutOfRange { stroke_index: isize, len: usize },
    #[error("snapshot is {actual} bytes, mask is {expected}")]
    SnapshotSizeMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
