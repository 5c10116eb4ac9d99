//! Error kinds callers can match on.
//!
//! Everything else (model, codec, tensor and I/O failures) travels as a plain
//! [`anyhow::Error`]. These variants are raised through `anyhow` too, and can
//! be recovered with `err.downcast_ref::<DecodeError>()`.

use thiserror::Error;

use crate::models::Capability;

/// Conditions the decode and training paths refuse to paper over.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("unrecognized task tag: {0:?}")]
    UnknownTask(String),

    #[error("task {task} cannot be decoded by the {mode} loop")]
    TaskNotSupported { task: String, mode: &'static str },

    #[error("conflicting sampling policy: {0}")]
    PolicyConflict(String),

    #[error("logit filtering left no candidate tokens")]
    NoCandidates,

    #[error("model lacks the `{0}` capability")]
    MissingCapability(Capability),

    #[error("decode cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}
