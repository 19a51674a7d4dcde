//! Link errors
//!
//! Only fatal conditions cross the engine boundary; framing and checksum
//! errors are absorbed by the synchronizer and engine.

use thiserror::Error;

/// Errors that can terminate a link
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport not open")]
    NotOpen,

    #[error("sequence violation: expected {expected}, got {actual}")]
    SequenceViolation { expected: u16, actual: u16 },

    #[error("link dead: liveness probes exhausted")]
    LinkDead,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
