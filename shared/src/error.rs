use thiserror::Error;

use crate::reasons;

/// Failure to read or decode a frame.
///
/// `Timeout` is kept apart from `Malformed` so callers can pick a different
/// penalty for a silent peer than for one sending garbage.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Bad magic, unknown type, out-of-range length or truncated body.
    /// `reason` is the wire reason sent back to a subscriber.
    #[error("malformed frame: {reason}")]
    Malformed { reason: &'static str },
    #[error("timed out waiting for frame data")]
    Timeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    pub fn malformed() -> Self {
        FrameError::Malformed {
            reason: reasons::INVALID_PACKET,
        }
    }

    pub fn bad_length() -> Self {
        FrameError::Malformed {
            reason: reasons::INVALID_CONTENT_LENGTH,
        }
    }
}

/// Structural problems in a connection-request payload.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    #[error("request payload is empty")]
    Empty,
    #[error("request payload does not start with the request marker")]
    MissingMarker,
    #[error("expected 3 request fields, found {0}")]
    FieldCount(usize),
}

impl RequestError {
    pub fn reason(&self) -> &'static str {
        match self {
            RequestError::Empty => reasons::EMPTY_PACKET,
            RequestError::MissingMarker | RequestError::FieldCount(_) => reasons::INVALID_PACKET,
        }
    }
}
