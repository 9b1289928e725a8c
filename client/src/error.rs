use std::io;

use shared::FrameError;
use thiserror::Error;

/// Failures of the companion tools.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to {address}: {source}")]
    Connect { address: String, source: io::Error },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no reply from the relay")]
    NoReply,
    #[error("rejecting control response: invalid timestamp")]
    StaleReply,
    #[error("rejecting control response: unexpected {0}")]
    UnexpectedReply(&'static str),
}
