use std::path::PathBuf;

use shared::{reasons, FrameError, RequestError};
use thiserror::Error;

/// Why a registration attempt did not end with a bound slot.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Bad magic, wrong packet type or an out-of-range length.
    #[error("malformed frame ({reason})")]
    MalformedFrame { reason: &'static str },
    /// Nothing (or not enough) arrived within the read deadline.
    #[error("no connection request within the read deadline")]
    FrameTimeout,
    /// The request decoded but its content was refused.
    #[error("protocol violation ({reason})")]
    ProtocolViolation { reason: &'static str },
    #[error("no free subscriber slot")]
    CapacityExceeded,
    #[error("transport failure: {0}")]
    TransportFailure(#[from] std::io::Error),
}

impl RegistrationError {
    /// Whether this failure counts against the peer's IP in the ban ledger.
    /// A full relay is not the peer's fault.
    pub fn is_strike(&self) -> bool {
        !matches!(self, RegistrationError::CapacityExceeded)
    }

    /// Text of the connection-failure frame owed to the peer, if any.
    /// Timeouts and transport failures close the connection silently.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            RegistrationError::MalformedFrame { reason }
            | RegistrationError::ProtocolViolation { reason } => Some(reason),
            RegistrationError::CapacityExceeded => Some(reasons::TOO_MANY_CONNECTIONS),
            RegistrationError::FrameTimeout | RegistrationError::TransportFailure(_) => None,
        }
    }
}

impl From<FrameError> for RegistrationError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Malformed { reason } => RegistrationError::MalformedFrame { reason },
            FrameError::Timeout => RegistrationError::FrameTimeout,
            FrameError::Io(e) => RegistrationError::TransportFailure(e),
        }
    }
}

impl From<RequestError> for RegistrationError {
    fn from(err: RequestError) -> Self {
        RegistrationError::ProtocolViolation {
            reason: err.reason(),
        }
    }
}

/// Startup failures of the relay process.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {listener} on {address}: {source}")]
    Bind {
        listener: &'static str,
        address: String,
        source: std::io::Error,
    },
    #[error("failed to read configuration {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("configuration is not valid JSON: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("configuration must be a JSON object")]
    ConfigShape,
}
