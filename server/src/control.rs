//! Out-of-band control channel: status queries and remote shutdown.

use log::{debug, info, warn};
use shared::{ControlFrame, ControlMessage};

use crate::state::RelayState;
use crate::stats::status_report;

/// What the listener should do after answering a control datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    pub frame: ControlFrame,
    /// Raise the shutdown signal once the reply is on its way.
    pub shutdown_after: bool,
}

/// Decodes one control datagram and builds the reply, if one is owed.
/// Replies carry the relay's clock at the time they are built.
pub async fn handle_control(state: &RelayState, datagram: &[u8]) -> Option<ControlReply> {
    let request = match ControlFrame::decode(datagram) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Ignoring control datagram: {}", e);
            return None;
        }
    };

    match request.message {
        ControlMessage::StatusRequest => {
            debug!("Status requested over the control channel");
            let report = status_report(state).await;
            Some(ControlReply {
                frame: ControlFrame::new(
                    shared::timestamp_millis(),
                    ControlMessage::StatusResponse(report),
                ),
                shutdown_after: false,
            })
        }
        ControlMessage::ShutdownRequest => {
            info!("Shutdown requested over the control channel");
            Some(ControlReply {
                frame: ControlFrame::new(
                    shared::timestamp_millis(),
                    ControlMessage::ShutdownResponse { accepted: true },
                ),
                shutdown_after: true,
            })
        }
        ControlMessage::StatusResponse(_) | ControlMessage::ShutdownResponse { .. } => {
            warn!("Ignoring control response sent to the relay");
            None
        }
    }
}
