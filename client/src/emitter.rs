//! Fake game-server log traffic, used by `emitter` to exercise a relay.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Local};
use log::debug;
use tokio::net::UdpSocket;

/// Type byte game servers put after the magic in log datagrams.
pub const LOG_PACKET_TYPE: u8 = b'R';

const PLAYER: &str = "\"SomePlayer<99><STEAM_1:1:01234567><Survivor><Biker><ALIVE><80+0>\
<setpos_exact 5033.42 -13677.53 -1.97; setang -0.53 175.02 0.00><Area 76076>\"";
const CONSOLE: &str = "\"Console<0><Console><Console>\"";

/// What kind of chat line to fake.
#[derive(Debug, Clone)]
pub struct ChatLine {
    pub text: String,
    pub say_team: bool,
    pub from_console: bool,
}

impl ChatLine {
    /// `L MM/dd/yyyy - HH:mm:ss: "<speaker>" say "<text>"`
    pub fn render(&self, now: DateTime<Local>) -> String {
        format!(
            "L {}: {} {} \"{}\"",
            now.format("%m/%d/%Y - %H:%M:%S"),
            if self.from_console { CONSOLE } else { PLAYER },
            if self.say_team { "say_team" } else { "say" },
            self.text
        )
    }
}

/// Wraps a log line the way game servers send it: relay magic, the log
/// type byte, the line and a NUL terminator.
pub fn encode_datagram(line: &str) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(5 + line.len() + 1);
    datagram.extend_from_slice(&shared::RELAY_MAGIC.to_le_bytes());
    datagram.push(LOG_PACKET_TYPE);
    datagram.extend_from_slice(line.as_bytes());
    datagram.push(0);
    datagram
}

/// Sends `line` to `target` every `delay` until `limit` datagrams are out.
/// A limit of zero never stops. Returns how many were sent.
pub async fn emit(
    socket: &UdpSocket,
    target: SocketAddr,
    line: &ChatLine,
    delay: Duration,
    limit: u64,
) -> std::io::Result<u64> {
    let mut sent = 0;
    while limit == 0 || sent < limit {
        let datagram = encode_datagram(&line.render(Local::now()));
        socket.send_to(&datagram, target).await?;
        sent += 1;
        debug!("Sent datagram {} to {}", sent, target);
        if limit == 0 || sent < limit {
            tokio::time::sleep(delay).await;
        }
    }
    Ok(sent)
}
