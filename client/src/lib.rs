//! # Console Relay Tools
//!
//! Companion tools for the console relay, built on the wire codecs in the
//! `shared` crate.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! The subscriber side of the relay protocol. A [`session::RelaySession`]
//! answers the relay's identity frame with a connection request, swallows
//! heartbeats and surfaces connection results and relayed log lines as
//! [`session::SessionEvent`]s. Drives the `console-logger` binary.
//!
//! ### Control Module (`control`)
//! Sends one status or shutdown request over the loopback control channel
//! and checks that the reply is fresh. Drives the `relayctl` binary.
//!
//! ### Emitter Module (`emitter`)
//! Produces datagrams shaped like a game server's log output so a relay can
//! be tested without a game server. Drives the `emitter` binary.

pub mod control;
pub mod emitter;
pub mod error;
pub mod session;

pub use error::ClientError;
