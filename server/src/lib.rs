//! # Console Relay Server
//!
//! This library implements a relay for game-server console logs. Game
//! servers send their log lines as UDP datagrams to the relay; subscribers
//! connect over TCP, name the game server they are interested in, and get
//! every line from that server delivered as a framed message.
//!
//! ## Core Responsibilities
//!
//! ### Registration
//! Every new TCP connection goes through a short handshake: the relay
//! announces its identity, reads one connection request within a deadline,
//! checks the password and the requested origin, and binds the connection
//! into a free slot. Bad requests get a failure reason and are closed.
//!
//! ### Abuse Prevention
//! Failed registrations are counted per IP. Once an IP reaches the
//! configured threshold it is banned, and banned peers are dropped without
//! a single byte of response. Bans expire on a fixed sweep.
//!
//! ### Fan-out
//! Datagrams from origins nobody asked for are dropped immediately. The
//! rest pass through a single-capacity mailbox to one sender task that
//! writes the frame to every matching subscriber, so delivery order
//! always follows arrival order.
//!
//! ### Liveness
//! Subscribers never speak after registration, so the relay probes them
//! with heartbeats at a fixed interval and evicts any whose socket has
//! failed, freeing the slot for the next registration.
//!
//! ## Architecture Design
//!
//! ### Task Per Concern
//! The relay runs one tokio task per concern (client listener, message
//! listener, sender, liveness supervisor, ban sweeper, control listener,
//! statistics) plus one short-lived task per registration. They share a
//! single [`state::RelayState`] and stop together when its shutdown signal
//! is raised.
//!
//! ### Lock Discipline
//! The slot table and ban ledger sit behind async read-write locks that
//! are never held across socket I/O. Each subscriber socket has its own
//! mutex so heartbeats and messages never interleave on the wire.
//!
//! ### Control Channel
//! A loopback UDP socket answers status queries and accepts a shutdown
//! request, using the big-endian control frames from the `shared` crate.

pub mod ban_ledger;
pub mod config;
pub mod control;
pub mod error;
pub mod fanout;
pub mod liveness;
pub mod logging;
pub mod network;
pub mod registration;
pub mod slot_table;
pub mod state;
pub mod stats;

pub use config::RelayConfig;
pub use error::{RegistrationError, ServerError};
pub use network::Server;
