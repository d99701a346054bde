//! A single-connection WebSocket server endpoint for small devices.
//!
//! The server upgrades one TCP connection at a time, answers pings, and hands
//! every text frame it receives to the application through a bounded
//! [`Mailbox`]. Frames carry at most 125 bytes of payload.

mod error;
pub use error::{Error, HandshakeError, Result, SendError};

pub mod config;
pub use config::{Config, ExhaustionPolicy};

pub mod dispatch;
pub use dispatch::{Inbox, Mailbox, Message};

pub mod frame;

pub mod handshake;

mod payload;
pub use payload::{Budget, Exhausted, Payload};

mod server;
pub use server::Server;

mod socket;
pub use socket::{Connection, ConnectionId, Endpoint, LiveConnection, State};
