#![forbid(unsafe_code)]

//! Encrypted, handshaken, point-to-point TCP connections. The crate is
//! organized the way the connection actually behaves at runtime:
//!
//! - [`config`] / [`flags`]: the tunables and run-time bits a `Connection`
//!   carries under its connection lock.
//! - [`collab`]: the collaborator traits a consumer can plug in
//!   (`Logger`, `Dispatcher`, `PacketCodec`) and their defaults.
//! - [`delivery`]: the bounded queue and callback plumbing packets pass
//!   through on their way to the consumer.
//! - [`channel`]: the adapter that lets a rekey ride as ordinary control
//!   packets over an already-encrypted connection.
//! - [`connection`]: `Connection` itself, tying the above together with
//!   `veilnet-handshake` and `veilnet-wire`.

pub mod channel;
pub mod collab;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod flags;
pub mod listener;

pub use collab::{BincodeCodec, Dispatcher, DisconnectReason, InlineDispatcher, Logger, NopLogger, PacketCodec, StdLogger};
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionError};
pub use flags::{ConfigFlags, RunFlags};
pub use listener::Listener;

pub use veilnet_wire::{ConnectionId, Packet};
