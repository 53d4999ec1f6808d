//! Lightweight publish/subscribe message bus for inter-process communication.
//!
//! Processes embed a [`client::Client`] that connects over TCP to a central
//! broker; the broker forwards every message published on a named channel to
//! all clients subscribed to that channel. Delivery is best-effort: nothing
//! is persisted, acknowledged, or replayed. Each module focuses on a
//! concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for the standalone broker.
//! - [`broker`] accepts TCP connections, keeps the channel routing table,
//!   and fans published frames out to subscribers.
//! - [`client`] maintains the connection to the broker, hiding reconnection
//!   behind blocking `send` and `receive` calls.
//! - [`message`] defines the message tuple and the length-prefixed JSON
//!   frame codec shared by both sides.
//!
//! Integration and end-to-end tests use this crate directly to exercise the
//! routing table and the wire protocol.

pub mod broker;
pub mod cli;
pub mod client;
pub mod message;
