//! Presence directory and point-to-point relay.
//!
//! A central directory keeps track of which participants are reachable and at
//! which address, and relays text messages between them. Every message travels
//! over its own short-lived TCP connection: open, write one JSON document,
//! close. Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for directory and participant modes.
//! - [`telemetry`] installs the `tracing` subscriber (stderr or a log file).
//! - [`envelope`] defines the JSON envelopes exchanged by both roles.
//! - [`transport`] implements one-document-per-connection framing and the
//!   accept loop shared by both roles.
//! - [`registry`] holds participant records and makes routing decisions.
//! - [`directory`] serves the registry over the network.
//! - [`session`] is the participant state machine, free of any I/O.
//! - [`participant`] drives a session from a console and the network.
//!
//! Integration tests use this crate directly over loopback TCP.

pub mod cli;
pub mod directory;
pub mod envelope;
pub mod participant;
pub mod registry;
pub mod session;
pub mod telemetry;
pub mod transport;
