//! Command channel between the controller and the buffer process.
//!
//! Every command is one byte, optionally followed by a payload. Audio never
//! travels here; it goes through the shared ring.

pub mod channel;
pub mod command;
pub mod wire;
