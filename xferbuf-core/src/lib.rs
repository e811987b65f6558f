//! # xferbuf
//!
//! Streaming audio output through a separate buffer process.
//!
//! ## Architecture
//!
//! ```text
//! caller ─► BufferController ──write──► shared RingBuffer (mmap) ──► BufferProcess ─► Sink
//!                 │                                                      ▲
//!                 └──────── CommandChannel (socket pair) ────────────────┘
//!                         commands + payloads ⇄ OK / ERROR / PONG
//! ```
//!
//! The controller only ever writes the ring's write index and the buffer
//! process only its read index, so the ring needs no lock. Control flows as
//! one request and one response at a time over the command channel.

#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod config;
pub mod engine;
pub mod error;
pub mod ipc;

// Convenience re-exports for downstream crates
pub use audio::{
    channel::{ChannelSinkFactory, SinkEvent},
    null::{NullSinkFactory, SinkStats},
    output::PlaybackState,
    sink::{Sink, SinkFactory, SinkProperties},
    AudioFormat, Encoding,
};
pub use config::{BufferConfig, OutputFlags, SessionParams, SpawnMode};
pub use engine::BufferController;
pub use error::{BufferError, ErrorCode, Result, SinkError};
pub use ipc::command::OpenedSink;

#[cfg(feature = "audio-cpal")]
pub use audio::device::{CpalSinkFactory, CPAL_DRIVER};
