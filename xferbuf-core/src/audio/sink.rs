//! Abstract device sink.
//!
//! Sinks are created and driven only inside the buffer process, but the
//! process may run on its own thread, so sinks are `Send`. A driver whose
//! handle is not `Send` keeps it on a thread of its own.

use crate::{
    audio::{AudioFormat, Encoding},
    config::SessionParams,
    error::SinkError,
};

/// Behavioural properties of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkProperties {
    /// Plays in real time (a sound card, not a file or pipe).
    pub live: bool,
    /// Keeps running while paused, so it must not be closed on pause.
    pub persistent: bool,
}

impl SinkProperties {
    pub const LIVE: SinkProperties = SinkProperties {
        live: true,
        persistent: false,
    };

    pub const OFFLINE: SinkProperties = SinkProperties {
        live: false,
        persistent: false,
    };

    /// A live, non-persistent device is closed on pause and reopened on
    /// resume, so it does not underrun while nobody feeds it.
    pub fn is_sensitive(&self) -> bool {
        self.live && !self.persistent
    }
}

/// Concrete device I/O used by the buffer process.
pub trait Sink: Send {
    fn properties(&self) -> SinkProperties {
        SinkProperties::LIVE
    }

    /// Device the driver settled on, when it picked one itself.
    fn device(&self) -> Option<&str> {
        None
    }

    /// Human readable device name.
    fn real_name(&self) -> Option<&str> {
        None
    }

    /// Open the device. `None` opens in probe mode, for format queries only.
    ///
    /// Returns the format the device prefers, if it reports one.
    fn open(&mut self, format: Option<&AudioFormat>) -> Result<Option<AudioFormat>, SinkError>;

    /// Encodings supported at `rate` and `channels`. Only valid while open.
    fn encodings(&mut self, rate: u32, channels: u16) -> Encoding;

    /// Write interleaved PCM. Returns the number of bytes consumed.
    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError>;

    /// Discard anything queued inside the device.
    fn flush(&mut self) {}

    /// Block until anything queued inside the device has played.
    fn drain(&mut self) {}

    fn pause(&mut self) {}

    fn close(&mut self) -> Result<(), SinkError>;
}

/// Creates sinks by driver name inside the buffer process.
pub trait SinkFactory: Send {
    /// Driver used when the controller does not name one.
    fn default_driver(&self) -> &str;

    fn create(
        &self,
        driver: &str,
        device: Option<&str>,
        params: &SessionParams,
    ) -> Result<Box<dyn Sink>, SinkError>;
}
