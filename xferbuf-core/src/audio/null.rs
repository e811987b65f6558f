//! Sink that discards audio, optionally at real-time pace.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{
    audio::{
        sink::{Sink, SinkFactory, SinkProperties},
        AudioFormat, Encoding,
    },
    config::SessionParams,
    error::SinkError,
};

pub const NULL_DRIVER: &str = "null";

/// Counters shared between every sink a [`NullSinkFactory`] creates.
///
/// Only meaningful when the buffer process runs as a thread; a forked
/// process updates its own copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub opens: u32,
    pub closes: u32,
    pub writes: u64,
    pub bytes_written: u64,
    pub flushes: u32,
    pub drains: u32,
    pub pauses: u32,
    pub last_format: Option<AudioFormat>,
}

#[derive(Debug, Clone)]
pub struct NullSinkFactory {
    supported: Encoding,
    default_format: Option<AudioFormat>,
    realtime: bool,
    stats: Arc<Mutex<SinkStats>>,
}

impl Default for NullSinkFactory {
    fn default() -> Self {
        Self {
            supported: Encoding::SIGNED_16 | Encoding::FLOAT_32,
            default_format: Some(AudioFormat::new(44_100, 2, Encoding::SIGNED_16)),
            realtime: false,
            stats: Arc::new(Mutex::new(SinkStats::default())),
        }
    }
}

impl NullSinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for the playback duration of every write.
    pub fn realtime(mut self, enabled: bool) -> Self {
        self.realtime = enabled;
        self
    }

    pub fn supporting(mut self, encodings: Encoding) -> Self {
        self.supported = encodings;
        self
    }

    pub fn stats(&self) -> SinkStats {
        self.stats.lock().clone()
    }
}

impl SinkFactory for NullSinkFactory {
    fn default_driver(&self) -> &str {
        NULL_DRIVER
    }

    fn create(
        &self,
        driver: &str,
        device: Option<&str>,
        _params: &SessionParams,
    ) -> Result<Box<dyn Sink>, SinkError> {
        if driver != NULL_DRIVER {
            return Err(SinkError::UnknownDriver(driver.to_string()));
        }
        Ok(Box::new(NullSink {
            device: device.map(str::to_string),
            supported: self.supported,
            default_format: self.default_format,
            realtime: self.realtime,
            format: None,
            open: false,
            stats: Arc::clone(&self.stats),
        }))
    }
}

pub struct NullSink {
    device: Option<String>,
    supported: Encoding,
    default_format: Option<AudioFormat>,
    realtime: bool,
    format: Option<AudioFormat>,
    open: bool,
    stats: Arc<Mutex<SinkStats>>,
}

impl Sink for NullSink {
    fn properties(&self) -> SinkProperties {
        SinkProperties::OFFLINE
    }

    fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    fn real_name(&self) -> Option<&str> {
        Some("null output")
    }

    fn open(&mut self, format: Option<&AudioFormat>) -> Result<Option<AudioFormat>, SinkError> {
        if let Some(fmt) = format {
            if !self.supported.contains(fmt.encoding) {
                return Err(SinkError::open(format!("unsupported format {fmt}")));
            }
        }
        self.format = format.copied();
        self.open = true;
        let mut stats = self.stats.lock();
        stats.opens += 1;
        if format.is_some() {
            stats.last_format = self.format;
        }
        Ok(self.default_format)
    }

    fn encodings(&mut self, _rate: u32, channels: u16) -> Encoding {
        if (1..=8).contains(&channels) {
            self.supported
        } else {
            Encoding::NONE
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
        if !self.open {
            return Err(SinkError::Closed);
        }
        if self.realtime {
            if let Some(byte_rate) = self.format.map(|f| f.byte_rate()).filter(|r| *r > 0) {
                let micros = bytes.len() as u64 * 1_000_000 / byte_rate as u64;
                std::thread::sleep(Duration::from_micros(micros));
            }
        }
        let mut stats = self.stats.lock();
        stats.writes += 1;
        stats.bytes_written += bytes.len() as u64;
        Ok(bytes.len())
    }

    fn flush(&mut self) {
        self.stats.lock().flushes += 1;
    }

    fn drain(&mut self) {
        self.stats.lock().drains += 1;
    }

    fn pause(&mut self) {
        self.stats.lock().pauses += 1;
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.open {
            self.open = false;
            self.stats.lock().closes += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_driver_is_rejected() {
        let factory = NullSinkFactory::new();
        let err = factory
            .create("alsa", None, &SessionParams::default())
            .err()
            .expect("alsa is not a null driver");
        assert!(matches!(err, SinkError::UnknownDriver(_)));
    }

    #[test]
    fn writes_are_counted_while_open() {
        let factory = NullSinkFactory::new();
        let mut sink = factory
            .create(NULL_DRIVER, Some("dev0"), &SessionParams::default())
            .unwrap();
        assert!(matches!(sink.write(&[0; 4]), Err(SinkError::Closed)));

        let fmt = AudioFormat::new(48_000, 2, Encoding::SIGNED_16);
        sink.open(Some(&fmt)).unwrap();
        assert_eq!(sink.write(&[0; 16]).unwrap(), 16);
        sink.close().unwrap();

        let stats = factory.stats();
        assert_eq!(stats.bytes_written, 16);
        assert_eq!(stats.last_format, Some(fmt));
        assert_eq!((stats.opens, stats.closes), (1, 1));
    }

    #[test]
    fn open_refuses_unsupported_encoding() {
        let factory = NullSinkFactory::new().supporting(Encoding::FLOAT_32);
        let mut sink = factory
            .create(NULL_DRIVER, None, &SessionParams::default())
            .unwrap();
        let fmt = AudioFormat::new(44_100, 2, Encoding::SIGNED_16);
        assert!(matches!(sink.open(Some(&fmt)), Err(SinkError::Open(_))));
    }
}
