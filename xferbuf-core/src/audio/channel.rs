//! Sink that hands every written block to a crossbeam channel.
//!
//! Lets a caller observe exactly what the buffer process played, in order.
//! Useful with [`SpawnMode::Thread`](crate::config::SpawnMode::Thread); a forked
//! buffer process would be sending into its own copy of the channel.

use crossbeam_channel::{Receiver, Sender};

use crate::{
    audio::{
        sink::{Sink, SinkFactory, SinkProperties},
        AudioFormat, Encoding,
    },
    config::SessionParams,
    error::SinkError,
};

pub const CHANNEL_DRIVER: &str = "channel";

/// What a [`ChannelSink`] reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Opened(AudioFormat),
    Data(Vec<u8>),
    Flushed,
    Drained,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ChannelSinkFactory {
    tx: Sender<SinkEvent>,
}

impl ChannelSinkFactory {
    /// Create a factory and the receiving end its sinks report into.
    pub fn new() -> (Self, Receiver<SinkEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl SinkFactory for ChannelSinkFactory {
    fn default_driver(&self) -> &str {
        CHANNEL_DRIVER
    }

    fn create(
        &self,
        driver: &str,
        _device: Option<&str>,
        _params: &SessionParams,
    ) -> Result<Box<dyn Sink>, SinkError> {
        if driver != CHANNEL_DRIVER {
            return Err(SinkError::UnknownDriver(driver.to_string()));
        }
        Ok(Box::new(ChannelSink {
            tx: self.tx.clone(),
            open: false,
        }))
    }
}

pub struct ChannelSink {
    tx: Sender<SinkEvent>,
    open: bool,
}

impl ChannelSink {
    fn emit(&self, event: SinkEvent) -> Result<(), SinkError> {
        self.tx
            .send(event)
            .map_err(|_| SinkError::write_failed("sink receiver dropped"))
    }
}

impl Sink for ChannelSink {
    fn properties(&self) -> SinkProperties {
        SinkProperties::OFFLINE
    }

    fn open(&mut self, format: Option<&AudioFormat>) -> Result<Option<AudioFormat>, SinkError> {
        if let Some(fmt) = format {
            self.emit(SinkEvent::Opened(*fmt))?;
        }
        self.open = true;
        Ok(None)
    }

    fn encodings(&mut self, _rate: u32, _channels: u16) -> Encoding {
        Encoding::ALL.into_iter().fold(Encoding::NONE, |acc, e| acc | e)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
        if !self.open {
            return Err(SinkError::Closed);
        }
        self.emit(SinkEvent::Data(bytes.to_vec()))?;
        Ok(bytes.len())
    }

    fn flush(&mut self) {
        let _ = self.emit(SinkEvent::Flushed);
    }

    fn drain(&mut self) {
        let _ = self.emit(SinkEvent::Drained);
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if std::mem::replace(&mut self.open, false) {
            let _ = self.emit(SinkEvent::Closed);
        }
        Ok(())
    }
}
