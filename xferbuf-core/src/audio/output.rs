//! `DeviceOutput`: the playback state machine around one sink.
//!
//! ## Lifecycle
//!
//! ```text
//! Dead ──open()──► Stopped ──start(fmt)──► Live ◄──resume()── Paused
//!   ▲                 ▲                      │                  ▲
//!   └────close()──────┴──────stop()──────────┴─────pause()──────┘
//! ```
//!
//! Every operation resets the error code first and leaves the reason for a
//! failure in [`DeviceOutput::error`], mirroring what gets reported over the
//! command channel.

use tracing::{debug, info, warn};

use crate::{
    audio::{
        sink::{Sink, SinkFactory, SinkProperties},
        AudioFormat, Encoding,
    },
    config::{OutputFlags, SessionParams},
    error::{ErrorCode, SinkError},
    ipc::command::OpenedSink,
};

/// Playback state, ordered so that anything above `Stopped` has a device open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PlaybackState {
    #[default]
    Dead,
    Stopped,
    Paused,
    Live,
}

impl PlaybackState {
    pub fn has_open_device(self) -> bool {
        self > PlaybackState::Stopped
    }
}

pub struct DeviceOutput {
    factory: Box<dyn SinkFactory>,
    sink: Option<Box<dyn Sink>>,
    properties: SinkProperties,
    driver: Option<String>,
    device: Option<String>,
    params: SessionParams,
    format: Option<AudioFormat>,
    frame_size: usize,
    state: PlaybackState,
    error: ErrorCode,
}

impl DeviceOutput {
    pub fn new(factory: Box<dyn SinkFactory>, params: SessionParams) -> Self {
        Self {
            factory,
            sink: None,
            properties: SinkProperties::LIVE,
            driver: None,
            device: None,
            params,
            format: None,
            frame_size: 0,
            state: PlaybackState::Dead,
            error: ErrorCode::Ok,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn error(&self) -> ErrorCode {
        self.error
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    /// Bytes per frame of the started format, 0 before `start`.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn set_params(&mut self, params: SessionParams) {
        self.params = params;
    }

    fn fail(&mut self, code: ErrorCode) -> ErrorCode {
        self.error = code;
        code
    }

    /// Load a driver. `driver` may be a comma separated list; the first one
    /// the factory can create wins. `None` picks the factory default.
    pub fn open(
        &mut self,
        driver: Option<&str>,
        device: Option<&str>,
    ) -> Result<OpenedSink, ErrorCode> {
        self.close();
        self.error = ErrorCode::Ok;

        let names = driver
            .map(str::to_string)
            .unwrap_or_else(|| self.factory.default_driver().to_string());
        let candidates: Vec<&str> = names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .collect();
        if candidates.is_empty() {
            return Err(self.fail(ErrorCode::BadDriverName));
        }

        let mut last_error = None;
        for name in candidates {
            match self.factory.create(name, device, &self.params) {
                Ok(sink) => {
                    info!(driver = name, device = ?device, "driver loaded");
                    self.properties = sink.properties();
                    self.driver = Some(name.to_string());
                    self.device = device
                        .map(str::to_string)
                        .or_else(|| sink.device().map(str::to_string));
                    self.sink = Some(sink);
                    self.state = PlaybackState::Stopped;
                    return Ok(self.opened());
                }
                Err(e) => {
                    debug!(driver = name, "driver unavailable: {e}");
                    last_error = Some(e);
                }
            }
        }

        let code = match last_error {
            Some(SinkError::Open(_)) => ErrorCode::DeviceOpen,
            _ => ErrorCode::BadDriver,
        };
        Err(self.fail(code))
    }

    fn opened(&self) -> OpenedSink {
        OpenedSink {
            driver: self.driver.clone(),
            device: self.device.clone(),
            real_name: self
                .sink
                .as_ref()
                .and_then(|s| s.real_name())
                .map(str::to_string),
        }
    }

    /// Drain, stop and unload the driver.
    pub fn close(&mut self) {
        self.drain();
        self.stop();
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close() {
                warn!("closing sink failed: {e}");
            }
            debug!(driver = ?self.driver, "driver unloaded");
        }
        self.driver = None;
        self.device = None;
        self.state = PlaybackState::Dead;
    }

    /// Open the device with `format` and go live.
    pub fn start(&mut self, format: AudioFormat) -> Result<(), ErrorCode> {
        self.stop();
        self.error = ErrorCode::Ok;
        if self.state != PlaybackState::Stopped {
            return Err(self.fail(ErrorCode::NoDriver));
        }
        let frame_size = format.frame_size();
        if frame_size == 0 || format.rate == 0 {
            warn!(%format, "refusing unusable format");
            return Err(self.fail(ErrorCode::ArgError));
        }
        let Some(sink) = self.sink.as_mut() else {
            return Err(self.fail(ErrorCode::NoDriver));
        };
        if let Err(e) = sink.open(Some(&format)) {
            warn!(%format, "device open failed: {e}");
            return Err(self.fail(ErrorCode::DeviceOpen));
        }
        info!(%format, "device started");
        self.format = Some(format);
        self.frame_size = frame_size;
        self.state = PlaybackState::Live;
        Ok(())
    }

    pub fn pause(&mut self) {
        self.error = ErrorCode::Ok;
        if self.state != PlaybackState::Live {
            return;
        }
        if let Some(sink) = self.sink.as_mut() {
            if self.properties.is_sensitive() {
                if let Err(e) = sink.close() {
                    warn!("closing sensitive device on pause failed: {e}");
                }
            } else {
                sink.pause();
            }
        }
        self.state = PlaybackState::Paused;
    }

    pub fn resume(&mut self) {
        self.error = ErrorCode::Ok;
        if self.state != PlaybackState::Paused {
            return;
        }
        if self.properties.is_sensitive() {
            let (Some(sink), Some(format)) = (self.sink.as_mut(), self.format) else {
                self.fail(ErrorCode::NoDriver);
                return;
            };
            if let Err(e) = sink.open(Some(&format)) {
                warn!(%format, "device reopen failed: {e}");
                self.fail(ErrorCode::DeviceOpen);
                return;
            }
        }
        self.state = PlaybackState::Live;
    }

    pub fn stop(&mut self) {
        self.error = ErrorCode::Ok;
        let device_open = match self.state {
            PlaybackState::Live => true,
            PlaybackState::Paused => !self.properties.is_sensitive(),
            PlaybackState::Dead | PlaybackState::Stopped => return,
        };
        if device_open {
            if let Some(sink) = self.sink.as_mut() {
                if let Err(e) = sink.close() {
                    warn!("closing device on stop failed: {e}");
                }
            }
        }
        self.state = PlaybackState::Stopped;
    }

    /// Write whole frames of `bytes` to the device. Returns bytes accepted.
    ///
    /// An interrupted write returns what was written so far without an
    /// error. Any other sink failure leaves `DevicePlay` in
    /// [`error`](Self::error).
    pub fn play(&mut self, bytes: &[u8]) -> usize {
        self.error = ErrorCode::Ok;
        if self.state == PlaybackState::Paused {
            self.resume();
        }
        if self.state != PlaybackState::Live {
            if self.error.is_ok() {
                self.error = ErrorCode::NotLive;
            }
            return 0;
        }
        let frame = self.frame_size.max(1);
        let whole = bytes.len() - bytes.len() % frame;
        let keep_playing = self.params.flags.contains(OutputFlags::KEEP_PLAYING);
        let Some(sink) = self.sink.as_mut() else {
            self.error = ErrorCode::NoDriver;
            return 0;
        };

        let mut written = 0;
        while written < whole {
            match sink.write(&bytes[written..whole]) {
                Ok(n) => {
                    written += n;
                    if n == 0 || !keep_playing {
                        break;
                    }
                }
                Err(SinkError::Interrupted) => {
                    debug!(written, "device write interrupted");
                    break;
                }
                Err(e) => {
                    warn!(written, "device write failed: {e}");
                    self.error = ErrorCode::DevicePlay;
                    break;
                }
            }
        }
        written
    }

    /// Discard audio queued inside the device.
    pub fn drop_queued(&mut self) {
        self.error = ErrorCode::Ok;
        if self.state == PlaybackState::Live && self.properties.live {
            if let Some(sink) = self.sink.as_mut() {
                sink.flush();
            }
        }
    }

    /// Let the device play out what it holds, then pause.
    pub fn drain(&mut self) {
        self.error = ErrorCode::Ok;
        if self.state == PlaybackState::Paused {
            self.resume();
        }
        if self.state != PlaybackState::Live {
            return;
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.drain();
        }
        self.pause();
    }

    /// Encodings the device takes at `rate` and `channels`.
    pub fn encodings(&mut self, rate: u32, channels: u16) -> Result<Encoding, ErrorCode> {
        self.stop();
        self.error = ErrorCode::Ok;
        if self.state != PlaybackState::Stopped {
            return Err(self.fail(ErrorCode::NoDriver));
        }
        let Some(sink) = self.sink.as_mut() else {
            return Err(self.fail(ErrorCode::NoDriver));
        };
        if let Err(e) = sink.open(None) {
            warn!("probe open failed: {e}");
            return Err(self.fail(ErrorCode::DeviceOpen));
        }
        let encodings = sink.encodings(rate, channels);
        if let Err(e) = sink.close() {
            warn!("closing probe failed: {e}");
        }
        Ok(encodings)
    }

    /// Format table for `rates` × `min_channels..=max_channels`.
    ///
    /// The first record is the device default (all zero when the device does
    /// not report one); each following record carries the encoding mask for
    /// one rate and channel count.
    pub fn formats(
        &mut self,
        rates: &[u32],
        min_channels: u16,
        max_channels: u16,
    ) -> Result<Vec<AudioFormat>, ErrorCode> {
        self.stop();
        self.error = ErrorCode::Ok;
        if self.state != PlaybackState::Stopped {
            return Err(self.fail(ErrorCode::NoDriver));
        }
        if min_channels == 0 || min_channels > max_channels {
            return Err(self.fail(ErrorCode::ArgError));
        }
        let Some(sink) = self.sink.as_mut() else {
            return Err(self.fail(ErrorCode::NoDriver));
        };
        let default = match sink.open(None) {
            Ok(default) => default.unwrap_or_default(),
            Err(e) => {
                warn!("probe open failed: {e}");
                return Err(self.fail(ErrorCode::DeviceOpen));
            }
        };

        let mut records = Vec::with_capacity(1 + rates.len() * usize::from(max_channels));
        records.push(default);
        for &rate in rates {
            for channels in min_channels..=max_channels {
                let encoding = sink.encodings(rate, channels);
                records.push(AudioFormat::new(rate, channels, encoding));
            }
        }
        if let Err(e) = sink.close() {
            warn!("closing probe failed: {e}");
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::null::NullSinkFactory;

    fn s16_stereo() -> AudioFormat {
        AudioFormat::new(44_100, 2, Encoding::SIGNED_16)
    }

    /// Live, non-persistent: closed on pause.
    struct LiveFactory(NullSinkFactory);

    struct LiveSink(Box<dyn Sink>);

    impl Sink for LiveSink {
        fn open(&mut self, f: Option<&AudioFormat>) -> Result<Option<AudioFormat>, SinkError> {
            self.0.open(f)
        }
        fn encodings(&mut self, rate: u32, channels: u16) -> Encoding {
            self.0.encodings(rate, channels)
        }
        fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
            self.0.write(bytes)
        }
        fn close(&mut self) -> Result<(), SinkError> {
            self.0.close()
        }
    }

    impl SinkFactory for LiveFactory {
        fn default_driver(&self) -> &str {
            "live"
        }
        fn create(
            &self,
            driver: &str,
            device: Option<&str>,
            params: &SessionParams,
        ) -> Result<Box<dyn Sink>, SinkError> {
            if driver != "live" {
                return Err(SinkError::UnknownDriver(driver.into()));
            }
            Ok(Box::new(LiveSink(self.0.create("null", device, params)?)))
        }
    }

    #[test]
    fn first_loadable_driver_in_a_list_wins() {
        let mut out = DeviceOutput::new(Box::new(NullSinkFactory::new()), SessionParams::default());
        let opened = out.open(Some("alsa, pulse ,null"), Some("card1")).unwrap();
        assert_eq!(opened.driver.as_deref(), Some("null"));
        assert_eq!(opened.device.as_deref(), Some("card1"));
        assert_eq!(opened.real_name.as_deref(), Some("null output"));
        assert_eq!(out.state(), PlaybackState::Stopped);
    }

    #[test]
    fn open_reports_bad_driver_names() {
        let mut out = DeviceOutput::new(Box::new(NullSinkFactory::new()), SessionParams::default());
        assert_eq!(out.open(Some(" , "), None), Err(ErrorCode::BadDriverName));
        assert_eq!(out.open(Some("alsa"), None), Err(ErrorCode::BadDriver));
        assert_eq!(out.state(), PlaybackState::Dead);
    }

    #[test]
    fn start_requires_a_driver_and_a_usable_format() {
        let mut out = DeviceOutput::new(Box::new(NullSinkFactory::new()), SessionParams::default());
        assert_eq!(out.start(s16_stereo()), Err(ErrorCode::NoDriver));

        out.open(None, None).unwrap();
        let bogus = AudioFormat::new(44_100, 2, Encoding::SIGNED_16 | Encoding::FLOAT_32);
        assert_eq!(out.start(bogus), Err(ErrorCode::ArgError));
        let unsupported = AudioFormat::new(44_100, 2, Encoding::SIGNED_24);
        assert_eq!(out.start(unsupported), Err(ErrorCode::DeviceOpen));

        out.start(s16_stereo()).unwrap();
        assert_eq!(out.state(), PlaybackState::Live);
        assert_eq!(out.frame_size(), 4);
    }

    #[test]
    fn play_writes_whole_frames_and_resumes_from_pause() {
        let factory = NullSinkFactory::new();
        let mut out = DeviceOutput::new(Box::new(factory.clone()), SessionParams::default());
        out.open(None, None).unwrap();
        out.start(s16_stereo()).unwrap();

        assert_eq!(out.play(&[0; 10]), 8);
        out.pause();
        assert_eq!(out.state(), PlaybackState::Paused);
        assert_eq!(out.play(&[0; 4]), 4);
        assert_eq!(out.state(), PlaybackState::Live);

        let stats = factory.stats();
        assert_eq!(stats.bytes_written, 12);
        assert_eq!(stats.pauses, 1);
    }

    #[test]
    fn play_without_a_device_is_not_live() {
        let mut out = DeviceOutput::new(Box::new(NullSinkFactory::new()), SessionParams::default());
        out.open(None, None).unwrap();
        assert_eq!(out.play(&[0; 4]), 0);
        assert_eq!(out.error(), ErrorCode::NotLive);
    }

    #[test]
    fn sensitive_devices_are_closed_on_pause_and_reopened_on_resume() {
        let null = NullSinkFactory::new();
        let mut out = DeviceOutput::new(
            Box::new(LiveFactory(null.clone())),
            SessionParams::default(),
        );
        out.open(None, None).unwrap();
        out.start(s16_stereo()).unwrap();
        out.pause();
        assert_eq!(null.stats().closes, 1);
        out.resume();
        assert_eq!(out.state(), PlaybackState::Live);
        assert_eq!(null.stats().opens, 2);
        out.stop();
        assert_eq!(out.state(), PlaybackState::Stopped);
        assert_eq!(null.stats().closes, 2);
    }

    #[test]
    fn drain_leaves_the_device_paused() {
        let factory = NullSinkFactory::new();
        let mut out = DeviceOutput::new(Box::new(factory.clone()), SessionParams::default());
        out.open(None, None).unwrap();
        out.start(s16_stereo()).unwrap();
        out.drain();
        assert_eq!(out.state(), PlaybackState::Paused);
        assert_eq!(factory.stats().drains, 1);
    }

    #[test]
    fn formats_lead_with_the_device_default() {
        let mut out = DeviceOutput::new(Box::new(NullSinkFactory::new()), SessionParams::default());
        out.open(None, None).unwrap();
        let records = out.formats(&[44_100, 48_000], 1, 2).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0], s16_stereo());
        assert_eq!(records[4].rate, 48_000);
        assert_eq!(records[4].channels, 2);
        assert!(records[4].encoding.contains(Encoding::FLOAT_32));

        assert_eq!(out.formats(&[44_100], 2, 1), Err(ErrorCode::ArgError));
    }

    #[test]
    fn encodings_need_a_loaded_driver() {
        let mut out = DeviceOutput::new(Box::new(NullSinkFactory::new()), SessionParams::default());
        assert_eq!(out.encodings(44_100, 2), Err(ErrorCode::NoDriver));
        out.open(None, None).unwrap();
        assert_eq!(
            out.encodings(44_100, 2).unwrap(),
            Encoding::SIGNED_16 | Encoding::FLOAT_32
        );
    }

    #[test]
    fn close_returns_to_dead() {
        let mut out = DeviceOutput::new(Box::new(NullSinkFactory::new()), SessionParams::default());
        out.open(None, None).unwrap();
        out.start(s16_stereo()).unwrap();
        out.close();
        assert_eq!(out.state(), PlaybackState::Dead);
        assert!(!out.state().has_open_device());
    }
}
