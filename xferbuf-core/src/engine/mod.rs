//! `BufferController`: the controller-side proxy for the buffer process.
//!
//! ## Lifecycle
//!
//! ```text
//! BufferController::launch()
//!     └─► open()             → sink opened remotely, state = Stopped
//!         └─► start()        → Live + preloading on the far side
//!             ├─► write()    → ring pieces + DATA notifications
//!             ├─► pause() / resume() / drop_audio()
//!             ├─► drain() / ndrain()
//!             └─► stop()     → state = Stopped
//!         └─► close()        → state = Dead
//! shutdown()                 → STOP, TERMINATE, hang up, reap
//! ```
//!
//! Every request is one round trip: the controller never has a second
//! request in flight, so the next response on the channel always belongs
//! to the last request. `&mut self` on every request method enforces that.
//!
//! Failures of any kind leave a sticky [`ErrorCode`] in
//! [`last_error`](BufferController::last_error). Nothing is retried.

pub mod process;
pub mod spawn;

use tracing::{debug, error, info, warn};

use crate::{
    audio::{output::PlaybackState, sink::SinkFactory, AudioFormat, Encoding},
    buffering::{create_shared_ring, RingProducer},
    config::{BufferConfig, SessionParams},
    error::{BufferError, ErrorCode, Result},
    ipc::{
        channel::{command_channel, CommandChannel},
        command::{decode_format_records, OpenedSink, Request, Response},
        wire,
    },
};

use process::BufferProcess;
use spawn::Worker;

/// Handle on a running buffer process.
///
/// Owns the writing end of the shared ring and the controller end of the
/// command channel. Dropping a running controller shuts the buffer process
/// down.
pub struct BufferController {
    config: BufferConfig,
    ring: RingProducer,
    channel: Option<CommandChannel>,
    worker: Option<Worker>,
    /// Mirror of the buffer side's state, updated on successful round trips.
    state: PlaybackState,
    format: Option<AudioFormat>,
    last_error: ErrorCode,
}

impl BufferController {
    /// Map the ring, spawn the buffer process and wait for it to report
    /// ready.
    pub fn launch(mut config: BufferConfig, factory: impl SinkFactory + 'static) -> Result<Self> {
        config.normalize();
        let capacity = config.capacity();
        let (producer, consumer) = create_shared_ring(capacity)?;
        let (controller_end, buffer_end) = command_channel()?;

        let process = BufferProcess::new(
            consumer,
            Box::new(factory),
            config.session.clone(),
            config.output_burst,
        );
        let worker = spawn::spawn_worker(config.spawn_mode, process, &controller_end, buffer_end)?;
        info!(
            capacity,
            burst = config.output_burst,
            mode = ?config.spawn_mode,
            pid = worker.pid().map(|p| p.as_raw()),
            "buffer process spawned"
        );

        if let Err(reason) = await_ready(&controller_end, &config) {
            error!("buffer process never reported ready: {reason}");
            worker.kill();
            return Err(BufferError::Startup(reason));
        }
        debug!("buffer process ready");

        Ok(Self {
            config,
            ring: producer,
            channel: Some(controller_end),
            worker: Some(worker),
            state: PlaybackState::Dead,
            format: None,
            last_error: ErrorCode::Ok,
        })
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Bytes waiting in the ring. Approximate: the buffer side may have
    /// consumed more by the time this returns.
    pub fn fill(&self) -> usize {
        self.ring.used_space()
    }

    pub fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    pub fn clear_error(&mut self) {
        self.last_error = ErrorCode::Ok;
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    // ── Device control ────────────────────────────────────────────────────

    /// Open a sink on the buffer side. `driver` may be a comma separated
    /// list; the reply names what was actually opened.
    pub fn open(&mut self, driver: Option<&str>, device: Option<&str>) -> Result<OpenedSink> {
        if self.state != PlaybackState::Dead {
            self.close()?;
        }
        let request = Request::Open {
            driver: driver.map(str::to_owned),
            device: device.map(str::to_owned),
        };
        let opened = self.with_channel(|c| {
            expect_ok(c, &request)?;
            Ok(OpenedSink::decode(&mut c.reader())?)
        })?;
        info!(
            driver = opened.driver.as_deref().unwrap_or("?"),
            device = opened.device.as_deref().unwrap_or("default"),
            "sink opened"
        );
        self.state = PlaybackState::Stopped;
        Ok(opened)
    }

    /// Encodings the open sink supports at `rate` and `channels`.
    pub fn query_encodings(&mut self, rate: u32, channels: u16) -> Result<Encoding> {
        self.stop()?;
        self.require_stopped()?;
        let request = Request::QueryEncodings { rate, channels };
        self.with_channel(|c| {
            expect_ok(c, &request)?;
            Ok(Encoding::from_bits(wire::read_u32(&mut c.reader())?))
        })
    }

    /// Supported formats for each rate and channel count in range. The
    /// first record is the device's preferred format, all zero if unknown.
    pub fn query_formats(
        &mut self,
        rates: &[u32],
        min_channels: u16,
        max_channels: u16,
    ) -> Result<Vec<AudioFormat>> {
        self.stop()?;
        self.require_stopped()?;
        if min_channels == 0 || min_channels > max_channels {
            return self.fail(BufferError::InvalidArgument(format!(
                "channel range {min_channels}..={max_channels}"
            )));
        }
        let request = Request::QueryFormats {
            rates: rates.to_vec(),
            min_channels,
            max_channels,
        };
        self.with_channel(|c| {
            expect_ok(c, &request)?;
            Ok(decode_format_records(&mut c.reader())?)
        })
    }

    /// Replace the session parameters and mirror them to the buffer side.
    pub fn set_params(&mut self, mut params: SessionParams) -> Result<()> {
        params.normalize();
        self.round_trip(&Request::SetParams(params.clone()))?;
        self.config.session = params;
        Ok(())
    }

    /// Start playback in `format`. The buffer side preloads before it
    /// feeds the device.
    pub fn start(&mut self, format: AudioFormat) -> Result<()> {
        self.stop()?;
        self.require_stopped()?;
        if format.frame_size() == 0 {
            return self.fail(BufferError::InvalidArgument(format!(
                "cannot play {format}"
            )));
        }
        self.round_trip(&Request::Start(format))?;
        info!(%format, "playback started");
        self.format = Some(format);
        self.state = PlaybackState::Live;
        Ok(())
    }

    // ── Audio ─────────────────────────────────────────────────────────────

    /// Queue `bytes` for playback. Returns the bytes taken, which is
    /// `bytes.len()` rounded down to whole frames.
    ///
    /// Blocks while the ring lacks room, pinging the buffer side until it
    /// has played enough.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if self.state == PlaybackState::Paused {
            self.resume()?;
        }
        if self.state != PlaybackState::Live {
            return self.fail(BufferError::Remote(ErrorCode::NotLive));
        }
        let frame = self.format.map_or(1, |f| f.frame_size()).max(1);
        let whole = bytes.len() - bytes.len() % frame;
        let max_piece = (self.ring.capacity() / 2).max(1);

        let mut written = 0;
        for piece in bytes[..whole].chunks(max_piece) {
            while self.ring.free_space() < piece.len() {
                self.ping()?;
            }
            written += self.ring.write(piece);
            self.with_channel(|c| Ok(c.send_request(&Request::Data)?))?;
        }
        Ok(written)
    }

    /// Pause output. Interrupts a blocking device write first.
    pub fn pause(&mut self) -> Result<()> {
        if self.state != PlaybackState::Live {
            return Ok(());
        }
        self.round_trip(&Request::Pause)?;
        self.state = PlaybackState::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.state != PlaybackState::Paused {
            return Ok(());
        }
        self.round_trip(&Request::Continue)?;
        self.state = PlaybackState::Live;
        Ok(())
    }

    /// Throw away everything queued, in the ring and in the device.
    pub fn drop_audio(&mut self) -> Result<()> {
        self.round_trip(&Request::Drop)?;
        debug!("queued audio dropped");
        Ok(())
    }

    /// Block until everything written so far has played.
    pub fn drain(&mut self) -> Result<()> {
        if self.state == PlaybackState::Paused {
            self.resume()?;
        }
        if self.state != PlaybackState::Live {
            return Ok(());
        }
        self.round_trip(&Request::Drain)
    }

    /// Block until at least `limit` more bytes have left the ring, or it
    /// ran empty.
    pub fn ndrain(&mut self, limit: usize) -> Result<()> {
        if self.state == PlaybackState::Paused {
            self.resume()?;
        }
        if self.state != PlaybackState::Live {
            return Ok(());
        }
        let old_fill = self.fill();
        self.round_trip(&Request::BoundedDrain {
            limit: limit as u64,
            old_fill: old_fill as u64,
        })
    }

    /// Stop playback after what is queued has played.
    pub fn stop(&mut self) -> Result<()> {
        if !matches!(self.state, PlaybackState::Live | PlaybackState::Paused) {
            return Ok(());
        }
        self.round_trip(&Request::Stop)?;
        self.state = PlaybackState::Stopped;
        Ok(())
    }

    /// Drain, stop and release the sink.
    pub fn close(&mut self) -> Result<()> {
        self.drain()?;
        self.stop()?;
        self.round_trip(&Request::Close)?;
        self.state = PlaybackState::Dead;
        self.format = None;
        Ok(())
    }

    /// Let the buffer side play with less than one burst queued, until the
    /// next pause or start.
    pub fn ignore_low_buffer(&mut self) -> Result<()> {
        self.round_trip(&Request::IgnoreLowBuffer)
    }

    // ── Teardown ──────────────────────────────────────────────────────────

    /// Stop playback, terminate the buffer process and wait for it.
    ///
    /// Cleanup proceeds even when a step fails; the first failure of the
    /// wait is returned.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        if let Err(e) = self.stop() {
            warn!("stop before shutdown failed: {e}");
        }
        if let Err(e) = self.round_trip(&Request::Terminate) {
            warn!("terminate request failed: {e}");
        }
        self.channel = None;
        self.state = PlaybackState::Dead;
        self.format = None;

        match worker.wait() {
            Ok(()) => {
                info!("buffer process exited");
                Ok(())
            }
            Err(e) => {
                warn!("buffer process exit: {e}");
                self.fail(e)
            }
        }
    }

    // ── Protocol helpers ──────────────────────────────────────────────────

    fn fail<T>(&mut self, err: BufferError) -> Result<T> {
        self.last_error = err.code();
        Err(err)
    }

    fn with_channel<T>(&mut self, f: impl FnOnce(&CommandChannel) -> Result<T>) -> Result<T> {
        let result = match self.channel.as_ref() {
            Some(channel) => f(channel),
            None => Err(BufferError::NotRunning),
        };
        match result {
            Ok(value) => Ok(value),
            Err(e) => self.fail(e),
        }
    }

    /// One request, one terminal response. Urgent requests first knock the
    /// buffer side out of whatever it is blocked in.
    fn round_trip(&mut self, request: &Request) -> Result<()> {
        if request.is_urgent() {
            self.ring.raise_interrupt();
            if let Some(worker) = &self.worker {
                worker.interrupt();
            }
        }
        self.with_channel(|c| expect_ok(c, request))
    }

    /// Liveness probe while waiting for room in the ring.
    fn ping(&mut self) -> Result<()> {
        self.with_channel(|c| {
            c.send_request(&Request::Ping)?;
            match c.recv_response()? {
                Response::Pong => Ok(()),
                Response::Error(code) => Err(BufferError::Remote(code)),
                Response::Ok => Err(BufferError::Protocol("OK in answer to PING".into())),
            }
        })
    }

    fn require_stopped(&mut self) -> Result<()> {
        if self.state == PlaybackState::Stopped {
            return Ok(());
        }
        self.fail(BufferError::Remote(ErrorCode::NoDriver))
    }
}

impl Drop for BufferController {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.shutdown() {
                warn!("buffer teardown incomplete: {e}");
            }
        }
    }
}

/// Send `request` and read its terminal response, which must be `OK`.
fn expect_ok(channel: &CommandChannel, request: &Request) -> Result<()> {
    channel.send_request(request)?;
    match channel.recv_response()? {
        Response::Ok => Ok(()),
        Response::Error(code) => Err(BufferError::Remote(code)),
        Response::Pong => Err(BufferError::Protocol(format!(
            "PONG in answer to {:?}",
            request.code()
        ))),
    }
}

/// Wait for the unsolicited `PONG` that marks the buffer process ready.
fn await_ready(channel: &CommandChannel, config: &BufferConfig) -> std::result::Result<(), String> {
    channel
        .set_read_timeout(Some(config.startup_timeout()))
        .map_err(|e| e.to_string())?;
    let outcome = match channel.recv_response() {
        Ok(Response::Pong) => Ok(()),
        Ok(other) => Err(format!("expected PONG, got {other:?}")),
        Err(e) => Err(e.to_string()),
    };
    channel.set_read_timeout(None).map_err(|e| e.to_string())?;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::null::NullSinkFactory;
    use crate::config::SpawnMode;

    fn threaded(buffer_bytes: usize) -> BufferConfig {
        BufferConfig {
            buffer_bytes,
            output_burst: 1024,
            spawn_mode: SpawnMode::Thread,
            ..BufferConfig::default()
        }
    }

    #[test]
    fn write_before_start_is_not_live_and_sticks() {
        let mut ctl = BufferController::launch(threaded(8192), NullSinkFactory::default()).unwrap();
        let err = ctl.write(&[0u8; 64]).unwrap_err();
        assert!(matches!(err, BufferError::Remote(ErrorCode::NotLive)));
        assert_eq!(ctl.last_error(), ErrorCode::NotLive);
        ctl.clear_error();
        assert_eq!(ctl.last_error(), ErrorCode::Ok);
        ctl.shutdown().unwrap();
    }

    #[test]
    fn start_without_open_reports_no_driver() {
        let mut ctl = BufferController::launch(threaded(8192), NullSinkFactory::default()).unwrap();
        assert_eq!(ctl.state(), PlaybackState::Dead);
        let err = ctl
            .start(AudioFormat::new(44_100, 2, Encoding::SIGNED_16))
            .unwrap_err();
        assert!(matches!(err, BufferError::Remote(ErrorCode::NoDriver)));
        ctl.shutdown().unwrap();
    }

    #[test]
    fn write_keeps_whole_frames_only() {
        let mut ctl = BufferController::launch(threaded(8192), NullSinkFactory::default()).unwrap();
        ctl.open(None, None).unwrap();
        ctl.start(AudioFormat::new(48_000, 2, Encoding::SIGNED_16))
            .unwrap();
        assert_eq!(ctl.write(&[0u8; 1030]).unwrap(), 1028);
        ctl.drain().unwrap();
        assert_eq!(ctl.fill(), 0);
        ctl.shutdown().unwrap();
    }

    #[test]
    fn startup_rejects_anything_but_pong() {
        let (controller, buffer) = command_channel().unwrap();
        let mut bytes = Vec::new();
        Response::Ok.encode(&mut bytes);
        buffer.send(&bytes).unwrap();
        let err = await_ready(&controller, &threaded(8192)).unwrap_err();
        assert!(err.contains("expected PONG"), "{err}");
    }

    #[test]
    fn startup_gives_up_after_the_timeout() {
        let (controller, _buffer) = command_channel().unwrap();
        let config = BufferConfig {
            startup_timeout_ms: 100,
            ..threaded(8192)
        };
        let started = std::time::Instant::now();
        assert!(await_ready(&controller, &config).is_err());
        let waited = started.elapsed();
        assert!(waited >= std::time::Duration::from_millis(90), "{waited:?}");
        assert!(waited < std::time::Duration::from_secs(2), "{waited:?}");
    }

    #[test]
    fn startup_accepts_pong() {
        let (controller, buffer) = command_channel().unwrap();
        let mut bytes = Vec::new();
        Response::Pong.encode(&mut bytes);
        buffer.send(&bytes).unwrap();
        await_ready(&controller, &threaded(8192)).unwrap();
    }

    #[test]
    fn requests_after_shutdown_are_rejected() {
        let mut ctl = BufferController::launch(threaded(8192), NullSinkFactory::default()).unwrap();
        ctl.shutdown().unwrap();
        assert!(!ctl.is_running());
        assert!(matches!(
            ctl.ignore_low_buffer(),
            Err(BufferError::NotRunning)
        ));
        assert_eq!(ctl.last_error(), ErrorCode::BadHandle);
        // A second shutdown is a no-op.
        ctl.shutdown().unwrap();
    }
}
