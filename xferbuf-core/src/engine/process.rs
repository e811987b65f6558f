//! Buffer process main loop.
//!
//! Runs on the far side of the ring: keeps the device fed from the ring,
//! services commands from the controller and owns the playback state.
//!
//! ## Loop
//!
//! ```text
//! loop {
//!     service_playback()            ← one burst to the sink, or (re)enter preloading
//!     do {
//!         receive_batch(block = idle)
//!         for each command: decode → handle → reply
//!     } while interrupted
//! }
//! ```
//!
//! The command read only blocks when there is nothing to play, so a quiet
//! command channel never starves the device.

use tracing::{debug, error, info, info_span, warn};

use crate::{
    audio::{
        output::{DeviceOutput, PlaybackState},
        sink::SinkFactory,
    },
    buffering::RingConsumer,
    config::{OutputFlags, SessionParams},
    error::ErrorCode,
    ipc::{
        channel::CommandChannel,
        command::{encode_format_records, Request, Response},
        wire::{self, DecodeError},
    },
};

/// Why the loop returned. Maps onto the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// `TERMINATE` was answered.
    Terminated,
    /// The channel closed or failed between commands.
    LinkBroken,
    UnknownCommand(u8),
    /// A payload could not be read in full; framing is lost.
    Desync,
    /// A reply could not be written.
    ReplyFailed,
}

impl ExitReason {
    pub fn exit_code(self) -> i32 {
        match self {
            ExitReason::Terminated => 0,
            ExitReason::LinkBroken | ExitReason::UnknownCommand(_) => 1,
            ExitReason::Desync | ExitReason::ReplyFailed => 2,
        }
    }

    pub fn is_clean(self) -> bool {
        self == ExitReason::Terminated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Terminate,
}

/// State of one buffer process. Everything the loop needs lives here, so
/// several can run side by side in one test process.
pub struct BufferProcess {
    ring: RingConsumer,
    output: DeviceOutput,
    state: PlaybackState,
    preloading: bool,
    draining: bool,
    /// Largest chunk handed to the sink in one go.
    burst: usize,
    /// One frame copied out when a frame straddles the ring's wrap point.
    scratch: Vec<u8>,
}

impl BufferProcess {
    pub fn new(
        ring: RingConsumer,
        factory: Box<dyn SinkFactory>,
        params: SessionParams,
        burst: usize,
    ) -> Self {
        let burst = burst.clamp(1, (ring.capacity() / 2).max(1));
        let mut process = Self {
            ring,
            output: DeviceOutput::new(factory, SessionParams::default()),
            state: PlaybackState::Dead,
            preloading: false,
            draining: false,
            burst,
            scratch: Vec::new(),
        };
        process.apply_params(params);
        process
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_preloading(&self) -> bool {
        self.preloading
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    fn apply_params(&mut self, mut params: SessionParams) {
        // One sink write per chunk; the loop decides when to write again.
        params.flags.remove(OutputFlags::KEEP_PLAYING);
        self.output.set_params(params);
    }

    fn preload_target(&self) -> usize {
        self.output.params().preload_target(self.ring.capacity())
    }

    fn frame_size(&self) -> usize {
        self.output.frame_size().max(1)
    }

    /// Nothing to do until a command arrives.
    fn is_idle(&self) -> bool {
        self.preloading
            || self.ring.is_interrupted()
            || self.state != PlaybackState::Live
            || self.ring.used_space() < self.frame_size()
    }

    /// Run until terminated or the link fails.
    pub fn run(mut self, channel: CommandChannel) -> ExitReason {
        let span = info_span!(
            "buffer_process",
            capacity = self.ring.capacity(),
            burst = self.burst
        );
        let _enter = span.enter();

        let mut ready = Vec::with_capacity(1);
        Response::Pong.encode(&mut ready);
        if let Err(e) = channel.send(&ready) {
            error!("cannot report ready: {e}");
            return ExitReason::LinkBroken;
        }
        info!("buffer process ready");

        let mut batch = Vec::new();
        let mut reply = Vec::new();
        loop {
            self.service_playback();

            loop {
                if let Err(e) = channel.receive_batch(self.is_idle(), &mut batch) {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        info!("controller hung up");
                    } else {
                        error!("command channel read failed: {e}");
                    }
                    return ExitReason::LinkBroken;
                }

                let mut frames = channel.frames(&batch);
                while let Some(byte) = frames.next_command() {
                    reply.clear();
                    let flow = match Request::decode(byte, &mut frames) {
                        Ok(request) => self.handle(request, &mut reply),
                        Err(DecodeError::OutOfMemory { requested }) => {
                            warn!(requested, "dropping oversized request payload");
                            self.ring.clear_interrupt();
                            Response::Error(ErrorCode::OutOfMemory).encode(&mut reply);
                            Flow::Continue
                        }
                        Err(DecodeError::BadPayload(reason)) => {
                            warn!("rejecting malformed request: {reason}");
                            self.ring.clear_interrupt();
                            Response::Error(ErrorCode::BadParam).encode(&mut reply);
                            Flow::Continue
                        }
                        Err(DecodeError::UnknownCommand(byte)) => {
                            error!(byte, "unknown command");
                            return ExitReason::UnknownCommand(byte);
                        }
                        Err(DecodeError::Io(e)) => {
                            error!("lost framing reading a payload: {e}");
                            return ExitReason::Desync;
                        }
                    };

                    if !reply.is_empty() {
                        if let Err(e) = channel.send(&reply) {
                            error!("reply failed: {e}");
                            return ExitReason::ReplyFailed;
                        }
                    }
                    if flow == Flow::Terminate {
                        info!("terminating");
                        return ExitReason::Terminated;
                    }
                }

                if !self.ring.is_interrupted() {
                    break;
                }
            }
        }
    }

    /// One step of feeding the device, or of deciding not to.
    pub fn service_playback(&mut self) {
        if self.state != PlaybackState::Live {
            return;
        }
        let available = self.ring.used_space();

        if self.preloading {
            self.preloading = available < self.preload_target();
            if !self.preloading {
                debug!(available, "preload complete");
            }
        }
        if !self.preloading {
            if !self.draining && available < self.burst {
                debug!(available, burst = self.burst, "low on data, preloading");
                self.preloading = true;
            } else {
                self.play(available);
            }
        }
        if self.preloading && self.output.state() == PlaybackState::Live {
            self.output.pause();
        }
    }

    /// Hand at most `limit` bytes (and at most one burst) to the device.
    /// Returns the bytes consumed from the ring.
    fn play(&mut self, limit: usize) -> usize {
        let frame = self.frame_size();
        let want = limit.min(self.burst);

        let chunk = self.ring.peek(want);
        let whole = chunk.len() - chunk.len() % frame;
        let written = if whole > 0 {
            self.output.play(&chunk[..whole])
        } else if want >= frame && self.ring.used_space() >= frame {
            // The next frame straddles the wrap point.
            self.scratch.resize(frame, 0);
            let copied = self.ring.peek_copy(&mut self.scratch);
            self.output.play(&self.scratch[..copied])
        } else {
            0
        };
        self.ring.consume(written);

        if self.output.error() == ErrorCode::DevicePlay {
            warn!("device failed, closing it");
            self.output.close();
        }
        self.state = self.output.state();
        written
    }

    /// Play everything buffered, then discard a trailing partial frame.
    fn play_out(&mut self) {
        let frame = self.frame_size();
        while self.state == PlaybackState::Live {
            let used = self.ring.used_space();
            if used < frame {
                break;
            }
            if self.play(used) == 0 {
                break;
            }
        }
        let leftover = self.ring.used_space();
        if self.state == PlaybackState::Live && leftover > 0 && leftover < frame {
            debug!(leftover, "discarding partial frame");
            self.ring.consume(leftover);
        }
    }

    /// Carry out one request and write its reply into `reply`.
    fn handle(&mut self, request: Request, reply: &mut Vec<u8>) -> Flow {
        if request.expects_reply() {
            self.ring.clear_interrupt();
        }

        match request {
            Request::Data => {
                if self.state == PlaybackState::Paused {
                    self.state = PlaybackState::Live;
                }
                self.draining = false;
            }
            Request::Ping => {
                if self.state == PlaybackState::Live {
                    Response::Pong.encode(reply);
                } else {
                    let code = match self.output.error() {
                        ErrorCode::Ok => ErrorCode::NotLive,
                        code => code,
                    };
                    Response::Error(code).encode(reply);
                }
            }
            Request::SetParams(params) => {
                debug!(?params, "session parameters updated");
                self.apply_params(params);
                Response::Ok.encode(reply);
            }
            Request::Open { driver, device } => {
                self.draining = false;
                let opened = self.output.open(driver.as_deref(), device.as_deref());
                self.state = self.output.state();
                match opened {
                    Ok(opened) => {
                        Response::Ok.encode(reply);
                        opened.encode(reply);
                    }
                    Err(code) => Response::Error(code).encode(reply),
                }
            }
            Request::Close => {
                self.draining = false;
                self.output.close();
                self.state = self.output.state();
                Response::Ok.encode(reply);
            }
            Request::QueryEncodings { rate, channels } => {
                let result = self.output.encodings(rate, channels);
                self.state = self.output.state();
                match result {
                    Ok(encodings) => {
                        Response::Ok.encode(reply);
                        wire::put_u32(reply, encodings.bits());
                    }
                    Err(code) => Response::Error(code).encode(reply),
                }
            }
            Request::QueryFormats {
                rates,
                min_channels,
                max_channels,
            } => {
                let result = self.output.formats(&rates, min_channels, max_channels);
                self.state = self.output.state();
                match result {
                    Ok(records) => {
                        Response::Ok.encode(reply);
                        encode_format_records(reply, &records);
                    }
                    Err(code) => Response::Error(code).encode(reply),
                }
            }
            Request::Start(format) if format.frame_size() > self.burst => {
                warn!(%format, burst = self.burst, "frame larger than one burst");
                Response::Error(ErrorCode::ArgError).encode(reply);
            }
            Request::Start(format) => match self.output.start(format) {
                Ok(()) => {
                    // Stay quiet until the preload is in.
                    self.output.pause();
                    self.state = PlaybackState::Live;
                    self.preloading = true;
                    self.draining = false;
                    debug!(%format, target = self.preload_target(), "started, preloading");
                    Response::Ok.encode(reply);
                }
                Err(code) => {
                    self.state = self.output.state();
                    Response::Error(code).encode(reply);
                }
            },
            Request::Stop => {
                if self.state == PlaybackState::Live {
                    self.play_out();
                }
                self.output.stop();
                self.state = self.output.state();
                self.draining = false;
                Response::Ok.encode(reply);
            }
            Request::Continue => {
                self.state = PlaybackState::Live;
                self.preloading = false;
                self.draining = false;
                Response::Ok.encode(reply);
            }
            Request::IgnoreLowBuffer => {
                self.preloading = false;
                Response::Ok.encode(reply);
            }
            Request::Drain => {
                self.draining = false;
                if self.state == PlaybackState::Live {
                    self.play_out();
                    self.output.drain();
                    self.state = self.output.state();
                }
                Response::Ok.encode(reply);
            }
            Request::BoundedDrain { limit, old_fill } => {
                self.bounded_drain(limit as usize, old_fill as usize);
                Response::Ok.encode(reply);
            }
            Request::Terminate => {
                Response::Ok.encode(reply);
                return Flow::Terminate;
            }
            Request::Pause => {
                self.draining = false;
                self.output.pause();
                self.state = self.output.state();
                Response::Ok.encode(reply);
            }
            Request::Drop => {
                self.draining = false;
                let dropped = self.ring.discard_all();
                self.output.drop_queued();
                debug!(dropped, "dropped buffered audio");
                Response::Ok.encode(reply);
            }
        }
        Flow::Continue
    }

    /// Feed the device until at least `limit` bytes have left the ring since
    /// the controller saw `old_fill`, or the ring empties.
    fn bounded_drain(&mut self, limit: usize, old_fill: usize) {
        self.draining = true;
        self.preloading = false;
        if self.state != PlaybackState::Live {
            return;
        }
        let frame = self.frame_size();
        loop {
            let used = self.ring.used_space();
            if used < frame || old_fill < used || old_fill - used >= limit {
                break;
            }
            if self.play(used.min(limit)) == 0 || self.state != PlaybackState::Live {
                break;
            }
        }
        if self.ring.used_space() == 0 {
            self.output.drain();
            self.state = self.output.state();
            self.draining = false;
        }
    }
}
