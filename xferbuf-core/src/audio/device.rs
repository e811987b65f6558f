//! Sound card output via cpal.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms, while sinks must be `Send`.
//! [`CpalSink`] therefore builds the stream on a thread of its own and keeps
//! only the producer half of a `ringbuf::HeapRb<f32>`; the output callback
//! drains the consumer half. The callback never allocates or blocks.
//!
//! Writes accept as many whole frames as the bridge has room for and return
//! early once some were taken, so the buffer process gets back to its
//! command channel between device writes.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate, StreamConfig,
};
use crossbeam_channel::{bounded, Sender};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapProd, HeapRb,
};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        sink::{Sink, SinkFactory, SinkProperties},
        AudioFormat, Encoding,
    },
    config::SessionParams,
    error::SinkError,
};

pub const CPAL_DRIVER: &str = "cpal";

/// Bridge size when the session leaves the device buffer to the driver.
const DEFAULT_BRIDGE_SECONDS: f64 = 0.25;

/// Poll interval while waiting for room in, or emptiness of, the bridge.
const BRIDGE_POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, Default)]
pub struct CpalSinkFactory;

impl SinkFactory for CpalSinkFactory {
    fn default_driver(&self) -> &str {
        CPAL_DRIVER
    }

    fn create(
        &self,
        driver: &str,
        device: Option<&str>,
        params: &SessionParams,
    ) -> Result<Box<dyn Sink>, SinkError> {
        if driver != CPAL_DRIVER {
            return Err(SinkError::UnknownDriver(driver.to_string()));
        }
        let bridge_seconds = if params.device_buffer > 0.0 {
            params.device_buffer
        } else {
            DEFAULT_BRIDGE_SECONDS
        };
        Ok(Box::new(CpalSink {
            preferred_device: device.map(str::to_string),
            real_name: None,
            bridge_seconds,
            stream: None,
        }))
    }
}

/// Live stream state, present between `open(Some(_))` and `close()`.
struct ActiveStream {
    format: AudioFormat,
    producer: HeapProd<f32>,
    /// Callback plays silence without consuming while false.
    running: Arc<AtomicBool>,
    /// Callback discards everything queued when it sees this set.
    flush: Arc<AtomicBool>,
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

pub struct CpalSink {
    preferred_device: Option<String>,
    real_name: Option<String>,
    bridge_seconds: f64,
    stream: Option<ActiveStream>,
}

fn find_device(preferred: Option<&str>) -> Result<cpal::Device, SinkError> {
    let host = cpal::default_host();
    if let Some(name) = preferred {
        match host.output_devices() {
            Ok(mut devices) => {
                if let Some(device) =
                    devices.find(|d| d.name().map(|n| n == name).unwrap_or(false))
                {
                    return Ok(device);
                }
                warn!("output device '{name}' not found, falling back to default");
            }
            Err(e) => warn!("failed to list output devices: {e}"),
        }
    }
    host.default_output_device()
        .ok_or_else(|| SinkError::open("no output device"))
}

/// Convert interleaved PCM to `f32` samples.
fn decode_samples(encoding: Encoding, bytes: &[u8], out: &mut Vec<f32>) {
    out.clear();
    if encoding == Encoding::FLOAT_32 {
        out.extend(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]])),
        );
    } else {
        out.extend(
            bytes
                .chunks_exact(2)
                .map(|c| i16::from_ne_bytes([c[0], c[1]]) as f32 / 32768.0),
        );
    }
}

impl CpalSink {
    fn start_stream(&mut self, format: AudioFormat) -> Result<(), SinkError> {
        let capacity = ((format.rate as f64 * self.bridge_seconds) as usize).max(1024)
            * format.channels as usize;
        let (producer, mut consumer) = HeapRb::<f32>::new(capacity).split();
        let running = Arc::new(AtomicBool::new(true));
        let flush = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = bounded::<Result<String, SinkError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let preferred = self.preferred_device.clone();
        let running_cb = Arc::clone(&running);
        let flush_cb = Arc::clone(&flush);

        // The stream is created, played and dropped on this thread only.
        let thread = thread::Builder::new()
            .name("xferbuf-cpal".into())
            .spawn(move || {
                let opened = (|| -> Result<(cpal::Stream, String), SinkError> {
                    let device = find_device(preferred.as_deref())?;
                    let name = device.name().unwrap_or_default();
                    let sample_format = device
                        .default_output_config()
                        .map_err(|e| SinkError::open(e.to_string()))?
                        .sample_format();
                    let config = StreamConfig {
                        channels: format.channels,
                        sample_rate: SampleRate(format.rate),
                        buffer_size: cpal::BufferSize::Default,
                    };
                    let stream = match sample_format {
                        SampleFormat::F32 => device.build_output_stream(
                            &config,
                            move |data: &mut [f32], _info| {
                                if flush_cb.swap(false, Ordering::AcqRel) {
                                    consumer.clear();
                                }
                                let n = if running_cb.load(Ordering::Relaxed) {
                                    consumer.pop_slice(data)
                                } else {
                                    0
                                };
                                data[n..].fill(0.0);
                            },
                            |err| error!("audio stream error: {err}"),
                            None,
                        ),
                        SampleFormat::I16 => {
                            let mut scratch: Vec<f32> = Vec::new();
                            device.build_output_stream(
                                &config,
                                move |data: &mut [i16], _info| {
                                    if flush_cb.swap(false, Ordering::AcqRel) {
                                        consumer.clear();
                                    }
                                    // Only grows until it matches the device period.
                                    scratch.resize(data.len(), 0.0);
                                    let n = if running_cb.load(Ordering::Relaxed) {
                                        consumer.pop_slice(&mut scratch)
                                    } else {
                                        0
                                    };
                                    for (out, sample) in data.iter_mut().zip(&scratch[..n]) {
                                        *out = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                                    }
                                    data[n..].fill(0);
                                },
                                |err| error!("audio stream error: {err}"),
                                None,
                            )
                        }
                        other => {
                            return Err(SinkError::open(format!(
                                "unsupported device sample format {other:?}"
                            )))
                        }
                    }
                    .map_err(|e| SinkError::open(e.to_string()))?;
                    stream.play().map_err(|e| SinkError::open(e.to_string()))?;
                    Ok((stream, name))
                })();

                match opened {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| SinkError::open(e.to_string()))?;

        let name = match ready_rx.recv() {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(SinkError::open("stream thread exited during open"));
            }
        };
        info!(device = name.as_str(), %format, "output stream playing");
        self.real_name = Some(name);
        self.stream = Some(ActiveStream {
            format,
            producer,
            running,
            flush,
            stop_tx,
            thread,
        });
        Ok(())
    }

    fn stop_stream(&mut self) {
        if let Some(active) = self.stream.take() {
            let _ = active.stop_tx.send(());
            if active.thread.join().is_err() {
                warn!("cpal stream thread panicked");
            }
            debug!("output stream closed");
        }
    }
}

impl Sink for CpalSink {
    fn properties(&self) -> SinkProperties {
        // The stream keeps running (playing silence) while paused.
        SinkProperties {
            live: true,
            persistent: true,
        }
    }

    fn device(&self) -> Option<&str> {
        self.preferred_device.as_deref()
    }

    fn real_name(&self) -> Option<&str> {
        self.real_name.as_deref()
    }

    fn open(&mut self, format: Option<&AudioFormat>) -> Result<Option<AudioFormat>, SinkError> {
        self.stop_stream();
        let Some(format) = format else {
            // Probe mode: report the device's preferred format.
            let device = find_device(self.preferred_device.as_deref())?;
            self.real_name = device.name().ok();
            let preferred = device.default_output_config().ok().and_then(|c| {
                let encoding = match c.sample_format() {
                    SampleFormat::F32 => Encoding::FLOAT_32,
                    SampleFormat::I16 => Encoding::SIGNED_16,
                    _ => return None,
                };
                Some(AudioFormat::new(c.sample_rate().0, c.channels(), encoding))
            });
            return Ok(preferred);
        };
        if format.encoding != Encoding::SIGNED_16 && format.encoding != Encoding::FLOAT_32 {
            return Err(SinkError::open(format!("unsupported format {format}")));
        }
        self.start_stream(*format)?;
        Ok(None)
    }

    fn encodings(&mut self, _rate: u32, channels: u16) -> Encoding {
        if channels == 0 {
            Encoding::NONE
        } else {
            Encoding::SIGNED_16 | Encoding::FLOAT_32
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
        let Some(active) = self.stream.as_mut() else {
            return Err(SinkError::Closed);
        };
        active.running.store(true, Ordering::Relaxed);
        let channels = active.format.channels.max(1) as usize;
        let sample_size = active.format.encoding.sample_size().max(1);

        let mut samples = Vec::new();
        decode_samples(active.format.encoding, bytes, &mut samples);
        loop {
            let room = active.producer.vacant_len() / channels * channels;
            if room > 0 {
                let pushed = active.producer.push_slice(&samples[..room.min(samples.len())]);
                return Ok(pushed * sample_size);
            }
            thread::sleep(BRIDGE_POLL);
        }
    }

    fn flush(&mut self) {
        if let Some(active) = &self.stream {
            active.flush.store(true, Ordering::Release);
        }
    }

    fn drain(&mut self) {
        let Some(active) = &self.stream else {
            return;
        };
        let queued = active.producer.occupied_len();
        let frames = queued / active.format.channels.max(1) as usize;
        let deadline = Instant::now()
            + Duration::from_secs_f64(frames as f64 / active.format.rate.max(1) as f64)
            + Duration::from_secs(1);
        while !active.producer.is_empty() && Instant::now() < deadline {
            thread::sleep(BRIDGE_POLL);
        }
    }

    fn pause(&mut self) {
        if let Some(active) = &self.stream {
            active.running.store(false, Ordering::Relaxed);
        }
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.stop_stream();
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s16_samples_are_scaled_to_unit_range() {
        let mut bytes = Vec::new();
        for s in [0i16, 16_384, -32_768] {
            bytes.extend_from_slice(&s.to_ne_bytes());
        }
        let mut out = Vec::new();
        decode_samples(Encoding::SIGNED_16, &bytes, &mut out);
        assert_eq!(out, vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn only_the_cpal_driver_is_created() {
        let factory = CpalSinkFactory;
        let err = factory
            .create("alsa", None, &SessionParams::default())
            .err()
            .unwrap();
        assert!(matches!(err, SinkError::UnknownDriver(_)));
    }
}
