//! Buffer configuration and the session parameters mirrored into the
//! buffer process.

use std::fs;
use std::ops::BitOr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BufferError, Result};

/// Smallest accepted output burst.
pub const MIN_OUTPUT_BURST: usize = 1024;

/// Output flags forwarded to sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputFlags(u32);

impl OutputFlags {
    pub const HEADPHONES: OutputFlags = OutputFlags(0x01);
    pub const INTERNAL_SPEAKER: OutputFlags = OutputFlags(0x02);
    pub const LINE_OUT: OutputFlags = OutputFlags(0x04);
    pub const QUIET: OutputFlags = OutputFlags(0x08);
    /// Keep writing until a whole chunk is consumed, instead of returning
    /// after one sink write.
    pub const KEEP_PLAYING: OutputFlags = OutputFlags(0x10);

    pub const fn empty() -> Self {
        OutputFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: OutputFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: OutputFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for OutputFlags {
    type Output = OutputFlags;

    fn bitor(self, rhs: OutputFlags) -> OutputFlags {
        OutputFlags(self.0 | rhs.0)
    }
}

/// Parameters owned by the controller and synced into the buffer process
/// with `SET_PARAMS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SessionParams {
    pub flags: OutputFlags,
    /// Fraction of the ring to accumulate before feeding the device.
    /// Capped at one half of the ring.
    pub preload: f64,
    /// Device gain, driver specific. `None` leaves the device alone.
    pub gain: Option<i64>,
    /// Device-internal buffer target in seconds. 0 lets the driver decide.
    pub device_buffer: f64,
    pub verbose: u8,
    /// Client name some drivers show to the user.
    pub name: String,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            flags: OutputFlags::empty(),
            preload: 0.2,
            gain: None,
            device_buffer: 0.0,
            verbose: 0,
            name: "xferbuf".into(),
        }
    }
}

impl SessionParams {
    pub fn normalize(&mut self) {
        if !self.preload.is_finite() {
            self.preload = 0.0;
        }
        self.preload = self.preload.clamp(0.0, 1.0);
        if !self.device_buffer.is_finite() {
            self.device_buffer = 0.0;
        }
        self.device_buffer = self.device_buffer.clamp(0.0, 10.0);
        self.name = self.name.trim().to_string();
    }

    /// Bytes to accumulate before feeding the device, for a ring of
    /// `capacity` bytes.
    pub fn preload_target(&self, capacity: usize) -> usize {
        let target = (self.preload.clamp(0.0, 1.0) * capacity as f64) as usize;
        target.min(capacity / 2)
    }
}

/// How the buffer process is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnMode {
    /// A forked child process sharing only the ring mapping.
    #[default]
    Process,
    /// A worker thread in this process. Interrupts are cooperative, so a
    /// blocking sink write cannot be cut short.
    Thread,
}

/// Configuration for `BufferController`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct BufferConfig {
    /// Requested ring capacity in bytes. Raised to two output bursts if
    /// smaller. Default: 1 MiB.
    pub buffer_bytes: usize,
    /// Largest chunk handed to the sink in one write, and the fill level
    /// below which the buffer process goes back to preloading.
    /// Default: 32768.
    pub output_burst: usize,
    /// How long to wait for the buffer process to report ready.
    pub startup_timeout_ms: u64,
    pub spawn_mode: SpawnMode,
    pub session: SessionParams,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: 1 << 20,
            output_burst: 32_768,
            startup_timeout_ms: 5_000,
            spawn_mode: SpawnMode::Process,
            session: SessionParams::default(),
        }
    }
}

impl BufferConfig {
    pub fn normalize(&mut self) {
        self.output_burst = self.output_burst.max(MIN_OUTPUT_BURST);
        self.buffer_bytes = self.buffer_bytes.max(2 * self.output_burst);
        self.startup_timeout_ms = self.startup_timeout_ms.clamp(100, 60_000);
        self.session.normalize();
    }

    /// Ring capacity actually allocated.
    pub fn capacity(&self) -> usize {
        self.buffer_bytes.max(2 * self.output_burst)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Load a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let mut config: BufferConfig = serde_json::from_str(&raw)
            .map_err(|e| BufferError::InvalidArgument(format!("{}: {e}", path.display())))?;
        config.normalize();
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), "failed to load buffer config: {e}");
                let mut config = Self::default();
                config.normalize();
                config
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(anyhow::Error::from)?;
        fs::write(path, json)?;
        Ok(())
    }
}
