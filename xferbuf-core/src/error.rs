use std::fmt;

use thiserror::Error;

/// All errors produced by xferbuf-core.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer process failed to start: {0}")]
    Startup(String),

    #[error("buffer process did not exit cleanly: {0}")]
    Process(String),

    #[error("command channel protocol error: {0}")]
    Protocol(String),

    #[error("buffer process reported: {0}")]
    Remote(ErrorCode),

    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: u64 },

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("buffer process is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BufferError {
    /// The wire/sticky code this error is reported as.
    pub fn code(&self) -> ErrorCode {
        match self {
            BufferError::Remote(code) => *code,
            BufferError::OutOfMemory { .. } => ErrorCode::OutOfMemory,
            BufferError::Sink(e) => e.code(),
            BufferError::InvalidArgument(_) => ErrorCode::ArgError,
            BufferError::NotRunning => ErrorCode::BadHandle,
            BufferError::Startup(_)
            | BufferError::Process(_)
            | BufferError::Protocol(_)
            | BufferError::SharedMemory(_)
            | BufferError::Io(_)
            | BufferError::Other(_) => ErrorCode::BufferError,
        }
    }
}

impl From<nix::Error> for BufferError {
    fn from(errno: nix::Error) -> Self {
        BufferError::Io(std::io::Error::from(errno))
    }
}

pub type Result<T> = std::result::Result<T, BufferError>;

/// Error code carried after an `ERROR` response and kept as the
/// controller's sticky error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum ErrorCode {
    #[default]
    Ok = 0,
    OutOfMemory = 1,
    BadDriverName = 2,
    BadDriver = 3,
    NoDriver = 4,
    NotLive = 5,
    DevicePlay = 6,
    DeviceOpen = 7,
    BufferError = 8,
    ModuleError = 9,
    BadParam = 10,
    ReadOnlyParam = 11,
    BadHandle = 12,
    ArgError = 13,
}

impl ErrorCode {
    /// Decode a wire value. Values outside the table collapse to
    /// `BufferError`, since they can only come from a corrupted exchange.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::OutOfMemory,
            2 => Self::BadDriverName,
            3 => Self::BadDriver,
            4 => Self::NoDriver,
            5 => Self::NotLive,
            6 => Self::DevicePlay,
            7 => Self::DeviceOpen,
            9 => Self::ModuleError,
            10 => Self::BadParam,
            11 => Self::ReadOnlyParam,
            12 => Self::BadHandle,
            13 => Self::ArgError,
            _ => Self::BufferError,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Ok => "no problem",
            Self::OutOfMemory => "out of memory",
            Self::BadDriverName => "bad driver name",
            Self::BadDriver => "failure loading driver module",
            Self::NoDriver => "no driver loaded",
            Self::NotLive => "no active audio device",
            Self::DevicePlay => "some device playback error",
            Self::DeviceOpen => "failed to open device",
            Self::BufferError => "buffer (communication) error",
            Self::ModuleError => "basic module system error",
            Self::BadParam => "unknown parameter code",
            Self::ReadOnlyParam => "attempt to set read-only parameter",
            Self::BadHandle => "invalid output handle",
            Self::ArgError => "bad argument",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Errors reported by [`Sink`](crate::audio::sink::Sink) implementations.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    /// The factory has no driver with this name.
    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    /// The device could not be opened with the requested format.
    #[error("failed to open device: {0}")]
    Open(String),

    /// A write to the device failed.
    #[error("device write failed: {0}")]
    Write(String),

    /// A blocking write was cut short by an interrupt. Not a device fault.
    #[error("device write interrupted")]
    Interrupted,

    /// The sink was used while closed.
    #[error("device is closed")]
    Closed,
}

impl SinkError {
    pub fn open(reason: impl Into<String>) -> Self {
        SinkError::Open(reason.into())
    }

    pub fn write_failed(reason: impl Into<String>) -> Self {
        SinkError::Write(reason.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SinkError::UnknownDriver(_) => ErrorCode::BadDriver,
            SinkError::Open(_) => ErrorCode::DeviceOpen,
            SinkError::Write(_) | SinkError::Interrupted | SinkError::Closed => {
                ErrorCode::DevicePlay
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_survive_the_wire_value() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::NotLive,
            ErrorCode::DeviceOpen,
            ErrorCode::ArgError,
        ] {
            assert_eq!(ErrorCode::from_u32(code.as_u32()), code);
        }
    }

    #[test]
    fn unknown_wire_code_is_a_buffer_error() {
        assert_eq!(ErrorCode::from_u32(999), ErrorCode::BufferError);
    }

    #[test]
    fn remote_errors_keep_their_code() {
        let err = BufferError::Remote(ErrorCode::NotLive);
        assert_eq!(err.code(), ErrorCode::NotLive);
        assert_eq!(err.to_string(), "buffer process reported: no active audio device");
    }
}
