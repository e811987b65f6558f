//! Commands exchanged between controller and buffer process.
//!
//! Every message starts with one [`CommandCode`] byte. Requests travel from
//! the controller; `OK`, `ERROR` and `PONG` travel back. Except for `DATA`,
//! every request is answered by exactly one terminal response, optionally
//! followed by a result payload described on the request variant.

use std::io::Read;

use crate::{
    audio::{AudioFormat, Encoding},
    config::SessionParams,
    error::ErrorCode,
    ipc::wire::{self, DecodeError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    Ping = 1,
    Pong = 2,
    Data = 3,
    Terminate = 4,
    Drop = 5,
    Drain = 6,
    Pause = 7,
    Continue = 8,
    IgnoreLowBuffer = 9,
    Ok = 10,
    Error = 11,
    Open = 12,
    Close = 13,
    Start = 14,
    Stop = 15,
    QueryEncodings = 16,
    QueryFormats = 17,
    SetParams = 18,
    BoundedDrain = 19,
}

impl CommandCode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        let code = match byte {
            1 => Self::Ping,
            2 => Self::Pong,
            3 => Self::Data,
            4 => Self::Terminate,
            5 => Self::Drop,
            6 => Self::Drain,
            7 => Self::Pause,
            8 => Self::Continue,
            9 => Self::IgnoreLowBuffer,
            10 => Self::Ok,
            11 => Self::Error,
            12 => Self::Open,
            13 => Self::Close,
            14 => Self::Start,
            15 => Self::Stop,
            16 => Self::QueryEncodings,
            17 => Self::QueryFormats,
            18 => Self::SetParams,
            19 => Self::BoundedDrain,
            _ => return None,
        };
        Some(code)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A controller request, with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Liveness probe. Answered `PONG` while live, `ERROR` otherwise.
    Ping,
    /// New audio is in the ring. Never answered.
    Data,
    /// Answered `OK`, after which the buffer process exits.
    Terminate,
    Drop,
    Drain,
    Pause,
    Continue,
    IgnoreLowBuffer,
    /// `OK` is followed by the resolved driver, device and real device name.
    Open {
        driver: Option<String>,
        device: Option<String>,
    },
    Close,
    Start(AudioFormat),
    Stop,
    /// `OK` is followed by a `u32` encoding mask.
    QueryEncodings { rate: u32, channels: u16 },
    /// `OK` is followed by a `u32` record count and a blob of records.
    QueryFormats {
        rates: Vec<u32>,
        min_channels: u16,
        max_channels: u16,
    },
    SetParams(SessionParams),
    BoundedDrain { limit: u64, old_fill: u64 },
}

impl Request {
    pub fn code(&self) -> CommandCode {
        match self {
            Request::Ping => CommandCode::Ping,
            Request::Data => CommandCode::Data,
            Request::Terminate => CommandCode::Terminate,
            Request::Drop => CommandCode::Drop,
            Request::Drain => CommandCode::Drain,
            Request::Pause => CommandCode::Pause,
            Request::Continue => CommandCode::Continue,
            Request::IgnoreLowBuffer => CommandCode::IgnoreLowBuffer,
            Request::Open { .. } => CommandCode::Open,
            Request::Close => CommandCode::Close,
            Request::Start(_) => CommandCode::Start,
            Request::Stop => CommandCode::Stop,
            Request::QueryEncodings { .. } => CommandCode::QueryEncodings,
            Request::QueryFormats { .. } => CommandCode::QueryFormats,
            Request::SetParams(_) => CommandCode::SetParams,
            Request::BoundedDrain { .. } => CommandCode::BoundedDrain,
        }
    }

    /// Whether a terminal response follows.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Request::Data)
    }

    /// Pause and drop are preceded by an interrupt so they are not stuck
    /// behind a blocking device write.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Request::Pause | Request::Drop)
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        wire::put_u8(out, self.code().as_u8());
        match self {
            Request::Open { driver, device } => {
                wire::put_str(out, driver.as_deref());
                wire::put_str(out, device.as_deref());
            }
            Request::Start(format) => {
                wire::put_u32(out, format.encoding.bits());
                wire::put_u16(out, format.channels);
                wire::put_u32(out, format.rate);
            }
            Request::QueryEncodings { rate, channels } => {
                wire::put_u16(out, *channels);
                wire::put_u32(out, *rate);
            }
            Request::QueryFormats {
                rates,
                min_channels,
                max_channels,
            } => {
                let blob: Vec<u8> = rates.iter().flat_map(|r| r.to_ne_bytes()).collect();
                wire::put_blob(out, &blob);
                wire::put_u16(out, *min_channels);
                wire::put_u16(out, *max_channels);
            }
            Request::SetParams(params) => {
                // Serializing a plain struct of numbers and a string cannot fail.
                let json = serde_json::to_vec(params).unwrap_or_default();
                wire::put_blob(out, &json);
            }
            Request::BoundedDrain { limit, old_fill } => {
                wire::put_u64(out, *limit);
                wire::put_u64(out, *old_fill);
            }
            Request::Ping
            | Request::Data
            | Request::Terminate
            | Request::Drop
            | Request::Drain
            | Request::Pause
            | Request::Continue
            | Request::IgnoreLowBuffer
            | Request::Close
            | Request::Stop => {}
        }
    }

    /// Read the payload that follows command byte `byte`.
    ///
    /// On `OutOfMemory` and `BadPayload` the whole payload has been consumed
    /// and the stream is still framed correctly.
    pub fn decode<R: Read>(byte: u8, r: &mut R) -> Result<Self, DecodeError> {
        let code = CommandCode::from_u8(byte).ok_or(DecodeError::UnknownCommand(byte))?;
        let request = match code {
            CommandCode::Ping => Request::Ping,
            CommandCode::Data => Request::Data,
            CommandCode::Terminate => Request::Terminate,
            CommandCode::Drop => Request::Drop,
            CommandCode::Drain => Request::Drain,
            CommandCode::Pause => Request::Pause,
            CommandCode::Continue => Request::Continue,
            CommandCode::IgnoreLowBuffer => Request::IgnoreLowBuffer,
            CommandCode::Close => Request::Close,
            CommandCode::Stop => Request::Stop,
            CommandCode::Open => {
                // Both strings are read before either error is reported.
                let driver = wire::read_str(r);
                let device = wire::read_str(r)?;
                Request::Open {
                    driver: driver?,
                    device,
                }
            }
            CommandCode::Start => {
                let encoding = Encoding::from_bits(wire::read_u32(r)?);
                let channels = wire::read_u16(r)?;
                let rate = wire::read_u32(r)?;
                Request::Start(AudioFormat::new(rate, channels, encoding))
            }
            CommandCode::QueryEncodings => {
                let channels = wire::read_u16(r)?;
                let rate = wire::read_u32(r)?;
                Request::QueryEncodings { rate, channels }
            }
            CommandCode::QueryFormats => {
                // Channel bounds follow the blob and must be consumed even
                // when the blob could not be kept.
                let blob = wire::read_blob(r);
                let min_channels = wire::read_u16(r)?;
                let max_channels = wire::read_u16(r)?;
                let blob = blob?;
                if blob.len() % 4 != 0 {
                    return Err(DecodeError::BadPayload(format!(
                        "rate list of {} bytes",
                        blob.len()
                    )));
                }
                let rates = blob
                    .chunks_exact(4)
                    .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                Request::QueryFormats {
                    rates,
                    min_channels,
                    max_channels,
                }
            }
            CommandCode::SetParams => {
                let json = wire::read_blob(r)?;
                let params = serde_json::from_slice(&json)
                    .map_err(|e| DecodeError::BadPayload(format!("session params: {e}")))?;
                Request::SetParams(params)
            }
            CommandCode::BoundedDrain => {
                let limit = wire::read_u64(r)?;
                let old_fill = wire::read_u64(r)?;
                Request::BoundedDrain { limit, old_fill }
            }
            CommandCode::Pong | CommandCode::Ok | CommandCode::Error => {
                return Err(DecodeError::UnknownCommand(byte))
            }
        };
        Ok(request)
    }
}

/// Terminal response heading every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Ok,
    Pong,
    Error(ErrorCode),
}

impl Response {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Response::Ok => wire::put_u8(out, CommandCode::Ok.as_u8()),
            Response::Pong => wire::put_u8(out, CommandCode::Pong.as_u8()),
            Response::Error(code) => {
                wire::put_u8(out, CommandCode::Error.as_u8());
                wire::put_u32(out, code.as_u32());
            }
        }
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let byte = wire::read_u8(r)?;
        match CommandCode::from_u8(byte) {
            Some(CommandCode::Ok) => Ok(Response::Ok),
            Some(CommandCode::Pong) => Ok(Response::Pong),
            Some(CommandCode::Error) => {
                let code = wire::read_u32(r)?;
                Ok(Response::Error(ErrorCode::from_u32(code)))
            }
            _ => Err(DecodeError::UnknownCommand(byte)),
        }
    }
}

/// Strings reported back after a successful `OPEN`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenedSink {
    pub driver: Option<String>,
    pub device: Option<String>,
    pub real_name: Option<String>,
}

impl OpenedSink {
    pub fn encode(&self, out: &mut Vec<u8>) {
        wire::put_str(out, self.driver.as_deref());
        wire::put_str(out, self.device.as_deref());
        wire::put_str(out, self.real_name.as_deref());
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(Self {
            driver: wire::read_str(r)?,
            device: wire::read_str(r)?,
            real_name: wire::read_str(r)?,
        })
    }
}

/// Size of one format record on the wire: rate, channels, padding, encoding.
pub const FORMAT_RECORD_SIZE: usize = 12;

/// Count and record blob following `OK` to `QUERY_FORMATS`.
pub fn encode_format_records(out: &mut Vec<u8>, records: &[AudioFormat]) {
    let mut blob = Vec::with_capacity(records.len() * FORMAT_RECORD_SIZE);
    for record in records {
        blob.extend_from_slice(&record.rate.to_ne_bytes());
        blob.extend_from_slice(&record.channels.to_ne_bytes());
        blob.extend_from_slice(&0u16.to_ne_bytes());
        blob.extend_from_slice(&record.encoding.bits().to_ne_bytes());
    }
    wire::put_u32(out, records.len() as u32);
    wire::put_blob(out, &blob);
}

pub fn decode_format_records<R: Read>(r: &mut R) -> Result<Vec<AudioFormat>, DecodeError> {
    let count = wire::read_u32(r)? as usize;
    let blob = wire::read_blob(r)?;
    if blob.len() != count * FORMAT_RECORD_SIZE {
        return Err(DecodeError::BadPayload(format!(
            "{count} format records in {} bytes",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(FORMAT_RECORD_SIZE)
        .map(|c| {
            AudioFormat::new(
                u32::from_ne_bytes([c[0], c[1], c[2], c[3]]),
                u16::from_ne_bytes([c[4], c[5]]),
                Encoding::from_bits(u32::from_ne_bytes([c[8], c[9], c[10], c[11]])),
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::config::OutputFlags;

    fn round_trip(request: &Request) -> Request {
        let mut out = Vec::new();
        request.encode(&mut out);
        let mut r = Cursor::new(&out[1..]);
        let decoded = Request::decode(out[0], &mut r).unwrap();
        assert_eq!(r.position() as usize, out.len() - 1, "payload fully consumed");
        decoded
    }

    #[test]
    fn every_request_round_trips() {
        let mut params = SessionParams::default();
        params.flags = OutputFlags::HEADPHONES;
        params.gain = Some(12);
        let requests = [
            Request::Ping,
            Request::Data,
            Request::Terminate,
            Request::Drop,
            Request::Drain,
            Request::Pause,
            Request::Continue,
            Request::IgnoreLowBuffer,
            Request::Open {
                driver: Some("alsa,null".into()),
                device: None,
            },
            Request::Close,
            Request::Start(AudioFormat::new(44_100, 2, Encoding::SIGNED_16)),
            Request::Stop,
            Request::QueryEncodings {
                rate: 48_000,
                channels: 6,
            },
            Request::QueryFormats {
                rates: vec![],
                min_channels: 1,
                max_channels: 2,
            },
            Request::QueryFormats {
                rates: vec![8_000],
                min_channels: 1,
                max_channels: 1,
            },
            Request::SetParams(params),
            Request::BoundedDrain {
                limit: 500,
                old_fill: 2_000,
            },
        ];
        for request in &requests {
            assert_eq!(&round_trip(request), request);
        }
    }

    #[test]
    fn large_rate_list_round_trips() {
        let rates: Vec<u32> = (0..2_048).map(|i| 8_000 + i * 11).collect();
        let request = Request::QueryFormats {
            rates,
            min_channels: 1,
            max_channels: 8,
        };
        assert_eq!(round_trip(&request), request);
    }

    #[test]
    fn only_data_goes_unanswered() {
        assert!(!Request::Data.expects_reply());
        assert!(Request::Ping.expects_reply());
        assert!(Request::Pause.is_urgent() && Request::Drop.is_urgent());
        assert!(!Request::Drain.is_urgent());
    }

    #[test]
    fn responses_are_not_requests() {
        let mut r = Cursor::new(Vec::new());
        let err = Request::decode(CommandCode::Ok.as_u8(), &mut r).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownCommand(10)));
        assert!(matches!(
            Request::decode(0xee, &mut r),
            Err(DecodeError::UnknownCommand(0xee))
        ));
    }

    #[test]
    fn error_response_carries_its_code() {
        let mut out = Vec::new();
        Response::Error(ErrorCode::NotLive).encode(&mut out);
        Response::Pong.encode(&mut out);
        let mut r = Cursor::new(out);
        assert_eq!(
            Response::decode(&mut r).unwrap(),
            Response::Error(ErrorCode::NotLive)
        );
        assert_eq!(Response::decode(&mut r).unwrap(), Response::Pong);
    }

    #[test]
    fn malformed_params_leave_the_stream_in_step() {
        let mut out = Vec::new();
        wire::put_blob(&mut out, b"{ nope");
        Request::Ping.encode(&mut out);
        let mut r = Cursor::new(out);
        assert!(matches!(
            Request::decode(CommandCode::SetParams.as_u8(), &mut r),
            Err(DecodeError::BadPayload(_))
        ));
        assert_eq!(wire::read_u8(&mut r).unwrap(), CommandCode::Ping.as_u8());
    }

    #[test]
    fn bad_driver_name_still_consumes_the_device_name() {
        let mut out = Vec::new();
        wire::put_blob(&mut out, &[0xff, 0xfe]);
        wire::put_str(&mut out, Some("abc"));
        Request::Ping.encode(&mut out);
        let mut r = Cursor::new(out);
        assert!(matches!(
            Request::decode(CommandCode::Open.as_u8(), &mut r),
            Err(DecodeError::BadPayload(_))
        ));
        assert_eq!(wire::read_u8(&mut r).unwrap(), CommandCode::Ping.as_u8());
    }

    #[test]
    fn format_records_round_trip_including_empty() {
        for records in [
            vec![],
            vec![
                AudioFormat::default(),
                AudioFormat::new(44_100, 2, Encoding::SIGNED_16 | Encoding::FLOAT_32),
            ],
        ] {
            let mut out = Vec::new();
            encode_format_records(&mut out, &records);
            assert_eq!(decode_format_records(&mut Cursor::new(out)).unwrap(), records);
        }
    }
}
