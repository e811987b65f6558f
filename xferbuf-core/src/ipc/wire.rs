//! Payload codec for the command channel.
//!
//! Integers travel as raw native-endian fixed-width values; both ends are
//! the same build on the same machine. Blobs and strings are a `u64` length
//! followed by that many bytes. An absent string is the length
//! [`NO_STRING`], so `None` and `Some("")` stay distinct.
//!
//! Encoding appends to a `Vec<u8>` and cannot fail. Decoding reads from
//! anything implementing [`Read`].

use std::io::{self, Read};

use thiserror::Error;

use crate::error::BufferError;

/// Length marking an absent string.
pub const NO_STRING: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("channel read failed: {0}")]
    Io(#[from] io::Error),

    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),

    /// The payload was announced but could not be allocated. Its bytes have
    /// already been skipped, so the stream is still in step.
    #[error("cannot allocate {requested} bytes for payload")]
    OutOfMemory { requested: u64 },

    /// The payload was read completely but its contents are unusable.
    #[error("malformed payload: {0}")]
    BadPayload(String),
}

impl From<DecodeError> for BufferError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Io(e) => BufferError::Io(e),
            DecodeError::OutOfMemory { requested } => BufferError::OutOfMemory { requested },
            other => BufferError::Protocol(other.to_string()),
        }
    }
}

pub fn put_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

pub fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_ne_bytes());
}

pub fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_ne_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_ne_bytes());
}

pub fn put_blob(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u64(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

pub fn put_str(out: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(s) => put_blob(out, s.as_bytes()),
        None => put_u64(out, NO_STRING),
    }
}

pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn read_u16<R: Read>(r: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_ne_bytes(buf))
}

pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Consume and discard exactly `count` bytes.
pub fn skip<R: Read>(r: &mut R, count: u64) -> io::Result<()> {
    let skipped = io::copy(&mut r.take(count), &mut io::sink())?;
    if skipped < count {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("channel closed {} bytes into a {count} byte payload", skipped),
        ));
    }
    Ok(())
}

fn read_sized<R: Read>(r: &mut R, len: u64) -> Result<Vec<u8>, DecodeError> {
    let mut buf = Vec::new();
    let reserved = usize::try_from(len)
        .ok()
        .map(|size| buf.try_reserve_exact(size).is_ok())
        .unwrap_or(false);
    if !reserved {
        skip(r, len)?;
        return Err(DecodeError::OutOfMemory { requested: len });
    }

    r.take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(DecodeError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("channel closed {} bytes into a {len} byte payload", buf.len()),
        )));
    }
    Ok(buf)
}

pub fn read_blob<R: Read>(r: &mut R) -> Result<Vec<u8>, DecodeError> {
    let len = read_u64(r)?;
    read_sized(r, len)
}

pub fn read_str<R: Read>(r: &mut R) -> Result<Option<String>, DecodeError> {
    let len = read_u64(r)?;
    if len == NO_STRING {
        return Ok(None);
    }
    let bytes = read_sized(r, len)?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|e| DecodeError::BadPayload(format!("string is not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn absent_and_empty_strings_are_distinct() {
        let mut out = Vec::new();
        put_str(&mut out, None);
        put_str(&mut out, Some(""));
        put_str(&mut out, Some("hw:0,0"));

        let mut r = Cursor::new(out);
        assert_eq!(read_str(&mut r).unwrap(), None);
        assert_eq!(read_str(&mut r).unwrap(), Some(String::new()));
        assert_eq!(read_str(&mut r).unwrap(), Some("hw:0,0".to_string()));
    }

    #[test]
    fn blobs_of_every_size_come_back_intact() {
        for len in [0usize, 1, 48 * 1024] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut out = Vec::new();
            put_blob(&mut out, &payload);
            put_u32(&mut out, 0xfeed_beef);

            let mut r = Cursor::new(out);
            assert_eq!(read_blob(&mut r).unwrap(), payload);
            assert_eq!(read_u32(&mut r).unwrap(), 0xfeed_beef);
        }
    }

    #[test]
    fn truncated_blob_is_an_io_error() {
        let mut out = Vec::new();
        put_u64(&mut out, 10);
        out.extend_from_slice(&[1, 2, 3]);
        let err = read_blob(&mut Cursor::new(out)).unwrap_err();
        assert!(matches!(err, DecodeError::Io(_)));
    }

    #[test]
    fn unallocatable_blob_with_missing_bytes_is_an_io_error() {
        let mut out = Vec::new();
        put_u64(&mut out, u64::MAX - 1);
        let err = read_blob(&mut Cursor::new(out)).unwrap_err();
        // The bytes are not there to skip, so this surfaces as the stream
        // ending rather than as a clean out-of-memory.
        assert!(matches!(err, DecodeError::Io(_)));
    }

    #[test]
    fn invalid_utf8_is_a_bad_payload_not_a_desync() {
        let mut out = Vec::new();
        put_blob(&mut out, &[0xff, 0xfe]);
        put_u8(&mut out, 42);
        let mut r = Cursor::new(out);
        assert!(matches!(read_str(&mut r), Err(DecodeError::BadPayload(_))));
        assert_eq!(read_u8(&mut r).unwrap(), 42);
    }
}
