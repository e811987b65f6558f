//! Command channel over a Unix socket pair.
//!
//! The buffer process reads commands in small batches so that one wake-up
//! can handle a run of `DATA` notifications. Payloads are read from the
//! batch first and then straight from the socket, since a payload may
//! extend past the end of a batch.

use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{send, MsgFlags};

use crate::{
    error::Result,
    ipc::command::{Request, Response},
    ipc::wire::DecodeError,
};

/// Most command bytes taken from the socket in one read.
pub const COMMAND_BATCH: usize = 100;

/// One end of the command channel.
#[derive(Debug)]
pub struct CommandChannel {
    stream: UnixStream,
}

/// Create a connected pair: `(controller end, buffer process end)`.
pub fn command_channel() -> Result<(CommandChannel, CommandChannel)> {
    let (controller, buffer) = UnixStream::pair()?;
    Ok((
        CommandChannel { stream: controller },
        CommandChannel { stream: buffer },
    ))
}

impl CommandChannel {
    /// Write all of `bytes` or fail. A vanished peer is an `EPIPE` error,
    /// never a `SIGPIPE`.
    pub fn send(&self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            match send(self.stream.as_raw_fd(), bytes, MsgFlags::MSG_NOSIGNAL) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => bytes = &bytes[n..],
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn send_request(&self, request: &Request) -> io::Result<()> {
        let mut out = Vec::with_capacity(16);
        request.encode(&mut out);
        self.send(&out)
    }

    pub fn recv_response(&self) -> std::result::Result<Response, DecodeError> {
        Response::decode(&mut &self.stream)
    }

    /// Blocking reader for the payload that follows a response.
    pub fn reader(&self) -> &UnixStream {
        &self.stream
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Whether a read would return without blocking. With `block` set, wait
    /// until it would.
    pub fn wait_readable(&self, block: bool) -> io::Result<bool> {
        let timeout = if block {
            PollTimeout::NONE
        } else {
            PollTimeout::ZERO
        };
        loop {
            let mut fds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read up to [`COMMAND_BATCH`] bytes into `batch`, replacing its
    /// contents. Returns 0 if nothing was pending and `block` is false.
    ///
    /// The peer closing its end is reported as `UnexpectedEof`.
    pub fn receive_batch(&self, block: bool, batch: &mut Vec<u8>) -> io::Result<usize> {
        batch.clear();
        if !self.wait_readable(block)? {
            return Ok(0);
        }
        batch.resize(COMMAND_BATCH, 0);
        let n = loop {
            match (&self.stream).read(batch) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    batch.clear();
                    return Err(e);
                }
            }
        };
        batch.truncate(n);
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the command channel",
            ));
        }
        Ok(n)
    }

    /// Walk the commands in `batch`, reading payload overflow from the socket.
    pub fn frames<'a>(&'a self, batch: &'a [u8]) -> FrameReader<'a> {
        FrameReader {
            pending: batch,
            stream: &self.stream,
        }
    }
}

impl AsRawFd for CommandChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Reader over one received batch, backed by the socket.
pub struct FrameReader<'a> {
    pending: &'a [u8],
    stream: &'a UnixStream,
}

impl FrameReader<'_> {
    /// Next command byte of the batch. `None` once the batch is used up;
    /// command bytes are never pulled from the socket here.
    pub fn next_command(&mut self) -> Option<u8> {
        let (&first, rest) = self.pending.split_first()?;
        self.pending = rest;
        Some(first)
    }
}

impl Read for FrameReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            return self.pending.read(buf);
        }
        self.stream.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::wire;

    #[test]
    fn empty_channel_is_not_readable() {
        let (_controller, buffer) = command_channel().unwrap();
        let mut batch = Vec::new();
        assert_eq!(buffer.receive_batch(false, &mut batch).unwrap(), 0);
        assert!(batch.is_empty());
    }

    #[test]
    fn payload_spilling_past_the_batch_is_read_from_the_socket() {
        let (controller, buffer) = command_channel().unwrap();
        let params = crate::config::SessionParams {
            name: "x".repeat(300),
            ..Default::default()
        };
        controller.send_request(&Request::Data).unwrap();
        controller.send_request(&Request::SetParams(params.clone())).unwrap();
        controller.send_request(&Request::Ping).unwrap();

        let mut seen = Vec::new();
        let mut batch = Vec::new();
        while seen.len() < 3 {
            buffer.receive_batch(true, &mut batch).unwrap();
            let mut frames = buffer.frames(&batch);
            while let Some(byte) = frames.next_command() {
                seen.push(Request::decode(byte, &mut frames).unwrap());
            }
        }
        assert_eq!(
            seen,
            vec![Request::Data, Request::SetParams(params), Request::Ping]
        );
    }

    #[test]
    fn closed_peer_is_reported_as_eof() {
        let (controller, buffer) = command_channel().unwrap();
        drop(controller);
        let mut batch = Vec::new();
        let err = buffer.receive_batch(true, &mut batch).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn responses_come_back_in_order() {
        let (controller, buffer) = command_channel().unwrap();
        let mut out = Vec::new();
        Response::Ok.encode(&mut out);
        wire::put_u32(&mut out, 7);
        Response::Error(crate::error::ErrorCode::DeviceOpen).encode(&mut out);
        buffer.send(&out).unwrap();

        assert_eq!(controller.recv_response().unwrap(), Response::Ok);
        assert_eq!(wire::read_u32(&mut controller.reader()).unwrap(), 7);
        assert_eq!(
            controller.recv_response().unwrap(),
            Response::Error(crate::error::ErrorCode::DeviceOpen)
        );
    }
}
