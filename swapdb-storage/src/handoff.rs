//! # Checkpoint handoff channel
//!
//! A single-message, at-most-once channel over an anonymous pipe, used to
//! tell a forked child where its checkpoint was materialized.
//!
//! - The write side is non-blocking. [`HandoffWriter::write_pending`] writes
//!   as much as the pipe accepts and reports `WouldBlock`; the caller waits for
//!   writability and calls it again.
//! - The read side blocks until EOF. An empty message means the writer went
//!   away without sending anything and is reported as an error.
//! - A message is terminated by a NUL byte, which no path contains. A writer
//!   dropped halfway through leaves no terminator, so the reader rejects the
//!   truncated message instead of returning it.
//!
//! Each side is owned by exactly one process after fork and closed when its
//! half is dropped.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::debug;

use swapdb_core::error::{Error, Result};

const TERMINATOR: u8 = 0;

fn handoff_error(message: impl Into<String>, source: Option<io::Error>) -> Error {
    Error::Handoff {
        message: message.into(),
        source,
    }
}

/// Create a connected reader/writer pair.
pub fn channel() -> Result<(HandoffReader, HandoffWriter)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(handoff_error("create pipe", Some(io::Error::last_os_error())));
    }
    // SAFETY: pipe() returned two fresh descriptors that nothing else owns
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    set_cloexec(read.as_raw_fd())?;
    set_cloexec(write.as_raw_fd())?;
    set_nonblocking(write.as_raw_fd())?;

    Ok((
        HandoffReader {
            file: File::from(read),
        },
        HandoffWriter {
            file: File::from(write),
            payload: None,
            written: 0,
        },
    ))
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(handoff_error("set O_NONBLOCK", Some(io::Error::last_os_error())));
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(handoff_error("set FD_CLOEXEC", Some(io::Error::last_os_error())));
    }
    Ok(())
}

/// Blocking read side
#[derive(Debug)]
pub struct HandoffReader {
    file: File,
}

impl HandoffReader {
    /// Read until the writer closes. Fails on I/O error, invalid UTF-8 or an empty message.
    pub fn read_message(mut self) -> Result<String> {
        let mut raw = Vec::new();
        loop {
            match self.file.read_to_end(&mut raw) {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(handoff_error("read handoff pipe", Some(e))),
            }
        }
        if raw.is_empty() {
            return Err(handoff_error("writer closed without sending a checkpoint path", None));
        }
        if raw.pop() != Some(TERMINATOR) {
            return Err(handoff_error(format!("truncated message after {} bytes", raw.len() + 1), None));
        }
        String::from_utf8(raw).map_err(|e| handoff_error(format!("message is not UTF-8: {}", e), None))
    }
}

/// Outcome of one write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// The whole message is in the pipe
    Done,
    /// The pipe is full; wait for it to become writable and call again
    WouldBlock,
}

/// Non-blocking, resumable write side
#[derive(Debug)]
pub struct HandoffWriter {
    file: File,
    payload: Option<Vec<u8>>,
    written: usize,
}

impl HandoffWriter {
    /// Set the message. May only be called once.
    pub fn set_payload(&mut self, message: &str) -> Result<()> {
        if self.payload.is_some() {
            return Err(handoff_error("payload already set", None));
        }
        if message.as_bytes().contains(&TERMINATOR) {
            return Err(handoff_error("message contains a NUL byte", None));
        }
        let mut payload = Vec::with_capacity(message.len() + 1);
        payload.extend_from_slice(message.as_bytes());
        payload.push(TERMINATOR);
        self.payload = Some(payload);
        Ok(())
    }

    /// Write as much of the message as the pipe accepts.
    pub fn write_pending(&mut self) -> Result<WriteProgress> {
        let Some(payload) = self.payload.as_ref() else {
            return Err(handoff_error("no payload to write", None));
        };

        while self.written < payload.len() {
            match self.file.write(&payload[self.written..]) {
                Ok(0) => return Err(handoff_error("pipe accepted no bytes", None)),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    debug!(written = self.written, total = payload.len(), "Handoff pipe full");
                    return Ok(WriteProgress::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(handoff_error("write handoff pipe", Some(e))),
            }
        }
        Ok(WriteProgress::Done)
    }

    pub fn is_complete(&self) -> bool {
        self.payload
            .as_ref()
            .is_some_and(|p| self.written == p.len())
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Block until `fd` is writable or `timeout` passes. Returns whether it is writable
/// (a closed read end also counts: the next write reports the error).
pub fn wait_writable(fd: RawFd, timeout: Duration) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc >= 0 {
            return Ok(rc > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(handoff_error("poll handoff pipe", Some(err)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_message_round_trip() {
        let (reader, mut writer) = channel().unwrap();
        writer.set_payload("/data/tmp_1700000000").unwrap();
        assert_eq!(writer.write_pending().unwrap(), WriteProgress::Done);
        assert!(writer.is_complete());
        drop(writer);

        assert_eq!(reader.read_message().unwrap(), "/data/tmp_1700000000");
    }

    #[test]
    fn test_writer_dropped_without_payload() {
        let (reader, writer) = channel().unwrap();
        drop(writer);
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, Error::Handoff { .. }));
    }

    #[test]
    fn test_truncated_message_rejected() {
        let (reader, mut writer) = channel().unwrap();
        writer.set_payload(&"x".repeat(1 << 20)).unwrap();
        assert_eq!(writer.write_pending().unwrap(), WriteProgress::WouldBlock);
        drop(writer);

        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, Error::Handoff { .. }));
    }

    #[test]
    fn test_payload_set_once() {
        let (_reader, mut writer) = channel().unwrap();
        assert!(writer.write_pending().is_err());
        writer.set_payload("a").unwrap();
        assert!(writer.set_payload("b").is_err());
    }

    #[test]
    fn test_resumes_after_would_block() {
        let (reader, mut writer) = channel().unwrap();
        // Larger than any default pipe buffer
        let message = "x".repeat(1 << 20);
        writer.set_payload(&message).unwrap();
        assert_eq!(writer.write_pending().unwrap(), WriteProgress::WouldBlock);

        let consumer = thread::spawn(move || reader.read_message());
        while writer.write_pending().unwrap() == WriteProgress::WouldBlock {
            wait_writable(writer.raw_fd(), Duration::from_secs(5)).unwrap();
        }
        drop(writer);

        assert_eq!(consumer.join().unwrap().unwrap().len(), message.len());
    }
}
