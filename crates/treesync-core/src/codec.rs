//! Stream framing: command lines interleaved with raw file payloads.
//!
//! Commands are `\n`-terminated UTF-8 lines (a trailing `\r` is stripped).
//! `UPLOAD_FILE "<path>" <size>` is followed directly by `size` raw bytes;
//! `DOWNLOAD_FILE "<path>"` is followed by a `<size>` line and then the bytes.
//! There is no other framing: the reader must consume exactly `size` bytes
//! before it goes back to reading lines, and a sender that declares the wrong
//! size desynchronizes the stream for the rest of the connection.

use crate::command::{self, Command, CommandError};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
};
use tracing::{debug, warn};

/// Longest command line accepted before it is discarded as malformed.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Payload bytes are moved in chunks of this size.
pub const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Cannot encode command: {0}")]
    Encode(#[from] CommandError),

    #[error("{0} must be sent together with its payload")]
    PayloadRequired(&'static str),

    #[error("{0} does not carry a payload")]
    NoPayload(&'static str),

    #[error("Cannot read {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One unit read from the stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A command with no payload.
    Command(Command),
    /// A file transfer; exactly `size` payload bytes follow and must be
    /// consumed with [`CommandReader::read_payload`] before the next frame.
    Transfer { command: Command, size: u64 },
    /// A line that could not be parsed. The stream continues.
    Malformed { line: String, error: CommandError },
    /// The peer closed the stream.
    Closed,
}

/// Result of draining one payload from the stream.
#[derive(Debug)]
pub struct PayloadReceipt {
    /// Size declared by the sender
    pub expected: u64,
    /// Bytes actually taken from the stream
    pub received: u64,
    /// First error from the destination; the payload is still drained
    pub write_error: Option<io::Error>,
}

impl PayloadReceipt {
    pub fn is_complete(&self) -> bool {
        self.received == self.expected
    }
}

enum RawLine {
    Text(String),
    Invalid { line: String, error: CommandError },
    Eof,
}

/// Reads frames from the inbound half of a connection.
pub struct CommandReader<R> {
    inner: R,
}

impl<R: AsyncBufRead + Unpin> CommandReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next frame, skipping blank lines.
    ///
    /// Only transport failures are returned as `Err`; protocol problems come
    /// back as [`Frame::Malformed`].
    pub async fn read_frame(&mut self) -> io::Result<Frame> {
        loop {
            let line = match self.read_line().await? {
                RawLine::Eof => return Ok(Frame::Closed),
                RawLine::Invalid { line, error } => return Ok(Frame::Malformed { line, error }),
                RawLine::Text(line) => line,
            };

            if line.trim().is_empty() {
                continue;
            }

            let command = match Command::parse(&line) {
                Ok(command) => command,
                Err(error) => return Ok(Frame::Malformed { line, error }),
            };

            return match &command {
                Command::UploadFile { size, .. } => {
                    let size = *size;
                    Ok(Frame::Transfer { command, size })
                }
                Command::DownloadFile { .. } => self.read_size_line(command).await,
                _ => Ok(Frame::Command(command)),
            };
        }
    }

    /// Drain exactly `size` payload bytes (or until EOF) into `sink`.
    ///
    /// A failing sink does not stop the drain: the remaining bytes are still
    /// consumed so the next command line is found where the peer put it.
    pub async fn read_payload<W>(&mut self, size: u64, sink: &mut W) -> io::Result<PayloadReceipt>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;
        let mut write_error = None;

        while received < size {
            let want = (size - received).min(CHUNK_SIZE as u64) as usize;
            let n = self.inner.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            received += n as u64;

            if write_error.is_none() {
                if let Err(e) = sink.write_all(&buf[..n]).await {
                    write_error = Some(e);
                }
            }
        }

        if write_error.is_none() {
            if let Err(e) = sink.flush().await {
                write_error = Some(e);
            }
        }

        Ok(PayloadReceipt {
            expected: size,
            received,
            write_error,
        })
    }

    async fn read_size_line(&mut self, command: Command) -> io::Result<Frame> {
        match self.read_line().await? {
            RawLine::Eof => Ok(Frame::Closed),
            RawLine::Invalid { line, error } => Ok(Frame::Malformed { line, error }),
            RawLine::Text(line) => match command::parse_size_line(&line) {
                Ok(size) => Ok(Frame::Transfer { command, size }),
                Err(error) => Ok(Frame::Malformed { line, error }),
            },
        }
    }

    async fn read_line(&mut self) -> io::Result<RawLine> {
        let mut buf = Vec::new();
        let read = (&mut self.inner)
            .take(MAX_LINE_LENGTH as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;

        if read == 0 {
            return Ok(RawLine::Eof);
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        } else if buf.len() > MAX_LINE_LENGTH {
            self.discard_rest_of_line().await?;
            buf.truncate(80);
            return Ok(RawLine::Invalid {
                line: String::from_utf8_lossy(&buf).into_owned(),
                error: CommandError::LineTooLong(MAX_LINE_LENGTH),
            });
        }
        // Anything else is a final line cut off by EOF; it is parsed as-is.

        match String::from_utf8(buf) {
            Ok(line) => Ok(RawLine::Text(line)),
            Err(e) => Ok(RawLine::Invalid {
                line: String::from_utf8_lossy(e.as_bytes()).into_owned(),
                error: CommandError::InvalidUtf8,
            }),
        }
    }

    async fn discard_rest_of_line(&mut self) -> io::Result<()> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                self.inner.consume(pos + 1);
                return Ok(());
            }
            let len = available.len();
            self.inner.consume(len);
        }
    }
}

/// Writes frames to the outbound half of a connection.
///
/// Each call writes one complete message and flushes it, so a single owner
/// of the writer can never interleave two messages.
pub struct CommandWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> CommandWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Send a command that has no payload.
    pub async fn send(&mut self, command: &Command) -> Result<(), CodecError> {
        if command.carries_payload() {
            return Err(CodecError::PayloadRequired(command.keyword()));
        }
        let line = command.encode()?;
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send a file transfer command followed by exactly `size` bytes from `source`.
    ///
    /// The size in an `UPLOAD_FILE` command is replaced by `size`. If `source`
    /// runs dry or fails early the rest is zero-filled so the declared size
    /// still holds.
    /// Returns the number of bytes taken from `source`.
    pub async fn send_payload<S>(
        &mut self,
        command: &Command,
        size: u64,
        source: &mut S,
    ) -> Result<u64, CodecError>
    where
        S: AsyncRead + Unpin,
    {
        let header = match command {
            Command::UploadFile { path, .. } => Command::UploadFile {
                path: path.clone(),
                size,
            }
            .encode()?,
            Command::DownloadFile { .. } => format!("{}{}\n", command.encode()?, size),
            other => return Err(CodecError::NoPayload(other.keyword())),
        };
        self.inner.write_all(header.as_bytes()).await?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        while sent < size {
            let want = (size - sent).min(CHUNK_SIZE as u64) as usize;
            let n = match source.read(&mut buf[..want]).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("{}: read failed mid-transfer: {}", command.path(), e);
                    break;
                }
            };
            self.inner.write_all(&buf[..n]).await?;
            sent += n as u64;
        }
        let from_source = sent;

        if sent < size {
            warn!(
                "{}: source ended after {} of {} bytes, zero-filling the rest",
                command.path(),
                from_source,
                size
            );
            buf.fill(0);
            while sent < size {
                let n = (size - sent).min(CHUNK_SIZE as u64) as usize;
                self.inner.write_all(&buf[..n]).await?;
                sent += n as u64;
            }
        }

        self.inner.flush().await?;
        debug!("Sent {} ({} bytes)", command.keyword(), size);
        Ok(from_source)
    }

    /// Send a file transfer command with the contents of `path`.
    ///
    /// The size is taken from the opened handle, not from whoever built the
    /// command. Returns the size that was declared on the wire. Failing to
    /// open the file is reported as [`CodecError::Source`] and leaves the
    /// stream untouched.
    pub async fn send_file(&mut self, command: &Command, path: &Path) -> Result<u64, CodecError> {
        let unreadable = |source| CodecError::Source {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::open(path).await.map_err(unreadable)?;
        let size = file.metadata().await.map_err(unreadable)?.len();
        self.send_payload(command, size, &mut file).await?;
        Ok(size)
    }
}
