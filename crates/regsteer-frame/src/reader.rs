use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use regsteer_transport::IpcStream;
use tracing::{debug, warn};

use crate::codec::{is_sentinel_line, FrameConfig, END_OF_MSG};
use crate::error::{from_transport, FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Why the message currently being accumulated will be rejected at its sentinel.
#[derive(Debug, Clone, Copy)]
enum Damage {
    Oversized { size: usize },
    InvalidUtf8,
}

/// Reads sentinel-terminated messages from any `Read` stream.
///
/// Partial reads are handled internally. State survives `WouldBlock`, so a
/// non-blocking stream can be polled at the caller's own cadence with
/// [`FrameReader::poll_message`] and the message resumes where it left off.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
    pending: String,
    damage: Option<Damage>,
    skipping_line: bool,
    dropped_line_bytes: usize,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
            pending: String::new(),
            damage: None,
            skipping_line: false,
            dropped_line_bytes: 0,
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// Returns the payload exactly as it was passed to the writer. Errors:
    /// - `Eof` when the stream ends before a sentinel (including a clean close
    ///   between messages),
    /// - `Truncated` when the message outgrew `max_payload_size`; the rest of
    ///   it has been consumed so the next call starts on a fresh message,
    /// - `InvalidUtf8` for a message containing non-UTF-8 bytes, likewise
    ///   consumed to its sentinel,
    /// - `Io` for lower-level failures. A would-block error leaves any
    ///   partially read message buffered for the next call.
    pub fn read_message(&mut self) -> Result<String> {
        loop {
            let line = match self.read_line() {
                Ok(Some(line)) => line,
                Ok(None) => {
                    let partial = !self.pending.is_empty() || self.damage.is_some();
                    self.reset_message();
                    debug!(partial, "steering channel closed");
                    return Err(FrameError::Eof);
                }
                Err(FrameError::InvalidUtf8) => {
                    self.damage.get_or_insert(Damage::InvalidUtf8);
                    continue;
                }
                Err(err) => return Err(err),
            };

            if self.dropped_line_bytes > 0 {
                let dropped = std::mem::take(&mut self.dropped_line_bytes);
                self.mark_oversized(dropped);
            }

            if is_sentinel_line(&line) {
                return self.finish_message();
            }

            match self.damage {
                Some(Damage::Oversized { size }) => {
                    self.damage = Some(Damage::Oversized {
                        size: size + line.len(),
                    });
                }
                Some(Damage::InvalidUtf8) => {}
                None => {
                    // Accumulated text carries one trailing newline that is not payload.
                    if self.pending.len() + line.len() > self.config.max_payload_size + 1 {
                        let size = self.pending.len() + line.len();
                        self.pending.clear();
                        self.mark_oversized(size);
                    } else {
                        self.pending.push_str(&line);
                    }
                }
            }
        }
    }

    /// Read the next message if one can be completed without blocking.
    ///
    /// Returns `Ok(None)` when the stream reports `WouldBlock` or `TimedOut`.
    /// Only useful on a stream in non-blocking mode or with a read timeout;
    /// on a plain blocking stream this behaves like `read_message`.
    pub fn poll_message(&mut self) -> Result<Option<String>> {
        match self.read_message() {
            Ok(message) => Ok(Some(message)),
            Err(err) if err.is_retryable() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Read one raw line, including its trailing newline.
    ///
    /// Returns `Ok(None)` at end of stream. A final unterminated line is
    /// returned as-is. Lines longer than the payload limit are dropped; the
    /// enclosing message is then reported as `Truncated` by `read_message`.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let raw = self.buf.split_to(pos + 1);
                if self.skipping_line {
                    self.skipping_line = false;
                    self.dropped_line_bytes += raw.len();
                    continue;
                }
                return String::from_utf8(raw.to_vec())
                    .map(Some)
                    .map_err(|_| FrameError::InvalidUtf8);
            }

            if self.buf.len() > self.max_line_len() {
                warn!(
                    buffered = self.buf.len(),
                    max = self.config.max_payload_size,
                    "dropping oversized line"
                );
                self.dropped_line_bytes += self.buf.len();
                self.skipping_line = true;
                self.buf.clear();
            }

            if self.fill_buf()? == 0 {
                if self.skipping_line || self.buf.is_empty() {
                    self.skipping_line = false;
                    self.buf.clear();
                    return Ok(None);
                }
                let raw = self.buf.split();
                return String::from_utf8(raw.to_vec())
                    .map(Some)
                    .map_err(|_| FrameError::InvalidUtf8);
            }
        }
    }

    /// Bytes received but not yet returned as lines.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent messages.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    fn fill_buf(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    fn max_line_len(&self) -> usize {
        self.config
            .max_payload_size
            .max(END_OF_MSG.len())
            .saturating_add(2)
    }

    fn mark_oversized(&mut self, extra: usize) {
        let size = match self.damage {
            Some(Damage::Oversized { size }) => size + extra,
            _ => self.pending.len() + extra,
        };
        self.pending.clear();
        self.damage = Some(Damage::Oversized { size });
    }

    fn finish_message(&mut self) -> Result<String> {
        let damage = self.damage.take();
        let mut payload = std::mem::take(&mut self.pending);
        match damage {
            Some(Damage::Oversized { size }) => {
                warn!(
                    size,
                    max = self.config.max_payload_size,
                    "discarded oversized message"
                );
                Err(FrameError::Truncated {
                    size,
                    max: self.config.max_payload_size,
                })
            }
            Some(Damage::InvalidUtf8) => Err(FrameError::InvalidUtf8),
            None => {
                if payload.ends_with('\n') {
                    payload.pop();
                }
                Ok(payload)
            }
        }
    }

    fn reset_message(&mut self) {
        self.pending.clear();
        self.damage = None;
        self.dropped_line_bytes = 0;
    }
}

impl FrameReader<IpcStream> {
    /// Create a frame reader for `IpcStream` and apply read timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(from_transport)?;
        Ok(Self::with_config(inner, config))
    }
}
