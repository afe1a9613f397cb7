use std::io::{ErrorKind, Write};

use bytes::{Buf, BytesMut};
use regsteer_transport::IpcStream;
use tracing::trace;

use crate::codec::{encode_message, FrameConfig};
use crate::error::{from_transport, FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
/// Default backlog limit, in maximum-size payloads.
const BACKLOG_PAYLOADS: usize = 16;

/// Writes complete sentinel-terminated messages to any `Write` stream.
///
/// Frames go through an outbound queue. [`FrameWriter::send`] drains it
/// before returning; [`FrameWriter::queue`] writes what the stream takes
/// right now and keeps the rest for [`FrameWriter::flush_pending`].
pub struct FrameWriter<T> {
    inner: T,
    pending: BytesMut,
    max_backlog: usize,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            pending: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            max_backlog: config.max_payload_size.saturating_mul(BACKLOG_PAYLOADS),
            config,
        }
    }

    /// Frame and send one message, draining anything queued before it.
    ///
    /// Either everything reaches the stream or an error is returned. A
    /// stream that would block (non-blocking mode, or a write timeout that
    /// expired) is an error here, and the queue may then end mid-frame.
    pub fn send(&mut self, payload: &str) -> Result<()> {
        self.enqueue(payload)?;
        self.write_pending(true)?;
        Ok(())
    }

    /// Frame one message and write as much of the queue as the stream
    /// accepts without blocking. Returns whether the queue is now empty.
    ///
    /// Fails with [`FrameError::Backlog`] instead of growing the queue past
    /// the backlog limit.
    pub fn queue(&mut self, payload: &str) -> Result<bool> {
        self.enqueue(payload)?;
        self.write_pending(false)
    }

    /// Write queued bytes without blocking. Returns whether the queue is empty.
    pub fn flush_pending(&mut self) -> Result<bool> {
        self.write_pending(false)
    }

    /// Bytes framed but not yet accepted by the stream.
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_inner(true).map(|_| ())
    }

    fn enqueue(&mut self, payload: &str) -> Result<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }
        let queued = self.pending.len();
        if queued > 0 && queued + payload.len() > self.max_backlog {
            return Err(FrameError::Backlog {
                pending: queued,
                max: self.max_backlog,
            });
        }
        let mut frame = BytesMut::with_capacity(payload.len() + 16);
        encode_message(payload, &mut frame)?;
        self.pending.extend_from_slice(&frame);
        Ok(())
    }

    fn write_pending(&mut self, blocking: bool) -> Result<bool> {
        let total = self.pending.len();
        let mut written = 0usize;
        while !self.pending.is_empty() {
            match self.inner.write(&self.pending) {
                Ok(0) => {
                    return Err(FrameError::Io(std::io::Error::new(
                        ErrorKind::WriteZero,
                        format!("wrote {written} of {total} bytes"),
                    )))
                }
                Ok(n) => {
                    self.pending.advance(n);
                    written += n;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock && !blocking => {
                    trace!(written, queued = self.pending.len(), "stream full, keeping rest");
                    return Ok(false);
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        if written > 0 {
            trace!(bytes = written, "sent steering messages");
        }
        self.flush_inner(blocking)
    }

    fn flush_inner(&mut self, blocking: bool) -> Result<bool> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(true),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock && !blocking => return Ok(false),
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent messages.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Most bytes [`FrameWriter::queue`] will hold back before failing.
    pub fn set_max_backlog(&mut self, max_backlog: usize) {
        self.max_backlog = max_backlog;
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<IpcStream> {
    /// Create a frame writer for `IpcStream` and apply write timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(from_transport)?;
        Ok(Self::with_config(inner, config))
    }
}
