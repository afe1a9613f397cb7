use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};

/// The literal line that terminates every message on the wire.
pub const END_OF_MSG: &str = "#END_OF_MSG#";

/// Default maximum payload size: 1 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Returns true if `line` is the end-of-message sentinel.
///
/// Trailing `\n` and `\r` are ignored so that CRLF peers interoperate.
pub fn is_sentinel_line(line: &str) -> bool {
    line.trim_end_matches(['\n', '\r']) == END_OF_MSG
}

/// Check that `payload` can be framed without ambiguity.
pub fn validate_payload(payload: &str) -> Result<()> {
    match payload.split('\n').position(is_sentinel_line) {
        Some(index) => Err(FrameError::SentinelInPayload { line: index + 1 }),
        None => Ok(()),
    }
}

/// Encode a message into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────────────┬──────┬──────────────┬──────┐
/// │ payload (any text)   │ "\n" │ END_OF_MSG   │ "\n" │
/// └──────────────────────┴──────┴──────────────┴──────┘
/// ```
/// The newline before the sentinel is always written, so the reader can strip
/// exactly one and hand back the payload byte-for-byte.
pub fn encode_message(payload: &str, dst: &mut BytesMut) -> Result<()> {
    validate_payload(payload)?;
    dst.reserve(payload.len() + END_OF_MSG.len() + 2);
    dst.put_slice(payload.as_bytes());
    dst.put_u8(b'\n');
    dst.put_slice(END_OF_MSG.as_bytes());
    dst.put_u8(b'\n');
    Ok(())
}

/// Configuration for message framing.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 1 MiB.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
