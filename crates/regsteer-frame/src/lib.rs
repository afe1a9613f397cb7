//! Sentinel-terminated line framing for steering messages.
//!
//! A message is any text payload followed by a newline and a fixed sentinel
//! line:
//! ```text
//! <payload line 1>
//! <payload line 2>
//! #END_OF_MSG#
//! ```
//! There is no length prefix; the reader accumulates lines until it sees the
//! sentinel. The price is that no payload line may itself equal the sentinel,
//! which the writer enforces.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    encode_message, is_sentinel_line, validate_payload, FrameConfig, DEFAULT_MAX_PAYLOAD,
    END_OF_MSG,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
