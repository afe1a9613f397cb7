//! Computational steering for running simulations.
//!
//! A simulation registers the parameters it exposes and calls a
//! non-blocking control hook once per step; a steering client attaches over
//! a local socket (or a helper process's pipes), watches the values and
//! sends edits and commands back.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix domain sockets and helper-process channels
//! - [`frame`]: Sentinel-terminated message framing
//! - [`proto`]: Handle tables, activity log, messages and their codec
//! - [`session`]: Application and steerer sides of a link

/// Re-export transport types.
pub mod transport {
    pub use regsteer_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use regsteer_frame::*;
}

/// Re-export protocol types.
pub mod proto {
    pub use regsteer_proto::*;
}

/// Re-export session types.
pub mod session {
    pub use regsteer_session::*;
}

pub use regsteer_session::{AppSession, SteerConfig, SteerError, Steerer};
