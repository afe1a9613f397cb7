//! Duplex byte channels for steering links.
//!
//! The steering core only needs something it can read lines from and write
//! bytes to. This crate provides the concrete channels the rest of the
//! workspace plugs in:
//! - Unix domain sockets (listener on the application side, connector on the
//!   steering client side)
//! - A spawned helper process whose stdin/stdout form the two halves of the
//!   channel
//!
//! Everything above this layer is generic over `Read`/`Write`, so any other
//! medium (a file pair, an in-memory pipe) works without changes here.

pub mod error;
#[cfg(unix)]
pub mod proxy;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
#[cfg(unix)]
pub use proxy::{set_fd_nonblocking, ProxyProcess, PROXY_QUIT};
pub use traits::IpcStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
