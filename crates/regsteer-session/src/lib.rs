//! The two ends of a steering link.
//!
//! An application registers its parameters, I/O types and commands with an
//! [`AppSession`] and calls [`AppSession::steering_control`] once per step.
//! A [`Steerer`] attaches to one or more applications, mirrors their tables
//! and sends edits and commands back.

pub mod app;
pub mod config;
pub mod error;
pub mod link;
pub mod steerer;

pub use app::{AppSession, ControlOutcome, PauseOutcome, PauseState, RejectedEdit, LOG_FILE_NAME};
pub use config::{SteerConfig, ENV_MAX_MSG_SIZE, ENV_STEER_DIRECTORY};
pub use error::{Result, SteerError};
pub use link::Link;
pub use steerer::{SimId, SteerEvent, Steerer};
