use std::fmt;
use std::io;

use regsteer_frame::FrameError;
use regsteer_proto::ProtoError;
use regsteer_session::SteerError;
use regsteer_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
/// The simulation stopped or detached while the command was running.
pub const SIM_FINISHED: i32 = 10;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::Eof => CliError::new(FAILURE, format!("{context}: {err}")),
        FrameError::Backlog { .. } => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn steer_error(context: &str, err: SteerError) -> CliError {
    match err {
        SteerError::Transport(err) => transport_error(context, err),
        SteerError::Frame(err) => frame_error(context, err),
        SteerError::Io(err) => io_error(context, err),
        SteerError::Proto(ProtoError::NotFound(_) | ProtoError::InvalidArgument(_)) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        SteerError::Proto(_) | SteerError::Json(_) | SteerError::Attach(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        SteerError::Config(_) => CliError::new(USAGE, format!("{context}: {err}")),
        SteerError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        SteerError::Fatal { .. } => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn timeouts_map_to_timeout_code() {
        let err = steer_error("attach", SteerError::Timeout(Duration::from_secs(1)));
        assert_eq!(err.code, TIMEOUT);
        assert!(err.message.starts_with("attach: "));
    }

    #[test]
    fn missing_socket_is_failure() {
        let err = steer_error(
            "connect",
            SteerError::Transport(TransportError::Connect {
                path: "/nonexistent.sock".into(),
                source: io::Error::from(io::ErrorKind::NotFound),
            }),
        );
        assert_eq!(err.code, FAILURE);
    }

    #[test]
    fn bad_edit_is_usage_error() {
        let err = steer_error(
            "set",
            SteerError::Proto(ProtoError::InvalidArgument("not steerable".into())),
        );
        assert_eq!(err.code, USAGE);
    }
}
