use crate::steerer::SimId;

/// Errors raised by the application and steerer sides of a link.
#[derive(Debug, thiserror::Error)]
pub enum SteerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] regsteer_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] regsteer_frame::FrameError),

    /// Table, log or codec error.
    #[error("protocol error: {0}")]
    Proto(#[from] regsteer_proto::ProtoError),

    /// JSON configuration could not be parsed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error (configuration, persisted log).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration value is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The attach exchange did not go as expected.
    #[error("attach failed: {0}")]
    Attach(String),

    /// Waiting for a message timed out.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The operation needs a steerer and none is attached.
    #[error("no steerer attached")]
    NotAttached,

    /// The steerer holds no simulation with this id.
    #[error("unknown simulation {0}")]
    UnknownSim(SimId),

    /// The link to a simulation is unusable; it has been dropped.
    #[error("simulation {sim} dropped: {reason}")]
    Fatal { sim: SimId, reason: String },
}

impl SteerError {
    /// Whether this is the framing layer reporting a closed channel.
    pub fn is_eof(&self) -> bool {
        matches!(self, SteerError::Frame(regsteer_frame::FrameError::Eof))
    }
}

pub type Result<T> = std::result::Result<T, SteerError>;
