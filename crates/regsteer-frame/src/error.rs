use regsteer_transport::TransportError;

/// Errors that can occur while framing or unframing messages.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// An incoming message grew past the configured maximum. The rest of it
    /// was consumed up to its sentinel and discarded.
    #[error("message truncated ({size} bytes, max {max})")]
    Truncated { size: usize, max: usize },

    /// An outgoing payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An outgoing payload contains a line equal to the end-of-message sentinel.
    #[error("payload line {line} collides with the end-of-message sentinel")]
    SentinelInPayload { line: usize },

    /// The peer is not draining the stream and the outbound queue is full.
    #[error("outbound backlog full ({pending} bytes queued, max {max})")]
    Backlog { pending: usize, max: usize },

    /// An incoming line is not valid UTF-8.
    #[error("message contains invalid UTF-8")]
    InvalidUtf8,

    /// The channel closed before a complete message was received.
    #[error("channel closed before end of message")]
    Eof,

    /// An I/O error occurred while reading or writing.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether this is a would-block/timed-out read that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FrameError::Io(err) if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )
        )
    }
}

pub(crate) fn from_transport(err: TransportError) -> FrameError {
    match err {
        TransportError::Io(io) | TransportError::Accept(io) => FrameError::Io(io),
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Spawn { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
