use crate::handle::Handle;

/// Errors raised by the steering tables, activity log and message codec.
///
/// Table and log errors leave the structure they were raised on unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// A parameter (or other uniquely-labelled entry) with this label exists.
    #[error("duplicate label '{0}'")]
    DuplicateLabel(String),

    /// No live entry carries this handle.
    #[error("no entry for handle {0}")]
    NotFound(Handle),

    /// No activity-log entry carries this key.
    #[error("no log entry with key {0}")]
    UnknownLogKey(u64),

    /// A caller-supplied value was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Growing a table or log failed.
    #[error("capacity exhausted growing to {0} slots")]
    Capacity(usize),

    /// The message text does not follow the tag grammar.
    #[error("malformed message at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    /// The message body names a kind this codec does not know.
    #[error("unexpected message kind '{0}'")]
    UnexpectedKind(String),

    /// Reading or writing a persisted log failed.
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted log record is not valid JSON.
    #[error("log record error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtoError {
    pub(crate) fn malformed(line: usize, reason: impl Into<String>) -> Self {
        ProtoError::Malformed {
            line,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;
