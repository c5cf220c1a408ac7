use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Migration discovery failed: unreadable directory, bad file name, duplicate version.
    #[error("registry error: {0}")]
    Registry(String),

    /// The database could not be reached, even after retrying.
    #[error("connection error: {0}")]
    Connection(String),

    /// A migration script failed. `applied` lists the versions committed
    /// earlier in the same run, which stay in place.
    #[error("migration {version} ({name}) failed: {reason}")]
    Execution {
        version: String,
        name: String,
        reason: String,
        applied: Vec<String>,
    },

    #[error("history error: {0}")]
    History(String),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether retrying the operation that produced this error could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Versions committed before the failing one, when this is an execution failure.
    pub fn applied_before_failure(&self) -> &[String] {
        match self {
            Self::Execution { applied, .. } => applied,
            _ => &[],
        }
    }
}
