use serde_derive::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Result returning Error
pub type Result<T> = std::result::Result<T, Error>;

/// sqlconn errors. All except Internal are considered user-facing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The backend aborted the transaction because of a conflicting concurrent transaction.
    Abort,
    /// An aborted transaction could not be retried: the replay diverged or the budget ran out.
    AbortedCannotRetry(String),
    /// A DDL batch failed after `applied` statements had been applied.
    BatchPartialFailure { applied: usize, message: String },
    /// A DML batch failed; `counts` holds the row counts of the statements before the failure.
    BatchUpdate { counts: Vec<u64>, message: String },
    Closed,
    Config(String),
    DuplicateSavepoint(String),
    Internal(String),
    InvalidBatchState(String),
    InvalidState(String),
    Parse(String),
    ReadOnly,
    Timeout,
    Value(String),
}

impl Error {
    /// Returns true if this is the backend's abort signal, which the retry engine may recover.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Abort)
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Abort => write!(f, "Transaction aborted by a concurrent transaction"),
            Error::AbortedCannotRetry(s) => {
                write!(f, "Transaction aborted and could not be retried: {}", s)
            }
            Error::BatchPartialFailure { applied, message } => write!(
                f,
                "DDL batch failed after {} applied statements: {}",
                applied, message
            ),
            Error::BatchUpdate { counts, message } => write!(
                f,
                "DML batch failed after {} statements: {}",
                counts.len(),
                message
            ),
            Error::Closed => write!(f, "Connection is closed"),
            Error::DuplicateSavepoint(name) => write!(f, "Savepoint {} already exists", name),
            Error::InvalidBatchState(s) => write!(f, "Invalid batch state: {}", s),
            Error::InvalidState(s) => write!(f, "Invalid state: {}", s),
            Error::ReadOnly => write!(f, "Read-only transaction"),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Config(s) | Error::Internal(s) | Error::Parse(s) | Error::Value(s) => {
                write!(f, "{}", s)
            }
        }
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<rustyline::error::ReadlineError> for Error {
    fn from(err: rustyline::error::ReadlineError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::Config(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::Internal(err.to_string())
    }
}
