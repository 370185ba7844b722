//! Error handling and stable error codes for the IPAM engine

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid prefix: {0}")]
    InvalidPrefix(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    /// A structural invariant of the prefix tree does not hold. Never expected
    /// at runtime; the surrounding transaction is rolled back.
    #[error("Tree invariant violated: {0}")]
    Invariant(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    InvalidPrefix = 1,
    NotFound = 2,
    Validation = 3,
    Invariant = 4,
    Lock = 5,
    Persistence = 6,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::InvalidPrefix => "Invalid prefix",
            ErrorCode::NotFound => "Not found",
            ErrorCode::Validation => "Validation conflict",
            ErrorCode::Invariant => "Structural invariant violation",
            ErrorCode::Lock => "Lock failure",
            ErrorCode::Persistence => "Persistence failure",
        }
    }
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidPrefix(_) => ErrorCode::InvalidPrefix,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Validation(_) => ErrorCode::Validation,
            Error::Invariant(_) => ErrorCode::Invariant,
            Error::Lock(_) => ErrorCode::Lock,
            Error::Persistence(_) => ErrorCode::Persistence,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}
