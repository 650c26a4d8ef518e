//! Wallet provider errors
use std::fmt;

/// Alias of `Result` objects that return [`Error`]
///
/// [`Error`]: self::Error
pub type Result<T> = std::result::Result<T, Error>;

/// Different variants of possible errors
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ErrorKind {
    /// Malformed or missing request parameters
    ValidationError,
    /// Origin has no permission grant
    UnauthorizedError,
    /// Request was rejected by the user (explicitly or implicitly)
    UserRejectedError,
    /// Request-id pool exhausted
    LimitExceededError,
    /// Signing refused or impossible in the custody component
    CustodyError,
    /// Unexpected internal failure
    InternalError,
    /// Serialization error
    SerializationError,
    /// Deserialization error
    DeserializationError,
    /// Error in the underlying duplex channel
    TransportError,
    /// Initialization error
    InitializationError,
}

impl ErrorKind {
    /// Returns the machine readable code transmitted in response frames
    pub fn wire_code(self) -> i64 {
        match self {
            ErrorKind::ValidationError => -32602,
            ErrorKind::UnauthorizedError => 4100,
            ErrorKind::UserRejectedError => 4001,
            ErrorKind::LimitExceededError => -32005,
            ErrorKind::CustodyError => -32000,
            ErrorKind::InternalError => -32603,
            ErrorKind::SerializationError => -32008,
            ErrorKind::DeserializationError => -32700,
            ErrorKind::TransportError => -32300,
            ErrorKind::InitializationError => -32002,
        }
    }

    /// Maps a wire code back to an error kind (unknown codes become internal errors)
    pub fn from_wire_code(code: i64) -> Self {
        match code {
            -32602 => ErrorKind::ValidationError,
            4100 => ErrorKind::UnauthorizedError,
            4001 => ErrorKind::UserRejectedError,
            -32005 => ErrorKind::LimitExceededError,
            -32000 => ErrorKind::CustodyError,
            -32008 => ErrorKind::SerializationError,
            -32700 => ErrorKind::DeserializationError,
            -32300 => ErrorKind::TransportError,
            -32002 => ErrorKind::InitializationError,
            _ => ErrorKind::InternalError,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            ErrorKind::ValidationError => "Validation error",
            ErrorKind::UnauthorizedError => "Unauthorized",
            ErrorKind::UserRejectedError => "User rejected",
            ErrorKind::LimitExceededError => "Limit exceeded",
            ErrorKind::CustodyError => "Custody error",
            ErrorKind::InternalError => "Internal error",
            ErrorKind::SerializationError => "Serialization error",
            ErrorKind::DeserializationError => "Deserialization error",
            ErrorKind::TransportError => "Transport error",
            ErrorKind::InitializationError => "Initialization error",
        };
        write!(f, "{}", message)
    }
}

/// An error with a kind, a human readable message and an optional source
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Creates a new instance of error with given kind and message
    pub fn new<M: Into<String>>(kind: ErrorKind, message: M) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new instance of error with given kind, message and source
    pub fn new_with_source<M: Into<String>>(
        kind: ErrorKind,
        message: M,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    /// Returns [`ErrorKind`] of current error
    ///
    /// [`ErrorKind`]: self::ErrorKind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the human readable message of current error
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Renders the source chain of current error, one frame per line
    pub fn source_trace(&self) -> Option<String> {
        let mut frames = Vec::new();
        let mut source = self.source.as_deref().map(|s| s as &dyn std::error::Error);

        while let Some(error) = source {
            frames.push(error.to_string());
            source = error.source();
        }

        if frames.is_empty() {
            None
        } else {
            Some(frames.join("\ncaused by: "))
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, "")
    }
}

/// Adds `chain` and `err_kind` adapters for converting foreign errors into [`Error`]
pub trait ResultExt<T> {
    /// Wraps the error value (if any) with given kind and message
    fn chain<F, M>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> (ErrorKind, M),
        M: Into<String>;

    /// Replaces the error value (if any) with given kind and lazily built message
    fn err_kind<F, M>(self, kind: ErrorKind, message: F) -> Result<T>
    where
        F: FnOnce() -> M,
        M: Into<String>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn chain<F, M>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> (ErrorKind, M),
        M: Into<String>,
    {
        self.map_err(|err| {
            let (kind, message) = context();
            Error::new_with_source(kind, message, Box::new(err))
        })
    }

    fn err_kind<F, M>(self, kind: ErrorKind, message: F) -> Result<T>
    where
        F: FnOnce() -> M,
        M: Into<String>,
    {
        self.map_err(|_| Error::new(kind, message()))
    }
}
