use std::fmt;
use std::io;

use thiserror::Error;

/// Broad category of an [`Exception`], mirroring how event-loop runtimes
/// classify failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// Something went wrong. The default.
    Failed,

    /// The operation could not complete due to lack of resources.
    Overloaded,

    /// The other end of a channel went away, or a producer was dropped
    /// without delivering a value.
    Disconnected,

    /// The operation is not implemented.
    Unimplemented,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => write!(f, "failed"),
            Self::Overloaded => write!(f, "overloaded"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Unimplemented => write!(f, "unimplemented"),
        }
    }
}

/// The failure value carried by a [`Promise`](crate::Promise), and returned
/// from fallible [`BoxFuture`](crate::BoxFuture) polls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {description}")]
pub struct Exception {
    kind: ExceptionKind,
    description: String,
}

impl Exception {
    pub fn new(kind: ExceptionKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self::new(ExceptionKind::Failed, description)
    }

    pub fn disconnected(description: impl Into<String>) -> Self {
        Self::new(ExceptionKind::Disconnected, description)
    }

    pub fn kind(&self) -> ExceptionKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl From<io::Error> for Exception {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected => ExceptionKind::Disconnected,
            io::ErrorKind::Unsupported => ExceptionKind::Unimplemented,
            io::ErrorKind::OutOfMemory => ExceptionKind::Overloaded,
            _ => ExceptionKind::Failed,
        };

        Self::new(kind, err.to_string())
    }
}

pub type Result<T, E = Exception> = std::result::Result<T, E>;
