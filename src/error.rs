use std::fmt::Display;

#[derive(Debug)]
pub enum Error {
    /// Caller-facing input problem: bad service type, label, port or TXT
    /// data. Surfaced synchronously before anything touches the network.
    Validation(String),
    /// A socket could not be bound or configured.
    Bind(std::io::Error),
    /// A bound socket failed at runtime; the owning interface shut down.
    Interface(String),
    /// A one-shot operation ran out of time.
    Timeout,
    /// The actor behind an operation went away before completing it.
    Stopped,
}

impl Error {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(message) => write!(f, "invalid input: {message}"),
            Self::Bind(error) => write!(f, "unable to bind socket: {error}"),
            Self::Interface(message) => write!(f, "network interface failed: {message}"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Stopped => write!(f, "operation was stopped"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind(error) => Some(error),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Bind(value)
    }
}
