use std::{error::Error, fmt::Display};

use crate::session::SessionError;

/// Errors raised by the terminal front end.
#[derive(Debug)]
pub enum ConsoleError {
    /// The terminal could not be drawn to or read from.
    IOError(std::io::Error),
    /// There are no serial ports to choose from.
    NoPorts,
    /// A session transition failed in a way the operator has to see.
    Session(SessionError),
}

impl Display for ConsoleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsoleError::IOError(e) => write!(f, "terminal error: {}", e),
            ConsoleError::NoPorts => write!(f, "no serial ports found"),
            ConsoleError::Session(e) => write!(f, "{}", e),
        }
    }
}

impl Error for ConsoleError {}

impl From<std::io::Error> for ConsoleError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<SessionError> for ConsoleError {
    fn from(value: SessionError) -> Self {
        Self::Session(value)
    }
}
