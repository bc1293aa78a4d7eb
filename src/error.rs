use thiserror::Error;

/// What went wrong, as a value callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A deadline elapsed before the operation completed
    Timeout,
    /// A handshake payload or signaling frame had the wrong shape
    InvalidData,
    /// A transport, socket, or request failed to reach the other side
    Connection,
    /// A value could not be encoded for the wire
    Serialize,
    /// Wire data could not be decoded back into a value
    Deserialize,
    /// The requested lobby does not exist (or no public lobby does)
    LobbyNotFound,
    /// The service already has a lobby under that name
    LobbyAlreadyExists,
}

/// Tagged error returned by every fallible operation in the crate.
///
/// Errors are plain data: they cross component boundaries as `Err` values,
/// never as panics.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A deadline elapsed. The granted wait is recorded in the message.
    pub fn timeout(message: impl Into<String>, wait: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("{} (time given: {}ms)", message.into(), wait.as_millis()),
        )
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidData, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn serialize(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialize, message)
    }

    pub fn deserialize(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Deserialize, message)
    }

    pub fn lobby_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LobbyNotFound, message)
    }

    pub fn lobby_already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LobbyAlreadyExists, message)
    }
}

/// Render a value for an error message without letting a huge payload
/// blow up the error itself.
pub(crate) fn display_value(value: &str) -> String {
    const LIMIT: usize = 48;
    if value.len() <= LIMIT {
        value.to_string()
    } else {
        format!("[{} bytes of data]", value.len())
    }
}
