use crate::frame::EncodeError;
use crate::payload::Exhausted;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors that end the server loop or fail its construction.
///
/// Everything that only affects one connection is recovered inside the
/// connection and never surfaces here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Payload memory ran out under a policy that asks for a restart.
    #[error("resource exhaustion: {0}")]
    Exhausted(#[from] Exhausted),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Why an upgrade request was refused. The connection is dropped without a
/// response in every case.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("timed out waiting for the upgrade request")]
    Timeout,

    #[error("peer closed the connection before the upgrade request completed")]
    Closed,

    #[error("upgrade request exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Sec-WebSocket-Key header is missing")]
    MissingKey,

    #[error("Sec-WebSocket-Key must be 24 bytes, got {0}")]
    InvalidKey(usize),

    #[error("IO error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for HandshakeError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => HandshakeError::Timeout,
            io::ErrorKind::UnexpectedEof => HandshakeError::Closed,
            _ => HandshakeError::Io(err),
        }
    }
}

/// Failure of a server-initiated write through the live connection.
#[derive(Debug, Error)]
pub enum SendError {
    /// No connection is open. Callers outside the receive loop should treat
    /// this as a no-op.
    #[error("no websocket connection is open")]
    NotConnected,

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SendError {
    pub fn is_not_connected(&self) -> bool {
        matches!(self, SendError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_errors_map_to_handshake_kinds() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "receive timed out");
        assert!(matches!(HandshakeError::from(timeout), HandshakeError::Timeout));

        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(matches!(HandshakeError::from(eof), HandshakeError::Closed));

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(matches!(HandshakeError::from(reset), HandshakeError::Io(_)));
    }

    #[test]
    fn display_includes_cause() {
        let err = Error::from(HandshakeError::InvalidKey(7));
        assert_eq!(
            err.to_string(),
            "handshake error: Sec-WebSocket-Key must be 24 bytes, got 7"
        );
    }
}
