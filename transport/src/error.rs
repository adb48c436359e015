use std::io;
use thiserror::Error;

use crate::identity::EndpointId;

/// Failure taxonomy of the socket transport.
///
/// `WouldBlock` and `Shutdown` are not failures of the connection: the former defers work to the
///  next readiness event, the latter tells callers that the connection is going away and retrying
///  on it is pointless.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("stale connection to {peer:?}: recorded incarnation {recorded:#x}, reported {reported:#x}")]
    StaleConnection {
        peer: EndpointId,
        recorded: u64,
        reported: u64,
    },

    #[error("checksum mismatch: expected {expected:#010x}, calculated {actual:#010x}")]
    CorruptionDetected {
        expected: u32,
        actual: u32,
    },

    #[error("operation would block")]
    WouldBlock,

    #[error("connection is shutting down")]
    Shutdown,

    #[error("transport failure: {0}")]
    TransportFailure(io::Error),
}

impl TransportError {
    /// `WouldBlock` and `Shutdown` leave a connection as it is. Any other error that reaches the
    ///  readiness dispatcher tears the connection down. `CorruptionDetected` only gets there if
    ///  the message handler decided to close the connection.
    pub fn ends_connection(&self) -> bool {
        !matches!(self, TransportError::WouldBlock | TransportError::Shutdown)
    }

    pub(crate) fn eof() -> TransportError {
        TransportError::TransportFailure(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"))
    }
}

impl From<io::Error> for TransportError {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::WouldBlock => TransportError::WouldBlock,
            _ => TransportError::TransportFailure(value),
        }
    }
}
