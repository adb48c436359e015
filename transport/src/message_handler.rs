#[cfg(test)] use mockall::automock;

use crate::connection::ConnectionInfo;
use crate::error::TransportError;
use crate::message_header::{MessagePayload, RoutedHeader};

/// What to do with a connection after a message failed checksum verification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptionAction {
    /// discard the message and continue with the next one
    Drop,
    Close,
}

/// Upward interface of the transport. Callbacks run inside readiness processing and must not
///  block.
#[cfg_attr(test, automock)]
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, conn: &ConnectionInfo, header: RoutedHeader, payload: MessagePayload);

    /// Called with a [TransportError::CorruptionDetected] instead of delivering the message
    fn on_corruption(&self, conn: &ConnectionInfo, error: &TransportError) -> CorruptionAction;

    /// Called once after the connection was detached from its socket
    fn on_closed(&self, conn: &ConnectionInfo, reason: &TransportError);
}
