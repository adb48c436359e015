use std::io;
use std::io::{IoSlice, IoSliceMut};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use parking_lot::Mutex;

use sockfabric_transport::buffers::page::Page;
use sockfabric_transport::buffers::page_pool::PagePool;
use sockfabric_transport::config::TransportConfig;
use sockfabric_transport::connection::{Connection, ConnectionInfo};
use sockfabric_transport::error::TransportError;
use sockfabric_transport::hello::{ByteOrder, Capabilities, ConnectionType, PROTOCOL_V2};
use sockfabric_transport::identity::{EndpointId, ProcessId};
use sockfabric_transport::message_handler::{CorruptionAction, MessageHandler};
use sockfabric_transport::message_header::{MessagePayload, RoutedHeader};
use sockfabric_transport::socket::{ConnTunables, SocketId, TransportSocket};

/// A socket that never has data or buffer space
struct IdleSocket {
    id: SocketId,
}

impl TransportSocket for IdleSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn send_vectored(&self, _bufs: &[IoSlice<'_>], _more: bool) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn send_page(&self, _page: &Page, _offset: usize, _len: usize, _more: bool) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn recv_vectored(&self, _bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn zero_copy_capable(&self) -> bool {
        false
    }

    fn is_out_of_space(&self) -> bool {
        true
    }

    fn clear_out_of_space(&self) {}

    fn eager_ack(&self) {}

    fn push(&self) -> io::Result<()> {
        Ok(())
    }

    fn tunables(&self) -> io::Result<ConnTunables> {
        Ok(ConnTunables::default())
    }

    fn shutdown(&self) {}
}

struct IgnoringHandler;

impl MessageHandler for IgnoringHandler {
    fn on_message(&self, _conn: &ConnectionInfo, _header: RoutedHeader, _payload: MessagePayload) {}

    fn on_corruption(&self, _conn: &ConnectionInfo, _error: &TransportError) -> CorruptionAction {
        CorruptionAction::Drop
    }

    fn on_closed(&self, _conn: &ConnectionInfo, _reason: &TransportError) {}
}

pub fn test_connection(peer: EndpointId, peer_incarnation: u64, conn_type: ConnectionType) -> Arc<Connection> {
    let config = TransportConfig::new();
    let socket = Arc::new(IdleSocket { id: SocketId::next() });
    let info = ConnectionInfo {
        peer,
        peer_process: ProcessId(1),
        peer_incarnation,
        conn_type,
        socket: socket.id,
        peer_addr: SocketAddr::from(([127, 0, 0, 1], 988)),
        local_addr: SocketAddr::from(([127, 0, 0, 1], 1023)),
        peer_ips: vec![Ipv4Addr::LOCALHOST],
    };
    let caps = Capabilities::negotiate(PROTOCOL_V2, ByteOrder::Network, false, &config);
    Connection::new(info, caps, socket, Arc::new(config), Arc::new(IgnoringHandler), Arc::new(PagePool::new(1)))
}

/// Records received messages as (connection type, message type, payload)
#[derive(Default)]
pub struct RecordingHandler {
    messages: Mutex<Vec<(ConnectionType, u32, Vec<u8>)>>,
    closed: Mutex<Vec<ConnectionInfo>>,
}

impl RecordingHandler {
    pub fn messages(&self) -> Vec<(ConnectionType, u32, Vec<u8>)> {
        self.messages.lock().clone()
    }

    pub fn num_closed(&self) -> usize {
        self.closed.lock().len()
    }
}

impl MessageHandler for RecordingHandler {
    fn on_message(&self, conn: &ConnectionInfo, header: RoutedHeader, payload: MessagePayload) {
        self.messages.lock().push((conn.conn_type, header.msg_type, payload.to_vec()));
    }

    fn on_corruption(&self, _conn: &ConnectionInfo, _error: &TransportError) -> CorruptionAction {
        CorruptionAction::Close
    }

    fn on_closed(&self, conn: &ConnectionInfo, _reason: &TransportError) {
        self.closed.lock().push(conn.clone());
    }
}
