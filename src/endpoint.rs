use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument, trace, warn, Instrument, Span};

use sockfabric_transport::buffers::page_pool::PagePool;
use sockfabric_transport::config::TransportConfig;
use sockfabric_transport::connection::{Connection, ConnectionInfo};
use sockfabric_transport::dispatcher::{ReadinessDispatcher, ReadinessTarget};
use sockfabric_transport::driver::drive;
use sockfabric_transport::error::TransportError;
use sockfabric_transport::hello::{Capabilities, ConnectionType};
use sockfabric_transport::identity::{EndpointId, IdentityResolver};
use sockfabric_transport::message_handler::{CorruptionAction, MessageHandler};
use sockfabric_transport::message_header::{MessagePayload, RoutedHeader};
use sockfabric_transport::socket::{ConnTunables, SocketId, TransportSocket};
use sockfabric_transport::sockopt::setup_socket;
use sockfabric_transport::tcp_socket::TcpTransportSocket;
use sockfabric_transport::tx::OutboundUnit;

use crate::handshake;
use crate::handshake::Handshake;
use crate::peer::PeerTable;

/// A local endpoint of the messaging fabric: accepts connections from peers, establishes
///  connections to them, and sends messages over the connection matching each message.
pub struct SocketEndpoint {
    listener: TcpListener,
    config: Arc<TransportConfig>,
    identity: Arc<dyn IdentityResolver>,
    handler: Arc<dyn MessageHandler>,
    dispatcher: Arc<ReadinessDispatcher>,
    peers: Arc<Mutex<PeerTable>>,
    page_pool: Arc<PagePool>,
}

impl SocketEndpoint {
    pub async fn bind(
        addr: SocketAddr,
        config: TransportConfig,
        identity: Arc<dyn IdentityResolver>,
        handler: Arc<dyn MessageHandler>,
    ) -> anyhow::Result<Arc<SocketEndpoint>> {
        config.validate()?;
        let config = Arc::new(config);
        let peers = Arc::new(Mutex::new(PeerTable::new()));
        let handler = Arc::new(PeerTrackingHandler {
            peers: Arc::downgrade(&peers),
            inner: handler,
        });

        let listener = TcpListener::bind(addr).await?;
        info!("{:?} listening on {:?}", identity.local_endpoint(), listener.local_addr()?);

        Ok(Arc::new(SocketEndpoint {
            listener,
            dispatcher: Arc::new(ReadinessDispatcher::new(config.clone())),
            page_pool: Arc::new(PagePool::new(config.page_pool_size)),
            config,
            identity,
            handler,
            peers,
        }))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub async fn accept_loop(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;

            let endpoint = self.clone();
            tokio::spawn(async move {
                if let Err(e) = endpoint.handle_connection_request(addr, stream).await {
                    warn!("rejected connection from {}: {}", addr, e);
                }
            });
        }
    }

    #[instrument(name="accepted_connection", skip_all, fields(addr = format!("{:?}", _addr)))]
    async fn handle_connection_request(&self, _addr: SocketAddr, mut stream: TcpStream) -> anyhow::Result<Arc<Connection>> {
        debug!("received connection request");
        setup_socket(&stream, &self.config)?;
        let handshake = handshake::accept(&mut stream, self.identity.as_ref(), &self.config)
            .instrument(Span::current())
            .await?;
        debug!("hello exchange complete");

        // a restarted peer replaces everything it had before
        if let Err(e) = self.check_incarnation(&handshake) {
            info!("{}: accepting connection from new incarnation", e);
        }
        Ok(self.establish(stream, handshake)?)
    }

    /// Establishes a connection of type `conn_type` to `peer`. If the peer turns out to have
    ///  restarted since the last connection to it, the connections to its previous incarnation
    ///  are torn down and this fails with [TransportError::StaleConnection]. A retry then
    ///  connects to the new incarnation.
    pub async fn connect(&self, peer: EndpointId, addr: SocketAddr, conn_type: ConnectionType) -> anyhow::Result<Arc<Connection>> {
        debug!("connecting to {:?} at {} ({:?})", peer, addr, conn_type);
        let mut stream = TcpStream::connect(addr).await?;
        setup_socket(&stream, &self.config)?;

        let recorded = self.peers.lock().incarnation(peer);
        let handshake = handshake::initiate(&mut stream, self.identity.as_ref(), &self.config, peer, recorded, conn_type).await?;
        self.check_incarnation(&handshake)?;
        Ok(self.establish(stream, handshake)?)
    }

    /// Sends a unit to `peer`, over a connection of the given type or, if there is no type, over
    ///  the connection matching the unit's payload size
    pub fn send(&self, peer: EndpointId, conn_type: Option<ConnectionType>, unit: OutboundUnit) -> Result<(), TransportError> {
        let conn = {
            let peers = self.peers.lock();
            match conn_type {
                Some(conn_type) => peers.select_type(peer, conn_type),
                None => peers.select(peer, unit.payload_len(), &self.config),
            }
        };

        match conn {
            Some(conn) => {
                trace!("sending {:?} to {:?} via {:?}", unit, peer, conn.info().conn_type);
                self.dispatcher.enqueue(&conn, unit)
            }
            None => {
                debug!("no connection to {:?}", peer);
                unit.complete(Err(not_connected(peer)));
                Err(not_connected(peer))
            }
        }
    }

    /// Flushes whatever the kernel holds back on all live connections to `peer`
    pub fn push(&self, peer: EndpointId) -> Result<(), TransportError> {
        let conns = self.peers.lock().live(peer);
        if conns.is_empty() {
            return Err(not_connected(peer));
        }
        for conn in conns {
            trace!("pushing {:?} connection to {:?}", conn.info().conn_type, peer);
            conn.push()?;
        }
        Ok(())
    }

    /// Buffer sizes and Nagle setting the kernel actually applied to the connection of
    ///  `conn_type` to `peer`
    pub fn tunables(&self, peer: EndpointId, conn_type: ConnectionType) -> Result<ConnTunables, TransportError> {
        let conn = self.peers.lock().get(peer, conn_type);
        match conn {
            Some(conn) => conn.tunables(),
            None => Err(not_connected(peer)),
        }
    }

    pub fn connections(&self, peer: EndpointId) -> Vec<ConnectionInfo> {
        self.peers.lock().connections(peer)
    }

    pub fn num_connections(&self) -> usize {
        self.peers.lock().num_connections()
    }

    /// Closes all connections to `peer` and forgets its incarnation
    pub fn close_peer(&self, peer: EndpointId) {
        let conns = self.peers.lock().remove_peer(peer);
        info!("closing {} connection(s) to {:?}", conns.len(), peer);
        for conn in conns {
            self.dispatcher.terminate(&conn, TransportError::Shutdown);
        }
    }

    pub fn shutdown(&self) {
        let conns = self.peers.lock().drain();
        info!("shutting down {:?} with {} connection(s)", self.identity.local_endpoint(), conns.len());
        for conn in conns {
            self.dispatcher.terminate(&conn, TransportError::Shutdown);
        }
    }

    /// Tears down connections to an earlier incarnation of the handshake's peer, returning
    ///  [TransportError::StaleConnection] if there were any
    fn check_incarnation(&self, handshake: &Handshake) -> Result<(), TransportError> {
        let stale = {
            let mut peers = self.peers.lock();
            match peers.check_incarnation(handshake.peer, handshake.peer_incarnation) {
                Ok(()) => return Ok(()),
                Err(e) => (e, peers.restart(handshake.peer, handshake.peer_incarnation)),
            }
        };

        let (error, conns) = stale;
        if let TransportError::StaleConnection { peer, recorded, reported } = &error {
            for conn in conns {
                let reason = TransportError::StaleConnection { peer: *peer, recorded: *recorded, reported: *reported };
                self.dispatcher.terminate(&conn, reason);
            }
        }
        Err(error)
    }

    fn establish(&self, stream: TcpStream, handshake: Handshake) -> anyhow::Result<Arc<Connection>> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let socket = Arc::new(TcpTransportSocket::new(stream));
        let caps = Capabilities::negotiate(handshake.version, handshake.byte_order, socket.zero_copy_capable(), &self.config);
        let info = ConnectionInfo {
            peer: handshake.peer,
            peer_process: handshake.peer_process,
            peer_incarnation: handshake.peer_incarnation,
            conn_type: handshake.conn_type,
            socket: socket.id(),
            peer_addr,
            local_addr,
            peer_ips: handshake.peer_ips,
        };
        let conn = Connection::new(info, caps, socket.clone(), self.config.clone(), self.handler.clone(), self.page_pool.clone());

        self.dispatcher.register_socket(socket.id(), Arc::new(UnboundSocket));
        self.dispatcher.attach(&conn)?;

        let replaced = self.peers.lock().insert(conn.clone());
        if let Some(replaced) = replaced {
            debug!("new {:?} connection to {:?} replaces {:?}", handshake.conn_type, handshake.peer, replaced.info().socket);
            self.dispatcher.terminate(&replaced, TransportError::Shutdown);
        }

        tokio::spawn(drive(self.dispatcher.clone(), socket, conn.clone()));
        info!("connected to {:?} ({:?}, protocol version {}, checksums {}, zero-copy {})",
            handshake.peer, handshake.conn_type, caps.version, caps.checksum, caps.zero_copy);
        Ok(conn)
    }
}

fn not_connected(peer: EndpointId) -> TransportError {
    TransportError::TransportFailure(io::Error::new(io::ErrorKind::NotConnected, format!("no connection to {:?}", peer)))
}

/// Readiness target of a socket before its connection is attached and after it is torn down
struct UnboundSocket;

impl ReadinessTarget for UnboundSocket {
    fn on_readable(&self, socket: SocketId) {
        trace!("{:?} is readable without a connection", socket);
    }

    fn on_write_space(&self, socket: SocketId, available: usize) {
        trace!("{:?} has {} bytes of write space without a connection", socket, available);
    }
}

/// Keeps the peer table in sync with connections that are torn down by the transport
struct PeerTrackingHandler {
    peers: Weak<Mutex<PeerTable>>,
    inner: Arc<dyn MessageHandler>,
}

impl MessageHandler for PeerTrackingHandler {
    fn on_message(&self, conn: &ConnectionInfo, header: RoutedHeader, payload: MessagePayload) {
        self.inner.on_message(conn, header, payload)
    }

    fn on_corruption(&self, conn: &ConnectionInfo, error: &TransportError) -> CorruptionAction {
        self.inner.on_corruption(conn, error)
    }

    fn on_closed(&self, conn: &ConnectionInfo, reason: &TransportError) {
        if let Some(peers) = self.peers.upgrade() {
            if peers.lock().remove(conn) {
                debug!("removed {:?} connection to {:?}", conn.conn_type, conn.peer);
            }
        }
        self.inner.on_closed(conn, reason)
    }
}
