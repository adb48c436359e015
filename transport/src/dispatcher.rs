use std::sync::Arc;
#[cfg(test)] use mockall::automock;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::error::TransportError;
use crate::socket::SocketId;
use crate::tx::OutboundUnit;

/// Receives readiness notifications for a socket that is not bound to a connection, e.g. while
///  the handshake is in progress or after the connection was torn down
#[cfg_attr(test, automock)]
pub trait ReadinessTarget: Send + Sync + 'static {
    fn on_readable(&self, socket: SocketId);
    fn on_write_space(&self, socket: SocketId, available: usize);
}

enum SocketSlot {
    Unbound(Arc<dyn ReadinessTarget>),
    Bound(Arc<Connection>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteSpaceOutcome {
    /// the socket is not registered
    Unknown,
    /// passed on to the socket's original target
    Forwarded,
    /// less space than the configured watermark, nothing happened
    BelowWatermark,
    Transmitted,
}

/// Routes socket readiness events to connections.
///
/// The binding of sockets to connections is guarded by a single reader / writer lock. Event
///  routing takes it for reading, attaching and tearing down connections for writing. No
///  connection code runs while the lock is held: the routing functions clone the target out of
///  the table and call it after releasing the lock.
pub struct ReadinessDispatcher {
    config: Arc<TransportConfig>,
    sockets: RwLock<FxHashMap<SocketId, SocketSlot>>,
}

impl ReadinessDispatcher {
    pub fn new(config: Arc<TransportConfig>) -> ReadinessDispatcher {
        ReadinessDispatcher {
            config,
            sockets: Default::default(),
        }
    }

    pub fn register_socket(&self, socket: SocketId, target: Arc<dyn ReadinessTarget>) {
        trace!("registering {:?}", socket);
        self.sockets.write().insert(socket, SocketSlot::Unbound(target));
    }

    pub fn unregister_socket(&self, socket: SocketId) {
        if self.sockets.write().remove(&socket).is_some() {
            trace!("unregistered {:?}", socket);
        }
    }

    /// Binds a connection to its (registered) socket, saving the socket's original target for
    ///  restoring it on teardown
    pub fn attach(&self, conn: &Arc<Connection>) -> anyhow::Result<()> {
        let socket = conn.info().socket;
        let mut sockets = self.sockets.write();
        let target = match sockets.get(&socket) {
            Some(SocketSlot::Unbound(target)) => target.clone(),
            Some(SocketSlot::Bound(_)) => anyhow::bail!("{:?} is bound to a connection already", socket),
            None => anyhow::bail!("{:?} is not registered", socket),
        };
        conn.save_target(target);
        sockets.insert(socket, SocketSlot::Bound(conn.clone()));
        debug!("attached connection to {:?} ({:?}) to {:?}", conn.info().peer, conn.info().conn_type, socket);
        Ok(())
    }

    pub fn lookup(&self, socket: SocketId) -> Option<Arc<Connection>> {
        match self.sockets.read().get(&socket) {
            Some(SocketSlot::Bound(conn)) => Some(conn.clone()),
            _ => None,
        }
    }

    pub fn is_registered(&self, socket: SocketId) -> bool {
        self.sockets.read().contains_key(&socket)
    }

    pub fn data_ready(&self, socket: SocketId) {
        match self.slot(socket) {
            None => trace!("data ready on unknown {:?}", socket),
            Some(Routed::Target(target)) => target.on_readable(socket),
            Some(Routed::Conn(conn)) => {
                if let Err(e) = conn.on_readable() {
                    self.handle_error(&conn, e);
                }
            }
        }
    }

    /// Write space notification with `available` bytes of free send buffer. Below the
    ///  configured watermark this does nothing at all, so the out-of-space condition stays set
    ///  and the next notification re-evaluates it.
    pub fn write_space(&self, socket: SocketId, available: usize) -> WriteSpaceOutcome {
        let conn = match self.slot(socket) {
            None => return WriteSpaceOutcome::Unknown,
            Some(Routed::Target(target)) => {
                target.on_write_space(socket, available);
                return WriteSpaceOutcome::Forwarded;
            }
            Some(Routed::Conn(conn)) => conn,
        };

        if available < self.config.min_write_space {
            trace!("{} bytes of write space on {:?}: below watermark", available, socket);
            return WriteSpaceOutcome::BelowWatermark;
        }

        let result = conn.on_write_space();
        // cleared only now, so a send that fails before this point is retried
        conn.socket().clear_out_of_space();
        if let Err(e) = result {
            self.handle_error(&conn, e);
        }
        WriteSpaceOutcome::Transmitted
    }

    /// Queues a unit for transmission and starts sending it if the connection has write space
    pub fn enqueue(&self, conn: &Arc<Connection>, unit: OutboundUnit) -> Result<(), TransportError> {
        conn.queue_unit(unit)?;
        if let Err(e) = conn.schedule_tx() {
            self.handle_error(conn, e);
        }
        Ok(())
    }

    /// Unbinds the connection from its socket, restoring the socket's original target, and
    ///  fails everything that is still outstanding on it. Does nothing if the connection is
    ///  being torn down already.
    pub fn terminate(&self, conn: &Arc<Connection>, reason: TransportError) {
        {
            let mut sockets = self.sockets.write();
            if !conn.mark_closing() {
                return;
            }

            let socket = conn.info().socket;
            let is_bound_here = matches!(sockets.get(&socket), Some(SocketSlot::Bound(c)) if Arc::ptr_eq(c, conn));
            if is_bound_here {
                match conn.take_saved_target() {
                    Some(target) => {
                        sockets.insert(socket, SocketSlot::Unbound(target));
                    }
                    None => {
                        sockets.remove(&socket);
                    }
                }
            }
        }

        conn.detach(reason);
    }

    fn handle_error(&self, conn: &Arc<Connection>, error: TransportError) {
        if error.ends_connection() {
            warn!("terminating connection to {:?} ({:?}): {}", conn.info().peer, conn.info().conn_type, error);
            self.terminate(conn, error);
        }
        else {
            trace!("{} on {:?}", error, conn.info().socket);
        }
    }

    fn slot(&self, socket: SocketId) -> Option<Routed> {
        match self.sockets.read().get(&socket)? {
            SocketSlot::Unbound(target) => Some(Routed::Target(target.clone())),
            SocketSlot::Bound(conn) => Some(Routed::Conn(conn.clone())),
        }
    }
}

enum Routed {
    Target(Arc<dyn ReadinessTarget>),
    Conn(Arc<Connection>),
}
