use std::sync::Arc;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use sockfabric_transport::config::TransportConfig;
use sockfabric_transport::connection::{Connection, ConnectionInfo};
use sockfabric_transport::error::TransportError;
use sockfabric_transport::hello::ConnectionType;
use sockfabric_transport::identity::EndpointId;

/// The connection type a message of `payload_len` bytes should go over
pub fn select_type(payload_len: usize, config: &TransportConfig) -> ConnectionType {
    if !config.typed_connections {
        ConnectionType::Any
    }
    else if payload_len < config.min_bulk {
        ConnectionType::Control
    }
    else {
        ConnectionType::BulkOut
    }
}

#[derive(Default)]
struct Peer {
    incarnation: Option<u64>,
    conns: [Option<Arc<Connection>>; 4],
}

impl Peer {
    fn live(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.conns.iter()
            .flatten()
            .filter(|c| !c.is_closing())
    }
}

/// Connections per peer, at most one of each connection type, together with the incarnation
///  of the peer they were established with
#[derive(Default)]
pub struct PeerTable {
    peers: FxHashMap<EndpointId, Peer>,
}

impl PeerTable {
    pub fn new() -> PeerTable {
        Default::default()
    }

    pub fn incarnation(&self, peer: EndpointId) -> Option<u64> {
        self.peers.get(&peer)?.incarnation
    }

    /// A peer reporting an incarnation other than the recorded one has restarted since
    pub fn check_incarnation(&self, peer: EndpointId, reported: u64) -> Result<(), TransportError> {
        match self.incarnation(peer) {
            Some(recorded) if recorded != reported => Err(TransportError::StaleConnection {
                peer,
                recorded,
                reported,
            }),
            _ => Ok(()),
        }
    }

    /// Records the incarnation of a peer that restarted, returning the connections to its
    ///  previous incarnation. They are removed from the table and must be torn down.
    pub fn restart(&mut self, peer: EndpointId, incarnation: u64) -> Vec<Arc<Connection>> {
        let entry = self.peers.entry(peer).or_default();
        info!("peer {:?} restarted: incarnation {:?} -> {:#x}", peer, entry.incarnation, incarnation);
        entry.incarnation = Some(incarnation);
        entry.conns.iter_mut()
            .filter_map(|c| c.take())
            .collect()
    }

    /// Adds a connection, returning the connection it replaces (if any)
    pub fn insert(&mut self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let info = conn.info();
        let slot = info.conn_type.slot()?;
        let entry = self.peers.entry(info.peer).or_default();
        if entry.incarnation.is_none() {
            entry.incarnation = Some(info.peer_incarnation);
        }
        debug!("adding {:?} connection to {:?}", info.conn_type, info.peer);
        entry.conns[slot].replace(conn)
    }

    /// Removes the connection described by `info` if it is still in the table. The peer's
    ///  incarnation stays recorded.
    pub fn remove(&mut self, info: &ConnectionInfo) -> bool {
        let slot = match (self.peers.get_mut(&info.peer), info.conn_type.slot()) {
            (Some(entry), Some(slot)) => &mut entry.conns[slot],
            _ => return false,
        };
        let is_current = matches!(slot, Some(conn) if conn.info().socket == info.socket);
        if is_current {
            *slot = None;
        }
        is_current
    }

    /// The connection to send a message of `payload_len` bytes over: preferably one of the
    ///  selected type, otherwise any live connection to the peer
    pub fn select(&self, peer: EndpointId, payload_len: usize, config: &TransportConfig) -> Option<Arc<Connection>> {
        self.select_type(peer, select_type(payload_len, config))
    }

    pub fn select_type(&self, peer: EndpointId, conn_type: ConnectionType) -> Option<Arc<Connection>> {
        let entry = self.peers.get(&peer)?;
        let preferred = conn_type.slot()
            .and_then(|slot| entry.conns[slot].as_ref())
            .filter(|c| !c.is_closing());
        preferred
            .or_else(|| entry.live().next())
            .cloned()
    }

    /// The connection of exactly `conn_type`, even if it is closing
    pub fn get(&self, peer: EndpointId, conn_type: ConnectionType) -> Option<Arc<Connection>> {
        let slot = conn_type.slot()?;
        self.peers.get(&peer)?.conns[slot].clone()
    }

    pub fn live(&self, peer: EndpointId) -> Vec<Arc<Connection>> {
        match self.peers.get(&peer) {
            Some(entry) => entry.live().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn connections(&self, peer: EndpointId) -> Vec<ConnectionInfo> {
        match self.peers.get(&peer) {
            Some(entry) => entry.conns.iter().flatten().map(|c| c.info().clone()).collect(),
            None => Vec::new(),
        }
    }

    pub fn num_connections(&self) -> usize {
        self.peers.values()
            .map(|p| p.conns.iter().flatten().count())
            .sum()
    }

    /// Removes the peer with all its connections
    pub fn remove_peer(&mut self, peer: EndpointId) -> Vec<Arc<Connection>> {
        match self.peers.remove(&peer) {
            Some(entry) => entry.conns.into_iter().flatten().collect(),
            None => Vec::new(),
        }
    }

    pub fn drain(&mut self) -> Vec<Arc<Connection>> {
        self.peers.drain()
            .flat_map(|(_, entry)| entry.conns.into_iter().flatten())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_connection;
    use rstest::rstest;

    fn config(typed: bool) -> TransportConfig {
        let mut config = TransportConfig::new();
        config.typed_connections = typed;
        config.min_bulk = 1000;
        config
    }

    #[rstest]
    #[case::untyped_small(false, 10, ConnectionType::Any)]
    #[case::untyped_big(false, 100_000, ConnectionType::Any)]
    #[case::typed_small(true, 999, ConnectionType::Control)]
    #[case::typed_min_bulk(true, 1000, ConnectionType::BulkOut)]
    #[case::typed_big(true, 100_000, ConnectionType::BulkOut)]
    fn test_select_type(#[case] typed: bool, #[case] payload_len: usize, #[case] expected: ConnectionType) {
        assert_eq!(select_type(payload_len, &config(typed)), expected);
    }

    #[rstest]
    #[case::unknown(6, 776, true)]
    #[case::same(5, 777, true)]
    #[case::restarted(5, 778, false)]
    fn test_check_incarnation(#[case] peer: u64, #[case] reported: u64, #[case] ok: bool) {
        let mut table = PeerTable::new();
        table.insert(test_connection(EndpointId(5), 777, ConnectionType::Control));

        match table.check_incarnation(EndpointId(peer), reported) {
            Ok(()) => assert!(ok),
            Err(TransportError::StaleConnection { peer, recorded, reported: r }) => {
                assert!(!ok);
                assert_eq!(peer, EndpointId(5));
                assert_eq!(recorded, 777);
                assert_eq!(r, reported);
            }
            Err(e) => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn test_select() {
        let mut table = PeerTable::new();
        let peer = EndpointId(5);
        let config = config(true);
        assert!(table.select(peer, 10, &config).is_none());

        let bulk = test_connection(peer, 1, ConnectionType::BulkOut);
        table.insert(bulk.clone());
        // no control connection: falls back to the bulk connection
        assert!(Arc::ptr_eq(&table.select(peer, 10, &config).unwrap(), &bulk));

        let control = test_connection(peer, 1, ConnectionType::Control);
        table.insert(control.clone());
        assert!(Arc::ptr_eq(&table.select(peer, 10, &config).unwrap(), &control));
        assert!(Arc::ptr_eq(&table.select(peer, 5000, &config).unwrap(), &bulk));
        assert!(table.select(EndpointId(6), 10, &config).is_none());
    }

    #[test]
    fn test_get_and_live() {
        let mut table = PeerTable::new();
        let peer = EndpointId(5);
        assert!(table.live(peer).is_empty());

        let bulk = test_connection(peer, 1, ConnectionType::BulkOut);
        let control = test_connection(peer, 1, ConnectionType::Control);
        table.insert(bulk.clone());
        table.insert(control.clone());
        table.insert(test_connection(EndpointId(6), 1, ConnectionType::Control));

        // no fallback to other connection types
        assert!(Arc::ptr_eq(&table.get(peer, ConnectionType::BulkOut).unwrap(), &bulk));
        assert!(table.get(peer, ConnectionType::BulkIn).is_none());
        assert!(table.get(peer, ConnectionType::None).is_none());

        let live = table.live(peer);
        assert_eq!(live.len(), 2);
        assert!(live.iter().any(|c| Arc::ptr_eq(c, &control)));
    }

    #[test]
    fn test_insert_replaces_same_type() {
        let mut table = PeerTable::new();
        let first = test_connection(EndpointId(5), 1, ConnectionType::Control);
        let second = test_connection(EndpointId(5), 1, ConnectionType::Control);

        assert!(table.insert(first.clone()).is_none());
        assert!(Arc::ptr_eq(&table.insert(second.clone()).unwrap(), &first));
        assert_eq!(table.num_connections(), 1);

        // the replaced connection's teardown does not remove its successor
        assert!(!table.remove(first.info()));
        assert_eq!(table.connections(EndpointId(5)), vec![second.info().clone()]);
        assert!(table.remove(second.info()));
        assert_eq!(table.num_connections(), 0);
        assert_eq!(table.incarnation(EndpointId(5)), Some(1));
    }

    #[test]
    fn test_restart() {
        let mut table = PeerTable::new();
        let peer = EndpointId(5);
        table.insert(test_connection(peer, 1, ConnectionType::Control));
        table.insert(test_connection(peer, 1, ConnectionType::BulkIn));
        table.insert(test_connection(EndpointId(6), 3, ConnectionType::Control));
        assert_eq!(table.incarnation(peer), Some(1));

        let stale = table.restart(peer, 2);
        assert_eq!(stale.len(), 2);
        assert_eq!(table.incarnation(peer), Some(2));
        assert!(table.connections(peer).is_empty());
        assert_eq!(table.num_connections(), 1);

        assert_eq!(table.restart(EndpointId(7), 9).len(), 0);
        assert_eq!(table.incarnation(EndpointId(7)), Some(9));
    }

    #[test]
    fn test_remove_peer_and_drain() {
        let mut table = PeerTable::new();
        table.insert(test_connection(EndpointId(5), 1, ConnectionType::Control));
        table.insert(test_connection(EndpointId(5), 1, ConnectionType::BulkOut));
        table.insert(test_connection(EndpointId(6), 1, ConnectionType::Any));

        assert_eq!(table.remove_peer(EndpointId(5)).len(), 2);
        assert_eq!(table.incarnation(EndpointId(5)), None);
        assert_eq!(table.drain().len(), 1);
        assert_eq!(table.num_connections(), 0);
    }
}
