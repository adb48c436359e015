use std::net::Ipv4Addr;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use sockfabric_transport::config::TransportConfig;
use sockfabric_transport::error::TransportError;
use sockfabric_transport::hello::{negotiate_version, ByteOrder, ConnectionType, HelloMessage};
use sockfabric_transport::identity::{EndpointId, IdentityResolver, ProcessId};

/// Result of a successful hello exchange, from the local side's point of view
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub peer: EndpointId,
    pub peer_process: ProcessId,
    pub peer_incarnation: u64,
    pub peer_ips: Vec<Ipv4Addr>,
    pub conn_type: ConnectionType,
    pub version: u32,
    pub byte_order: ByteOrder,
}

/// Initiating side: sends a hello, then reads and verifies the answer.
///
/// `recorded_incarnation` is the peer's incarnation from earlier connections. It is sent to the
///  peer, which rejects the connection if it restarted since. It is *not* compared with the
///  incarnation in the answer here, that is up to the caller.
pub async fn initiate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    identity: &dyn IdentityResolver,
    config: &TransportConfig,
    peer: EndpointId,
    recorded_incarnation: Option<u64>,
    conn_type: ConnectionType,
) -> Result<Handshake, TransportError> {
    let hello = HelloMessage::outbound(identity, config.protocol_version, peer, recorded_incarnation.unwrap_or(0), conn_type);
    write_hello(stream, &hello).await?;

    let (reply, byte_order) = read_hello(stream, config.max_interfaces).await?;
    trace!("received hello reply {:?}", reply);

    if peer != EndpointId::ANY && reply.src_endpoint != peer {
        return Err(TransportError::ProtocolError(format!("connected to {:?} but {:?} answered", peer, reply.src_endpoint)));
    }
    let version = negotiate_version(config.protocol_version, reply.version)?;
    reply.check_local_incarnation(identity.local_incarnation())?;
    if reply.conn_type != conn_type.invert() {
        return Err(TransportError::ProtocolError(format!("requested a {:?} connection, peer answered with {:?}", conn_type, reply.conn_type)));
    }

    Ok(Handshake {
        peer: reply.src_endpoint,
        peer_process: reply.src_process,
        peer_incarnation: reply.src_incarnation,
        peer_ips: reply.ips,
        conn_type,
        version,
        byte_order,
    })
}

/// Accepting side: reads a hello and answers it.
///
/// A peer that expects an earlier incarnation of the local endpoint gets an answer anyway so
///  that it learns about the restart, but the connection is rejected.
pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    identity: &dyn IdentityResolver,
    config: &TransportConfig,
) -> Result<Handshake, TransportError> {
    let (hello, byte_order) = read_hello(stream, config.max_interfaces).await?;
    trace!("received hello {:?}", hello);

    let local = identity.local_endpoint();
    if hello.dst_endpoint != local && hello.dst_endpoint != EndpointId::ANY {
        return Err(TransportError::ProtocolError(format!("hello is addressed to {:?}, this is {:?}", hello.dst_endpoint, local)));
    }
    let version = negotiate_version(config.protocol_version, hello.version)?;

    write_hello(stream, &hello.reply(identity, version)).await?;
    hello.check_local_incarnation(identity.local_incarnation())?;

    Ok(Handshake {
        peer: hello.src_endpoint,
        peer_process: hello.src_process,
        peer_incarnation: hello.src_incarnation,
        peer_ips: hello.ips,
        conn_type: hello.conn_type.invert(),
        version,
        byte_order,
    })
}

async fn write_hello<S: AsyncWrite + Unpin>(stream: &mut S, hello: &HelloMessage) -> Result<(), TransportError> {
    let mut buf = BytesMut::with_capacity(hello.serialized_len());
    hello.ser(&mut buf);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads the fixed part first, which tells how many addresses follow
async fn read_hello<S: AsyncRead + Unpin>(stream: &mut S, max_interfaces: u32) -> Result<(HelloMessage, ByteOrder), TransportError> {
    let mut buf = BytesMut::zeroed(HelloMessage::FIXED_LEN);
    stream.read_exact(&mut buf).await?;

    let ip_bytes = HelloMessage::peek_ip_bytes(&buf, max_interfaces)?;
    if ip_bytes > 0 {
        let mut ips = vec![0u8; ip_bytes];
        stream.read_exact(&mut ips).await?;
        buf.put_slice(&ips);
    }
    debug!("read hello of {} bytes", buf.len());

    HelloMessage::deser(&mut buf.freeze(), max_interfaces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use sockfabric_transport::hello::{PROTOCOL_V1, PROTOCOL_V2};
    use sockfabric_transport::identity::StaticIdentity;
    use tokio::io::duplex;
    use tokio::runtime::Builder;

    fn identity(id: u64, incarnation: u64) -> StaticIdentity {
        StaticIdentity::with_incarnation(EndpointId(id), ProcessId(id as u32 * 10), incarnation, vec![Ipv4Addr::new(10, 0, 0, id as u8)])
    }

    fn config(version: u32) -> TransportConfig {
        let mut config = TransportConfig::new();
        config.protocol_version = version;
        config
    }

    fn run<F: std::future::Future>(f: F) -> F::Output {
        Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
    }

    #[rstest]
    #[case::control(ConnectionType::Control, ConnectionType::Control)]
    #[case::bulk_out(ConnectionType::BulkOut, ConnectionType::BulkIn)]
    #[case::bulk_in(ConnectionType::BulkIn, ConnectionType::BulkOut)]
    #[case::any(ConnectionType::Any, ConnectionType::Any)]
    fn test_exchange(#[case] requested: ConnectionType, #[case] accepted: ConnectionType) {
        run(async {
            let (mut a, mut b) = duplex(1024);
            let ia = identity(1, 100);
            let ib = identity(2, 200);
            let ca = config(PROTOCOL_V2);
            let cb = config(PROTOCOL_V2);

            let (active, passive) = tokio::join!(
                initiate(&mut a, &ia, &ca, EndpointId(2), None, requested),
                accept(&mut b, &ib, &cb),
            );
            let active = active.unwrap();
            let passive = passive.unwrap();

            assert_eq!(active.peer, EndpointId(2));
            assert_eq!(active.peer_incarnation, 200);
            assert_eq!(active.conn_type, requested);
            assert!(active.peer_ips.is_empty());
            assert_eq!(passive.peer, EndpointId(1));
            assert_eq!(passive.peer_process, ProcessId(10));
            assert_eq!(passive.peer_incarnation, 100);
            assert_eq!(passive.peer_ips, vec![Ipv4Addr::new(10, 0, 0, 1)]);
            assert_eq!(passive.conn_type, accepted);
            assert_eq!(passive.byte_order, ByteOrder::Network);
        });
    }

    #[rstest]
    #[case::older_active(PROTOCOL_V1, PROTOCOL_V2)]
    #[case::older_passive(PROTOCOL_V2, PROTOCOL_V1)]
    #[case::newer_active(7, PROTOCOL_V2)]
    fn test_version_negotiated_down(#[case] active_version: u32, #[case] passive_version: u32) {
        run(async {
            let (mut a, mut b) = duplex(1024);
            let (ia, ib) = (identity(1, 100), identity(2, 200));
            let (ca, cb) = (config(active_version), config(passive_version));

            let (active, passive) = tokio::join!(
                initiate(&mut a, &ia, &ca, EndpointId(2), None, ConnectionType::Control),
                accept(&mut b, &ib, &cb),
            );
            let expected = active_version.min(passive_version);
            assert_eq!(active.unwrap().version, expected);
            assert_eq!(passive.unwrap().version, expected);
        });
    }

    #[test]
    fn test_bad_magic() {
        run(async {
            let (mut a, mut b) = duplex(1024);
            let ib = identity(2, 200);
            a.write_all(&[0xab; HelloMessage::FIXED_LEN]).await.unwrap();

            let result = accept(&mut b, &ib, &config(PROTOCOL_V2)).await;
            assert!(matches!(result, Err(TransportError::ProtocolMismatch(_))));
        });
    }

    #[test]
    fn test_too_many_addresses() {
        run(async {
            let (mut a, mut b) = duplex(4096);
            let ia = StaticIdentity::with_incarnation(EndpointId(1), ProcessId(1), 1, vec![Ipv4Addr::LOCALHOST; 17]);
            let hello = HelloMessage::outbound(&ia, PROTOCOL_V2, EndpointId(2), 0, ConnectionType::Control);
            write_hello(&mut a, &hello).await.unwrap();

            let result = accept(&mut b, &identity(2, 200), &config(PROTOCOL_V2)).await;
            assert!(matches!(result, Err(TransportError::ProtocolError(_))));
        });
    }

    #[test]
    fn test_passive_rejects_stale_view() {
        run(async {
            let (mut a, mut b) = duplex(1024);
            let (ia, ib) = (identity(1, 100), identity(2, 201));
            let (ca, cb) = (config(PROTOCOL_V2), config(PROTOCOL_V2));

            // the initiator still knows incarnation 200
            let (active, passive) = tokio::join!(
                initiate(&mut a, &ia, &ca, EndpointId(2), Some(200), ConnectionType::Control),
                accept(&mut b, &ib, &cb),
            );
            match passive {
                Err(TransportError::StaleConnection { recorded, reported, .. }) => {
                    assert_eq!(recorded, 201);
                    assert_eq!(reported, 200);
                }
                other => panic!("{:?}", other),
            }
            // the answer still tells the initiator about the new incarnation
            assert_eq!(active.unwrap().peer_incarnation, 201);
        });
    }

    #[test]
    fn test_destination() {
        run(async {
            let (ia, ib) = (identity(1, 100), identity(3, 300));
            let (ca, cb) = (config(PROTOCOL_V2), config(PROTOCOL_V2));

            let (mut a, mut b) = duplex(1024);
            let (active, passive) = tokio::join!(
                initiate(&mut a, &ia, &ca, EndpointId::ANY, None, ConnectionType::Control),
                accept(&mut b, &ib, &cb),
            );
            assert_eq!(active.unwrap().peer, EndpointId(3));
            assert_eq!(passive.unwrap().peer, EndpointId(1));

            let (mut a, mut b) = duplex(1024);
            let hello = HelloMessage::outbound(&ia, PROTOCOL_V2, EndpointId(2), 0, ConnectionType::Control);
            write_hello(&mut a, &hello).await.unwrap();
            let passive = accept(&mut b, &ib, &cb).await;
            assert!(matches!(passive, Err(TransportError::ProtocolError(_))));
        });
    }

    #[test]
    fn test_eof_during_hello() {
        run(async {
            let (mut a, mut b) = duplex(1024);
            a.write_all(&[0x53, 0x4f]).await.unwrap();
            drop(a);
            let result = accept(&mut b, &identity(2, 200), &config(PROTOCOL_V2)).await;
            assert!(matches!(result, Err(TransportError::TransportFailure(_))));
        });
    }
}
