use std::net::Ipv4Addr;
use bytes::{Buf, BufMut};
use tracing::debug;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::identity::{EndpointId, IdentityResolver, ProcessId};

pub const HELLO_MAGIC: u32 = 0x534f_434b;

/// Framing without checksums or zero-copy acknowledgement
pub const PROTOCOL_V1: u32 = 1;
/// Adds message checksums and zero-copy acknowledgement cookies
pub const PROTOCOL_V2: u32 = 2;

/// Byte order a peer uses on the wire, detected from the hello magic. Everything this side sends
///  is in network byte order, but it can read what a peer with the opposite order sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Network,
    Swapped,
}

impl ByteOrder {
    pub(crate) fn get_u32(self, buf: &mut impl Buf) -> Result<u32, TransportError> {
        let result = match self {
            ByteOrder::Network => buf.try_get_u32(),
            ByteOrder::Swapped => buf.try_get_u32_le(),
        };
        result.map_err(|e| TransportError::ProtocolError(format!("truncated: {}", e)))
    }

    pub(crate) fn get_u64(self, buf: &mut impl Buf) -> Result<u64, TransportError> {
        let result = match self {
            ByteOrder::Network => buf.try_get_u64(),
            ByteOrder::Swapped => buf.try_get_u64_le(),
        };
        result.map_err(|e| TransportError::ProtocolError(format!("truncated: {}", e)))
    }

    fn from_magic(magic: u32) -> Result<ByteOrder, TransportError> {
        if magic == HELLO_MAGIC {
            Ok(ByteOrder::Network)
        }
        else if magic == HELLO_MAGIC.swap_bytes() {
            Ok(ByteOrder::Swapped)
        }
        else {
            Err(TransportError::ProtocolMismatch(format!("unrecognized hello magic {:#010x}", magic)))
        }
    }
}

/// The kind of traffic a connection carries. A pair of endpoints holds at most one connection
///  of each type at a time, so control traffic is not stuck behind bulk transfers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    None,
    Any,
    Control,
    BulkIn,
    BulkOut,
}

impl ConnectionType {
    pub const LIVE: [ConnectionType; 4] = [ConnectionType::Any, ConnectionType::Control, ConnectionType::BulkIn, ConnectionType::BulkOut];

    pub fn to_wire(self) -> u32 {
        match self {
            ConnectionType::None => u32::MAX,
            ConnectionType::Any => 0,
            ConnectionType::Control => 1,
            ConnectionType::BulkIn => 2,
            ConnectionType::BulkOut => 3,
        }
    }

    pub fn from_wire(raw: u32) -> Result<ConnectionType, TransportError> {
        match raw {
            u32::MAX => Ok(ConnectionType::None),
            0 => Ok(ConnectionType::Any),
            1 => Ok(ConnectionType::Control),
            2 => Ok(ConnectionType::BulkIn),
            3 => Ok(ConnectionType::BulkOut),
            _ => Err(TransportError::ProtocolError(format!("unknown connection type {}", raw))),
        }
    }

    /// The type of a connection as seen from the other end: bulk input on one side is bulk output
    ///  on the other.
    pub fn invert(self) -> ConnectionType {
        match self {
            ConnectionType::BulkIn => ConnectionType::BulkOut,
            ConnectionType::BulkOut => ConnectionType::BulkIn,
            other => other,
        }
    }

    /// Position in a per-peer table of connections, `None` for the invalid type
    pub fn slot(self) -> Option<usize> {
        match self {
            ConnectionType::None => None,
            ConnectionType::Any => Some(0),
            ConnectionType::Control => Some(1),
            ConnectionType::BulkIn => Some(2),
            ConnectionType::BulkOut => Some(3),
        }
    }
}

pub fn negotiate_version(local: u32, remote: u32) -> Result<u32, TransportError> {
    let version = local.min(remote);
    if version < PROTOCOL_V1 {
        return Err(TransportError::ProtocolMismatch(format!("unsupported protocol version {}", remote)));
    }
    Ok(version)
}

/// Wire layout, all numbers in network byte order:
///
/// ```ascii
///  0: magic (u32)
///  4: protocol version (u32)
///  8: sender endpoint id (u64)
/// 16: receiver endpoint id (u64)
/// 24: sender process id (u32)
/// 28: receiver process id (u32)
/// 32: sender incarnation (u64)
/// 40: sender's last known incarnation of the receiver, 0 if unknown (u64)
/// 48: connection type (u32)
/// 52: number of IP addresses (u32)
/// 56: IPv4 addresses (u32 each)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelloMessage {
    pub version: u32,
    pub src_endpoint: EndpointId,
    pub dst_endpoint: EndpointId,
    pub src_process: ProcessId,
    pub dst_process: ProcessId,
    pub src_incarnation: u64,
    pub dst_incarnation: u64,
    pub conn_type: ConnectionType,
    pub ips: Vec<Ipv4Addr>,
}

impl HelloMessage {
    pub const FIXED_LEN: usize = 56;
    const IP_COUNT_OFFSET: usize = 52;

    /// Hello sent by the side that initiates a connection. `dst_incarnation` is the incarnation
    ///  recorded for the peer, or 0 if there is none.
    pub fn outbound(
        identity: &dyn IdentityResolver,
        version: u32,
        dst_endpoint: EndpointId,
        dst_incarnation: u64,
        conn_type: ConnectionType,
    ) -> HelloMessage {
        HelloMessage {
            version,
            src_endpoint: identity.local_endpoint(),
            dst_endpoint,
            src_process: identity.local_process(),
            dst_process: ProcessId(0),
            src_incarnation: identity.local_incarnation(),
            dst_incarnation,
            conn_type,
            ips: identity.local_ips(),
        }
    }

    /// The accepting side's answer to a hello: it echoes the initiator's identity and inverts
    ///  the connection type.
    pub fn reply(&self, identity: &dyn IdentityResolver, version: u32) -> HelloMessage {
        HelloMessage {
            version,
            src_endpoint: identity.local_endpoint(),
            dst_endpoint: self.src_endpoint,
            src_process: identity.local_process(),
            dst_process: self.src_process,
            src_incarnation: identity.local_incarnation(),
            dst_incarnation: self.src_incarnation,
            conn_type: self.conn_type.invert(),
            ips: Vec::new(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::FIXED_LEN + 4*self.ips.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(HELLO_MAGIC);
        buf.put_u32(self.version);
        buf.put_u64(self.src_endpoint.0);
        buf.put_u64(self.dst_endpoint.0);
        buf.put_u32(self.src_process.0);
        buf.put_u32(self.dst_process.0);
        buf.put_u64(self.src_incarnation);
        buf.put_u64(self.dst_incarnation);
        buf.put_u32(self.conn_type.to_wire());
        buf.put_u32(self.ips.len() as u32);
        for ip in &self.ips {
            buf.put_u32(u32::from(*ip));
        }
    }

    /// Checks magic and address count in the fixed part of a hello, returning the number of
    ///  address bytes that follow it.
    pub fn peek_ip_bytes(fixed: &[u8], max_interfaces: u32) -> Result<usize, TransportError> {
        if fixed.len() < Self::FIXED_LEN {
            return Err(TransportError::ProtocolError(format!("hello is truncated: {} bytes", fixed.len())));
        }
        let mut magic_buf = &fixed[..4];
        let order = ByteOrder::from_magic(magic_buf.get_u32())?;

        let mut count_buf = &fixed[Self::IP_COUNT_OFFSET..];
        let num_ips = order.get_u32(&mut count_buf)?;
        Self::check_ip_count(num_ips, max_interfaces)?;
        Ok(4 * num_ips as usize)
    }

    fn check_ip_count(num_ips: u32, max_interfaces: u32) -> Result<(), TransportError> {
        if num_ips > max_interfaces {
            return Err(TransportError::ProtocolError(format!("hello announces {} IP addresses, maximum is {}", num_ips, max_interfaces)));
        }
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf, max_interfaces: u32) -> Result<(HelloMessage, ByteOrder), TransportError> {
        let magic = ByteOrder::Network.get_u32(buf)?;
        let order = ByteOrder::from_magic(magic)?;

        let version = order.get_u32(buf)?;
        if version < PROTOCOL_V1 {
            return Err(TransportError::ProtocolMismatch(format!("unsupported protocol version {}", version)));
        }

        let src_endpoint = EndpointId(order.get_u64(buf)?);
        let dst_endpoint = EndpointId(order.get_u64(buf)?);
        let src_process = ProcessId(order.get_u32(buf)?);
        let dst_process = ProcessId(order.get_u32(buf)?);
        let src_incarnation = order.get_u64(buf)?;
        let dst_incarnation = order.get_u64(buf)?;

        let conn_type = ConnectionType::from_wire(order.get_u32(buf)?)?;
        if conn_type == ConnectionType::None {
            return Err(TransportError::ProtocolError("hello without connection type".to_string()));
        }

        let num_ips = order.get_u32(buf)?;
        Self::check_ip_count(num_ips, max_interfaces)?;
        let mut ips = Vec::with_capacity(num_ips as usize);
        for _ in 0..num_ips {
            ips.push(Ipv4Addr::from(order.get_u32(buf)?));
        }

        if order == ByteOrder::Swapped {
            debug!("peer {:?} uses swapped byte order", src_endpoint);
        }

        Ok((HelloMessage {
            version,
            src_endpoint,
            dst_endpoint,
            src_process,
            dst_process,
            src_incarnation,
            dst_incarnation,
            conn_type,
            ips,
        }, order))
    }

    /// A peer that expects a different incarnation of the local endpoint holds state from before
    ///  a local restart
    pub fn check_local_incarnation(&self, local_incarnation: u64) -> Result<(), TransportError> {
        if self.dst_incarnation != 0 && self.dst_incarnation != local_incarnation {
            return Err(TransportError::StaleConnection {
                peer: self.src_endpoint,
                recorded: local_incarnation,
                reported: self.dst_incarnation,
            });
        }
        Ok(())
    }
}

/// Feature set of a connection, fixed once the handshake completes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub version: u32,
    pub byte_order: ByteOrder,
    pub checksum: bool,
    pub zero_copy: bool,
}

impl Capabilities {
    pub fn negotiate(
        version: u32,
        byte_order: ByteOrder,
        socket_zero_copy: bool,
        config: &TransportConfig,
    ) -> Capabilities {
        let v2 = version >= PROTOCOL_V2;
        Capabilities {
            version,
            byte_order,
            checksum: v2,
            zero_copy: v2 && socket_zero_copy && config.zc_min_frag > 0,
        }
    }
}
