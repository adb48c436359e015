use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use anyhow::bail;

use crate::hello::{PROTOCOL_V1, PROTOCOL_V2};

pub struct TransportConfig {
    /// Protocol version advertised in the hello message. The version used on a connection is the
    ///  minimum of both sides' advertised versions.
    pub protocol_version: u32,

    /// Use separate connections for control and bulk traffic. Without this, a single connection
    ///  of type `Any` carries everything.
    pub typed_connections: bool,

    /// With typed connections, messages with at least this many payload bytes go over bulk
    ///  connections, smaller ones over the control connection.
    pub min_bulk: usize,

    /// Page fragments of at least this size are sent zero-copy (if the peer acknowledges
    ///  zero-copy transfers at all). Zero disables zero-copy sending altogether.
    pub zc_min_frag: usize,

    /// Bitmask of connection types (bit `1 << type`) on which the local side acknowledges
    ///  received data eagerly instead of waiting for delayed ACK.
    pub eager_ack: u32,

    /// Socket send buffer size, zero for the system default
    pub tx_buffer_size: usize,
    /// Socket receive buffer size, zero for the system default
    pub rx_buffer_size: usize,

    /// Nagle's algorithm is disabled unless this is set
    pub nagle: bool,

    /// TCP keepalive is enabled only if idle time, probe count and probe interval are all non-zero
    pub keepalive_idle: Duration,
    pub keepalive_count: u32,
    pub keepalive_interval: Duration,

    /// Compute and send checksums on connections whose protocol version supports them
    pub enable_checksum: bool,

    /// Corrupts the checksum of the next outgoing checksummed message. This is for fault
    ///  injection in tests, and it resets itself after being applied once.
    pub inject_checksum_error: AtomicBool,

    /// Write space notifications with less available space than this are ignored
    pub min_write_space: usize,

    /// Upper bound for the number of fragments in a single outbound unit
    pub max_frags: usize,

    /// Upper bound for a message's payload. Incoming headers announcing more are rejected.
    pub max_message_size: u32,

    /// Upper bound for the number of IP addresses in a hello message
    pub max_interfaces: u32,

    /// Number of receive pages retained in the pool for reuse
    pub page_pool_size: usize,
}

impl TransportConfig {
    pub fn new() -> TransportConfig {
        TransportConfig {
            protocol_version: PROTOCOL_V2,
            typed_connections: true,
            min_bulk: 1024,
            zc_min_frag: 2048,
            eager_ack: 0,
            tx_buffer_size: 0,
            rx_buffer_size: 0,
            nagle: false,
            keepalive_idle: Duration::from_secs(30),
            keepalive_count: 10,
            keepalive_interval: Duration::from_secs(2),
            enable_checksum: false,
            inject_checksum_error: AtomicBool::new(false),
            min_write_space: 8192,
            max_frags: 256,
            max_message_size: 1024*1024,
            max_interfaces: 16,
            page_pool_size: 256,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(PROTOCOL_V1..=PROTOCOL_V2).contains(&self.protocol_version) {
            bail!("unsupported protocol version {}", self.protocol_version);
        }
        if self.max_frags == 0 {
            bail!("max_frags must be positive");
        }
        if self.max_message_size == 0 {
            bail!("max_message_size must be positive");
        }
        if self.max_interfaces > 1024 {
            bail!("max_interfaces is unreasonably large: {}", self.max_interfaces);
        }
        if self.min_write_space == 0 {
            bail!("min_write_space must be positive");
        }
        Ok(())
    }

    pub fn keepalive_enabled(&self) -> bool {
        !self.keepalive_idle.is_zero() && self.keepalive_count > 0 && !self.keepalive_interval.is_zero()
    }

    /// Arms one-shot corruption of the next outgoing checksum
    pub fn inject_checksum_error(&self) {
        self.inject_checksum_error.store(true, Ordering::Release);
    }

    /// Returns `true` exactly once per call to [TransportConfig::inject_checksum_error]
    pub(crate) fn take_checksum_error(&self) -> bool {
        self.inject_checksum_error.swap(false, Ordering::AcqRel)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::new()
    }
}
