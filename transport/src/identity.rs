use std::fmt::{Debug, Formatter};
use std::net::Ipv4Addr;
use std::time::SystemTime;

#[cfg(test)] use mockall::automock;

/// Stable identifier of a participant in the messaging fabric, independent of its IP address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u64);

impl EndpointId {
    /// Placeholder used in an outbound hello when the peer's identity is not known yet
    pub const ANY: EndpointId = EndpointId(u64::MAX);
}

impl Debug for EndpointId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if *self == Self::ANY {
            write!(f, "<any>")
        }
        else {
            write!(f, "{:x}", self.0)
        }
    }
}

/// Identifier of the process on an endpoint that owns a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

/// Everything the handshake needs to know about the local endpoint.
///
/// The transport consumes identities, it does not assign them - that is the responsibility of
///  whatever directory or configuration service runs the fabric.
#[cfg_attr(test, automock)]
pub trait IdentityResolver: Send + Sync + 'static {
    fn local_endpoint(&self) -> EndpointId;
    fn local_process(&self) -> ProcessId;

    /// An opaque value that is different after every restart of the local endpoint
    fn local_incarnation(&self) -> u64;

    /// Addresses advertised to peers in the hello message
    fn local_ips(&self) -> Vec<Ipv4Addr>;
}

/// [IdentityResolver] with identities fixed at startup and the incarnation derived from the
///  startup time.
pub struct StaticIdentity {
    endpoint: EndpointId,
    process: ProcessId,
    incarnation: u64,
    ips: Vec<Ipv4Addr>,
}

impl StaticIdentity {
    pub fn new(endpoint: EndpointId, process: ProcessId, ips: Vec<Ipv4Addr>) -> anyhow::Result<StaticIdentity> {
        Ok(StaticIdentity {
            endpoint,
            process,
            incarnation: Self::incarnation_from_timestamp()?,
            ips,
        })
    }

    pub fn with_incarnation(endpoint: EndpointId, process: ProcessId, incarnation: u64, ips: Vec<Ipv4Addr>) -> StaticIdentity {
        StaticIdentity {
            endpoint,
            process,
            incarnation,
            ips,
        }
    }

    fn incarnation_from_timestamp() -> anyhow::Result<u64> {
        let raw = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_nanos();

        // zero is reserved for 'unknown' in the hello message
        match u64::try_from(raw) {
            Ok(0) | Err(_) => anyhow::bail!("system clock out of range for an incarnation"),
            Ok(incarnation) => Ok(incarnation),
        }
    }
}

impl IdentityResolver for StaticIdentity {
    fn local_endpoint(&self) -> EndpointId {
        self.endpoint
    }

    fn local_process(&self) -> ProcessId {
        self.process
    }

    fn local_incarnation(&self) -> u64 {
        self.incarnation
    }

    fn local_ips(&self) -> Vec<Ipv4Addr> {
        self.ips.clone()
    }
}
