//! Core flow identity types used throughout mpgate.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::packet::tcpip::TcpSegment;

/// Unique identifier for a connection instance.
///
/// Two connections for the same IP flow (e.g. one reclaimed, one fresh)
/// carry different ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Key of a bare IP address, e.g. used to find a kernel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpAddressKey(pub IpAddr);

impl fmt::Display for IpAddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0)
    }
}

/// Key of an address and port, used by the static routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpAddressPortKey(pub SocketAddr);

impl fmt::Display for IpAddressPortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0)
    }
}

/// Direction-independent key of an [`IpFlow`].
///
/// The endpoints are stored sorted, so `a -> b` and `b -> a` share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpFlowKey {
    lo: SocketAddr,
    hi: SocketAddr,
}

impl fmt::Display for IpFlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}<>{})", self.lo, self.hi)
    }
}

/// A flow as captured locally: the TCP source and destination addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpFlow {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl IpFlow {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self { src, dst }
    }

    /// Extract the flow from a raw IP packet carrying a TCP segment.
    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        let segment = TcpSegment::parse(raw)?;
        Ok(Self::new(segment.src, segment.dst))
    }

    pub fn key(&self) -> IpFlowKey {
        if self.src <= self.dst {
            IpFlowKey {
                lo: self.src,
                hi: self.dst,
            }
        } else {
            IpFlowKey {
                lo: self.dst,
                hi: self.src,
            }
        }
    }

    pub fn src_key(&self) -> IpAddressPortKey {
        IpAddressPortKey(self.src)
    }

    pub fn dst_key(&self) -> IpAddressPortKey {
        IpAddressPortKey(self.dst)
    }

    pub fn src_ip_key(&self) -> IpAddressKey {
        IpAddressKey(self.src.ip())
    }

    pub fn dst_ip_key(&self) -> IpAddressKey {
        IpAddressKey(self.dst.ip())
    }

    /// Get the reverse flow (swap src/dst).
    pub fn reverse(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for IpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Address of a gateway instance on the backbone.
///
/// The backbone owns the address format; the core only compares and
/// forwards it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkAddress(pub String);

impl NetworkAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Placeholder used until the backbone assigns a local address.
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<none>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<&str> for NetworkAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Backbone path a flow is pinned to. Empty means "let the backbone pick".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(pub String);

impl NetworkPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<default>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Direction-independent key of a [`NetFlow`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetFlowKey {
    lo: NetworkAddress,
    path: NetworkPath,
    hi: NetworkAddress,
}

impl fmt::Display for NetFlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}<>{}<>{})", self.lo, self.path, self.hi)
    }
}

/// How a flow is carried on the backbone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetFlow {
    pub src: NetworkAddress,
    pub path: NetworkPath,
    pub dst: NetworkAddress,
}

impl NetFlow {
    pub fn new(src: NetworkAddress, path: NetworkPath, dst: NetworkAddress) -> Self {
        Self { src, path, dst }
    }

    /// Flow towards `dst` whose local source is not yet known.
    pub fn towards(dst: NetworkAddress, path: NetworkPath) -> Self {
        Self::new(NetworkAddress::empty(), path, dst)
    }

    pub fn key(&self) -> NetFlowKey {
        let (lo, hi) = if self.src <= self.dst {
            (self.src.clone(), self.dst.clone())
        } else {
            (self.dst.clone(), self.src.clone())
        };
        NetFlowKey {
            lo,
            path: self.path.clone(),
            hi,
        }
    }

    /// Swap source and destination, keeping the path.
    pub fn swap(&self) -> Self {
        Self {
            src: self.dst.clone(),
            path: self.path.clone(),
            dst: self.src.clone(),
        }
    }
}

impl fmt::Display for NetFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {} via {}", self.src, self.dst, self.path)
    }
}

/// Full end-to-end identity of one logical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Flow {
    pub ip_flow: IpFlow,
    pub net_flow: NetFlow,
}

impl Flow {
    pub fn new(ip_flow: IpFlow, net_flow: NetFlow) -> Self {
        Self { ip_flow, net_flow }
    }

    /// Flow of a freshly captured packet, not yet routed.
    pub fn from_ip_flow(ip_flow: IpFlow) -> Self {
        Self::new(ip_flow, NetFlow::default())
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] over [{}]", self.ip_flow, self.net_flow)
    }
}

/// MPTCP role of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowKind {
    /// The originating subflow carrying the MP_CAPABLE handshake.
    Main,
    /// An additional subflow joined through a receiver token.
    Sub,
    /// Not yet classified.
    #[default]
    Unknown,
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Sub => write!(f, "sub"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Traffic statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrafficStats {
    pub bytes_to_network: u64,
    pub bytes_to_kernel: u64,
    pub packets_to_network: u64,
    pub packets_to_kernel: u64,
}

impl TrafficStats {
    pub fn add(&mut self, other: &Self) {
        self.bytes_to_network += other.bytes_to_network;
        self.bytes_to_kernel += other.bytes_to_kernel;
        self.packets_to_network += other.packets_to_network;
        self.packets_to_kernel += other.packets_to_kernel;
    }
}
