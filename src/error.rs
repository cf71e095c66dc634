//! Error types for mpgate.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::mptcp::{EndpointToken, OptionSubtype};
use crate::types::{IpAddressKey, IpAddressPortKey};

/// Result type alias for mpgate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mpgate.
#[derive(Error, Debug)]
pub enum Error {
    // Packet and option decoding errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Flow routing errors
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    // Kernel-side and network-side endpoint errors
    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    // Connection errors
    #[error("unexpected {entrypoint} packet in state {state}")]
    UnexpectedPacket {
        entrypoint: &'static str,
        state: &'static str,
    },

    #[error("channel towards {0} endpoint closed")]
    ChannelClosed(&'static str),

    #[error("connection idle for more than {0:?}")]
    Idle(std::time::Duration),

    #[error("connection closed")]
    ConnectionClosed,

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Broken invariants; never absorbed
    #[error("internal error: {0}")]
    Internal(String),
}

/// Raw packet and MPTCP option decoding errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("malformed header")]
    MalformedHeader,

    #[error("unsupported IP version {0}")]
    UnsupportedIpVersion(u8),

    #[error("not a TCP segment (protocol {0})")]
    NotTcp(u8),

    #[error("malformed TCP option (kind {kind}): {reason}")]
    MalformedOption { kind: u8, reason: String },

    #[error("invalid length {length} for MPTCP option {subtype}")]
    InvalidMptcpLength { subtype: OptionSubtype, length: u8 },
}

/// Flow router errors.
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("entry for MPTCP token {0} already exists")]
    DuplicateToken(EndpointToken),

    #[error("entry for {0} already exists")]
    DuplicateAddress(IpAddressPortKey),

    #[error("no network flow for MPTCP receiver token {0}")]
    UnknownToken(EndpointToken),

    #[error("no routing information available for {0}")]
    NoRoute(IpAddressPortKey),

    #[error("invalid routing entry: {0}")]
    InvalidEntry(String),

    #[error("unable to load routing table: {0}")]
    Table(String),
}

/// Errors raised while establishing or using backbone and kernel endpoints.
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("unable to establish contacting client endpoint: {0}")]
    ContactingClient(String),

    #[error("unable to establish traffic client endpoint: {0}")]
    TrafficClient(String),

    #[error("unable to establish traffic server endpoint: {0}")]
    TrafficServer(String),

    #[error("no kernel endpoint for {0}")]
    NoKernelEndpoint(IpAddressKey),

    #[error("endpoint timed out: {0}")]
    Timeout(String),
}

/// How the gateway reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Caused by a peer or the environment. Close the flow, keep running.
    ThirdParty,
    /// Unexpected but local to one flow. Close the flow, keep running.
    Tolerable,
    /// An internal invariant no longer holds. Shut the gateway down.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::ThirdParty => write!(f, "third-party"),
            Severity::Tolerable => write!(f, "tolerable"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl Error {
    /// Classify the error.
    pub fn severity(&self) -> Severity {
        match self {
            Error::Endpoint(
                EndpointError::ContactingClient(_)
                | EndpointError::TrafficClient(_)
                | EndpointError::TrafficServer(_)
                | EndpointError::Timeout(_),
            )
            | Error::Io(_) => Severity::ThirdParty,
            Error::Internal(_) => Severity::Critical,
            _ => Severity::Tolerable,
        }
    }

    /// Check if the error must escalate to a gateway shutdown.
    pub fn is_critical(&self) -> bool {
        self.severity() == Severity::Critical
    }

    /// Short-hand for an internal invariant violation.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}
