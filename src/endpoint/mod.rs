//! Seams towards the kernel side and the backbone.
//!
//! The core never opens sockets or interfaces itself. It resolves kernel
//! endpoints through [`KernelSide`] and asks [`NetworkSide`] to dial or
//! accept backbone endpoints. Both hand back [`PacketChannels`].

pub mod kernel;

use std::fmt;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::packet::PacketChannels;
use crate::types::{Flow, IpAddressKey, IpFlow, NetFlow};

pub use kernel::KernelEndpoints;

/// Lookup of the kernel endpoints owned by the gateway.
pub trait KernelSide: Send + Sync {
    /// Channels of the kernel endpoint serving `address`, if any.
    fn traffic_channels(&self, address: &IpAddressKey) -> Option<PacketChannels>;
}

/// Backbone endpoint management.
///
/// Client endpoints are dialed for flows captured locally. Server endpoints
/// answer flows that arrived from a remote gateway.
#[async_trait]
pub trait NetworkSide: Send + Sync {
    /// Dial a short-lived probe endpoint towards the flow's remote gateway.
    ///
    /// Returns the net flow with the local source filled in.
    async fn establish_contacting_client_endpoint(&self, flow: &Flow) -> Result<(NetFlow, PacketChannels)>;

    /// Dial the endpoint that carries the flow's traffic for good.
    async fn establish_traffic_client_endpoint(&self, flow: &Flow) -> Result<(NetFlow, PacketChannels)>;

    /// Accept the traffic endpoint of a flow opened by a remote gateway.
    async fn establish_traffic_server_endpoint(&self, flow: &Flow) -> Result<PacketChannels>;

    async fn teardown_contacting_client_endpoint(&self, flow: &IpFlow);

    async fn teardown_traffic_client_endpoint(&self, flow: &IpFlow);

    async fn teardown_traffic_server_endpoint(&self, flow: &Flow);
}

/// Endpoint that reported an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IssuerRole {
    Kernel,
    ContactingClient,
    ContactingServer,
    TrafficClient,
    TrafficServer,
}

impl IssuerRole {
    /// Whether an issue from this endpoint leaves the gateway unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Kernel | Self::ContactingServer)
    }
}

impl fmt::Display for IssuerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Kernel => "kernel",
            Self::ContactingClient => "contacting client",
            Self::ContactingServer => "contacting server",
            Self::TrafficClient => "traffic client",
            Self::TrafficServer => "traffic server",
        };
        f.write_str(name)
    }
}

/// A failure reported by an endpoint outside of packet processing.
#[derive(Debug)]
pub struct EndpointIssue {
    pub issuer: IssuerRole,
    /// Flow served by the endpoint. Shared endpoints report `None`.
    pub flow: Option<Flow>,
    pub error: Error,
}

impl EndpointIssue {
    pub fn new(issuer: IssuerRole, flow: Option<Flow>, error: Error) -> Self {
        Self { issuer, flow, error }
    }
}

impl fmt::Display for EndpointIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.flow {
            Some(flow) => write!(f, "{} endpoint of {}: {}", self.issuer, flow.ip_flow, self.error),
            None => write!(f, "{} endpoint: {}", self.issuer, self.error),
        }
    }
}
