//! Packets moving between the kernel side and the backbone.
//!
//! A [`Packet`] is the unit workers pull from channels and hand to a
//! connection. It records which endpoint it came from, the flow it belongs
//! to and the raw IP bytes.

pub mod tcpip;

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::types::{Flow, IpFlow};

/// Kind of endpoint a packet entered the gateway through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    /// Captured from the local virtual interface.
    Kernel,
    /// Received on a contacting (probe) endpoint of the backbone.
    ContactingNetwork,
    /// Received on a traffic endpoint of the backbone.
    TrafficNetwork,
}

impl EndpointRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kernel => "kernel",
            Self::ContactingNetwork => "contacting",
            Self::TrafficNetwork => "traffic",
        }
    }
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a packet came from.
///
/// Kernel packets carry the channels of the kernel endpoint that captured
/// them so the connection can answer on the same interface.
#[derive(Debug, Clone)]
pub struct Entrypoint {
    pub role: EndpointRole,
    pub channels: Option<PacketChannels>,
}

impl Entrypoint {
    pub fn kernel(channels: PacketChannels) -> Self {
        Self {
            role: EndpointRole::Kernel,
            channels: Some(channels),
        }
    }

    pub fn contacting() -> Self {
        Self {
            role: EndpointRole::ContactingNetwork,
            channels: None,
        }
    }

    pub fn traffic() -> Self {
        Self {
            role: EndpointRole::TrafficNetwork,
            channels: None,
        }
    }
}

/// A captured or received IP packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub entrypoint: Entrypoint,
    pub flow: Flow,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(entrypoint: Entrypoint, flow: Flow, payload: impl Into<Bytes>) -> Self {
        Self {
            entrypoint,
            flow,
            payload: payload.into(),
        }
    }

    /// Build a packet whose IP flow is read from the raw bytes.
    pub fn from_raw(entrypoint: Entrypoint, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        let ip_flow = IpFlow::from_raw(&payload)?;
        Ok(Self::new(entrypoint, Flow::from_ip_flow(ip_flow), payload))
    }

    pub fn role(&self) -> EndpointRole {
        self.entrypoint.role
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Sending halves of an endpoint's packet channels.
///
/// `ingress` feeds packets into the gateway, `egress` carries packets out
/// of it towards the endpoint.
#[derive(Debug, Clone)]
pub struct PacketChannels {
    pub ingress: mpsc::Sender<Packet>,
    pub egress: mpsc::Sender<Packet>,
}

/// Receiving halves matching a [`PacketChannels`].
#[derive(Debug)]
pub struct PacketReceivers {
    pub ingress: mpsc::Receiver<Packet>,
    pub egress: mpsc::Receiver<Packet>,
}

impl PacketChannels {
    /// Create a bounded pair of channels.
    pub fn bounded(capacity: usize) -> (Self, PacketReceivers) {
        let (ingress_tx, ingress_rx) = mpsc::channel(capacity);
        let (egress_tx, egress_rx) = mpsc::channel(capacity);
        (
            Self {
                ingress: ingress_tx,
                egress: egress_tx,
            },
            PacketReceivers {
                ingress: ingress_rx,
                egress: egress_rx,
            },
        )
    }

    /// Send a packet out through this endpoint. Waits while the channel is full.
    pub async fn forward(&self, packet: Packet, towards: &'static str) -> Result<()> {
        self.egress
            .send(packet)
            .await
            .map_err(|_| Error::ChannelClosed(towards))
    }

    /// Check whether both halves still point to the same channels.
    pub fn same_channels(&self, other: &Self) -> bool {
        self.ingress.same_channel(&other.ingress) && self.egress.same_channel(&other.egress)
    }
}
