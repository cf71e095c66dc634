//! Flow router.
//!
//! Decides which backbone flow carries a captured packet. Two tables feed
//! the decision:
//!
//! - a token table learned from MP_CAPABLE handshakes, used to attach MPTCP
//!   subflows to their main connection, and
//! - an address table loaded from the static routing table.
//!
//! Entries are never overwritten and never evicted.

pub mod table;

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, RoutingError};
use crate::mptcp::{self, EndpointToken};
use crate::packet::Packet;
use crate::types::{FlowKind, IpAddressPortKey, NetFlow};

pub use table::{LoadReport, RouteEntry};

/// Token and address routing tables.
#[derive(Debug, Default)]
pub struct Router {
    tokens: Mutex<HashMap<EndpointToken, NetFlow>>,
    addresses: Mutex<HashMap<IpAddressPortKey, NetFlow>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learn the token of an MP_CAPABLE sender key carried by `packet`.
    ///
    /// Packets without the option are ignored. A token that is already
    /// known is rejected and the existing mapping kept.
    pub fn insert_from_syn_ack_mp_capable(&self, packet: &Packet, net_flow: NetFlow) -> Result<()> {
        let Some(key) = mptcp::sender_key(&packet.payload)? else {
            return Ok(());
        };
        let token = mptcp::endpoint_key_to_token(key);

        let mut tokens = self.tokens.lock();
        if tokens.contains_key(&token) {
            return Err(RoutingError::DuplicateToken(token).into());
        }
        debug!(%token, flow = %net_flow, "Learned MPTCP token");
        tokens.insert(token, net_flow);
        Ok(())
    }

    /// Register a static route for a destination address and port.
    pub fn insert_from_ip_address_port_key(&self, key: IpAddressPortKey, net_flow: NetFlow) -> Result<()> {
        let mut addresses = self.addresses.lock();
        if addresses.contains_key(&key) {
            return Err(RoutingError::DuplicateAddress(key).into());
        }
        debug!(%key, flow = %net_flow, "Registered static route");
        addresses.insert(key, net_flow);
        Ok(())
    }

    /// Find the backbone flow and MPTCP role of a packet.
    ///
    /// A packet naming a receiver token is always a subflow and is only
    /// routed through the token table. Otherwise in-band signalling and then
    /// the destination address decide, and the packet opens a main flow.
    pub fn route(&self, packet: &Packet) -> Result<(NetFlow, FlowKind)> {
        if let Some(token) = mptcp::receiver_token(&packet.payload)? {
            let tokens = self.tokens.lock();
            return match tokens.get(&token) {
                Some(flow) => Ok((flow.clone(), FlowKind::Sub)),
                None => Err(RoutingError::UnknownToken(token).into()),
            };
        }

        if let Some(flow) = self.net_flow_from_ip_options(packet)? {
            return Ok((flow, FlowKind::Main));
        }

        let key = packet.flow.ip_flow.dst_key();
        let addresses = self.addresses.lock();
        match addresses.get(&key) {
            Some(flow) => Ok((flow.clone(), FlowKind::Main)),
            None => Err(RoutingError::NoRoute(key).into()),
        }
    }

    /// In-band routing signalled through IP options. No encoding is
    /// defined yet, so nothing is ever found here.
    fn net_flow_from_ip_options(&self, _packet: &Packet) -> Result<Option<NetFlow>> {
        Ok(None)
    }

    pub fn token_count(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn static_count(&self) -> usize {
        self.addresses.lock().len()
    }

    /// Snapshot of the address table, sorted by key.
    pub fn static_entries(&self) -> Vec<(IpAddressPortKey, NetFlow)> {
        let mut entries: Vec<_> = self
            .addresses
            .lock()
            .iter()
            .map(|(key, flow)| (*key, flow.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
