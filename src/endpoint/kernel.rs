//! Table of kernel endpoints keyed by the address they serve.

use dashmap::DashMap;
use tracing::{debug, info};

use crate::packet::PacketChannels;
use crate::types::IpAddressKey;

use super::KernelSide;

/// Registered kernel endpoints.
#[derive(Debug, Default)]
pub struct KernelEndpoints {
    endpoints: DashMap<IpAddressKey, PacketChannels>,
}

impl KernelEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the endpoint serving `address`, replacing any previous one.
    pub fn register(&self, address: IpAddressKey, channels: PacketChannels) {
        if self.endpoints.insert(address, channels).is_some() {
            info!(%address, "Replaced kernel endpoint");
        } else {
            debug!(%address, "Registered kernel endpoint");
        }
    }

    pub fn unregister(&self, address: &IpAddressKey) -> bool {
        self.endpoints.remove(address).is_some()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl KernelSide for KernelEndpoints {
    fn traffic_channels(&self, address: &IpAddressKey) -> Option<PacketChannels> {
        self.endpoints.get(address).map(|entry| entry.value().clone())
    }
}
