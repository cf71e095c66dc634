//! Static routing table.
//!
//! A JSON array of entries mapping a destination `ip:port` to the backbone
//! address (and optional path) that serves it:
//!
//! ```json
//! [
//!   { "key": { "ip": "93.1.1.1", "port": 443 },
//!     "flow": { "address": "1-ff00:0:110,10.0.0.1", "path": "" } }
//! ]
//! ```
//!
//! Entries are decoded one by one so a single bad entry does not discard
//! the whole table.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result, RoutingError};
use crate::types::{IpAddressPortKey, NetFlow, NetworkAddress, NetworkPath};

use super::Router;

/// Destination side of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryKey {
    pub ip: IpAddr,
    pub port: u16,
}

/// Backbone side of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFlow {
    pub address: NetworkAddress,
    #[serde(default)]
    pub path: NetworkPath,
}

/// One routing table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub key: EntryKey,
    pub flow: EntryFlow,
}

impl RouteEntry {
    pub fn new(dst: SocketAddr, address: NetworkAddress, path: NetworkPath) -> Self {
        Self {
            key: EntryKey {
                ip: dst.ip(),
                port: dst.port(),
            },
            flow: EntryFlow { address, path },
        }
    }

    pub fn address_port_key(&self) -> IpAddressPortKey {
        IpAddressPortKey(SocketAddr::new(self.key.ip, self.key.port))
    }

    pub fn net_flow(&self) -> NetFlow {
        NetFlow::towards(self.flow.address.clone(), self.flow.path.clone())
    }

    fn validate(&self) -> Result<()> {
        if self.key.port == 0 {
            return Err(RoutingError::InvalidEntry(format!("{}: port is zero", self.key.ip)).into());
        }
        if self.flow.address.is_empty() {
            return Err(RoutingError::InvalidEntry(format!(
                "{}: empty backbone address",
                self.address_port_key()
            ))
            .into());
        }
        Ok(())
    }
}

/// Outcome of loading a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub inserted: usize,
    pub skipped: usize,
}

/// Read raw entries from a JSON file.
pub fn read(path: &Path) -> Result<Vec<serde_json::Value>> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Routing(RoutingError::Table(format!("{}: {}", path.display(), e))))?;
    parse(&content)
}

/// Parse raw entries from JSON text. Only the top-level array must be valid.
pub fn parse(content: &str) -> Result<Vec<serde_json::Value>> {
    serde_json::from_str(content).map_err(|e| Error::Routing(RoutingError::Table(e.to_string())))
}

/// Read a table file and insert its entries into `router`.
pub fn load(router: &Router, path: &Path) -> Result<LoadReport> {
    let entries = read(path)?;
    let report = router.load_table(entries);
    info!(
        path = %path.display(),
        inserted = report.inserted,
        skipped = report.skipped,
        "Loaded static routing table"
    );
    Ok(report)
}

impl Router {
    /// Insert raw table entries, skipping malformed entries and duplicates.
    pub fn load_table(&self, entries: Vec<serde_json::Value>) -> LoadReport {
        let mut report = LoadReport::default();

        for (index, value) in entries.into_iter().enumerate() {
            let entry = match serde_json::from_value::<RouteEntry>(value) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(index, error = %e, "Skipping malformed routing entry");
                    report.skipped += 1;
                    continue;
                }
            };

            let inserted = entry
                .validate()
                .and_then(|()| self.insert_from_ip_address_port_key(entry.address_port_key(), entry.net_flow()));

            match inserted {
                Ok(()) => report.inserted += 1,
                Err(e) => {
                    warn!(index, error = %e, "Skipping routing entry");
                    report.skipped += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TABLE: &str = r#"[
        { "key": { "ip": "93.1.1.1", "port": 443 },
          "flow": { "address": "1-ff00:0:110,10.0.0.1", "path": "p1" } },
        { "key": { "ip": "not-an-ip", "port": 80 },
          "flow": { "address": "x" } },
        { "key": { "ip": "93.1.1.2", "port": 80 },
          "flow": { "address": "" } },
        { "key": { "ip": "93.1.1.1", "port": 443 },
          "flow": { "address": "1-ff00:0:111,10.0.0.2" } },
        { "key": { "ip": "2001:db8::1", "port": 22 },
          "flow": { "address": "1-ff00:0:112,[fd00::1]" } }
    ]"#;

    #[test]
    fn test_load_skips_bad_entries() {
        let router = Router::new();
        let report = router.load_table(parse(TABLE).unwrap());
        assert_eq!(report, LoadReport { inserted: 2, skipped: 3 });
        assert_eq!(router.static_count(), 2);

        let entries = router.static_entries();
        let first = entries
            .iter()
            .find(|(key, _)| key.0.port() == 443)
            .map(|(_, flow)| flow.clone())
            .unwrap();
        assert_eq!(first.dst.as_str(), "1-ff00:0:110,10.0.0.1");
        assert_eq!(first.path.as_str(), "p1");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TABLE.as_bytes()).unwrap();

        let router = Router::new();
        let report = load(&router, file.path()).unwrap();
        assert_eq!(report.inserted, 2);
    }

    #[test]
    fn test_unreadable_table() {
        let router = Router::new();
        let result = load(&router, Path::new("/nonexistent/routes.json"));
        assert!(matches!(result, Err(Error::Routing(RoutingError::Table(_)))));
        assert!(parse("{ not json").is_err());
        assert!(parse(r#"{"key": 1}"#).is_err());
    }
}
