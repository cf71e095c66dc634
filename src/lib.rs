//! # mpgate
//!
//! Core of a userspace gateway that captures TCP flows from a local virtual
//! interface and carries them over a multipath backbone, keeping MPTCP
//! subflows grouped under their parent connection.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │           Kernel side (virtual interface, out of crate)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                 Working side (packet / issue workers)           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │      Connection Registry ──► Connection state machines          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   Flow Router (token table, address table) ◄── MPTCP decoder    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │           Network side (backbone endpoints, out of crate)       │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::unreadable_literal)]        // Keys and tokens are hex
#![allow(clippy::cast_possible_truncation)]  // Header field widths are checked
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::use_self)]
#![allow(clippy::future_not_send)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::ignored_unit_patterns)]

pub mod config;
pub mod connection;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod mptcp;
pub mod packet;
pub mod router;
pub mod shutdown;
pub mod types;
pub mod worker;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::connection::{Connection, Registry, State};
    pub use crate::context::Context;
    pub use crate::endpoint::{EndpointIssue, IssuerRole, KernelSide, NetworkSide};
    pub use crate::error::{Error, Result, Severity};
    pub use crate::mptcp::{EndpointKey, EndpointToken};
    pub use crate::packet::{Entrypoint, EndpointRole, Packet, PacketChannels};
    pub use crate::router::Router;
    pub use crate::shutdown::{Shutdown, ShutdownReason};
    pub use crate::types::*;
    pub use crate::worker::WorkingSide;
}
