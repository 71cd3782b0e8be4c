//! Bounded, bias-resistant reservoir of peer network addresses for nodes
//! on public p2p networks.
//!
//! Addresses learned from gossip, direct connections, and local interface
//! discovery are spread over two tiers of fixed-size buckets (new and
//! tried) keyed by a persisted per-instance seed, so that no single source
//! can flood the reservoir or steer peer selection. Consumers ask the book
//! which peer to dial next, which of the node's own endpoints to
//! advertise, and whether more gossip is needed; the reservoir itself is
//! periodically persisted to a single `peers.json` file.

pub mod address;
pub mod book;
pub mod error;
pub mod known;
pub mod local;
pub mod network;
mod store;

pub use address::{parse_host, AddressType, NetAddress, ServiceFlags};
pub use book::{AddressBook, Config};
pub use error::{Error, Result};
pub use known::KnownAddress;
pub use local::{AddressPriority, LocalAddress};
pub use network::{reachability_from, Reach};
