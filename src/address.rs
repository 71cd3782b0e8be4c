//! Typed peer endpoints: canonical byte forms, host parsing, and string keys.

use std::fmt;
use std::net::IpAddr;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::error::{Error, Result};

/// Length of a TorV3 public key in bytes.
const TORV3_PUBKEY_LEN: usize = 32;

/// Length of a full TorV3 onion payload: pubkey, 2-byte checksum, version byte.
const TORV3_ONION_LEN: usize = 35;

/// Version byte carried by every TorV3 onion address.
const TORV3_VERSION: u8 = 0x03;

/// Length of the base32 label in a `.onion` host name.
const TORV3_LABEL_LEN: usize = 56;

/// The network type of a peer endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    /// A 4-byte IPv4 address.
    Ipv4,
    /// A 16-byte IPv6 address.
    Ipv6,
    /// A TorV3 hidden service, stored as the 32-byte ed25519 public key.
    TorV3,
    /// Unrecognized; never stored in the reservoir.
    Unknown,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressType::Ipv4 => "ipv4",
            AddressType::Ipv6 => "ipv6",
            AddressType::TorV3 => "torv3",
            AddressType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Service flags advertised by an endpoint's operator.
///
/// The bits are opaque to the address book: they are OR-accumulated on
/// update and never downgraded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceFlags(pub u64);

impl ServiceFlags {
    /// No services.
    pub const NONE: ServiceFlags = ServiceFlags(0);
    /// The peer serves the full network protocol.
    pub const NETWORK: ServiceFlags = ServiceFlags(1 << 0);

    /// Whether every bit in `other` is set in `self`.
    pub fn contains(self, other: ServiceFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ServiceFlags {
    type Output = ServiceFlags;

    fn bitor(self, rhs: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ServiceFlags {
    fn bitor_assign(&mut self, rhs: ServiceFlags) {
        self.0 |= rhs.0;
    }
}

/// A peer endpoint: canonical address bytes, port, and gossip metadata.
///
/// Values are immutable by convention. Reservoir operations that change an
/// endpoint (service accumulation, timestamp refresh) swap in a fresh copy
/// so that holders of a previous reference never observe the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddress {
    /// Network type of the endpoint.
    pub addr_type: AddressType,
    /// Canonical address bytes: 4 for IPv4, 16 for IPv6, 32 for TorV3.
    pub addr: Vec<u8>,
    /// TCP port of the endpoint.
    pub port: u16,
    /// Unix seconds when the endpoint was last believed reachable. 0 = unknown.
    pub timestamp: u64,
    /// Service flags advertised for this endpoint.
    pub services: ServiceFlags,
}

impl NetAddress {
    /// Creates an endpoint from its parts, canonicalizing the bytes and
    /// verifying that the claimed type matches what the bytes describe.
    pub fn from_parts(
        addr_type: AddressType,
        addr: &[u8],
        port: u16,
        timestamp: u64,
        services: ServiceFlags,
    ) -> Result<NetAddress> {
        let addr = canonicalize(addr_type, addr);
        let derived = derive_address_type(addr_type, &addr)?;
        if derived != addr_type {
            return Err(Error::MismatchedAddressType {
                claimed: addr_type,
                derived,
            });
        }
        Ok(NetAddress {
            addr_type,
            addr,
            port,
            timestamp,
            services,
        })
    }

    /// Creates an endpoint from a standard IP address, stamped with the
    /// current time.
    pub fn from_ip_port(ip: IpAddr, port: u16, services: ServiceFlags) -> NetAddress {
        let (addr_type, addr) = match ip {
            IpAddr::V4(v4) => (AddressType::Ipv4, v4.octets().to_vec()),
            IpAddr::V6(v6) => match ipv4_mapped(&v6.octets()) {
                Some(v4) => (AddressType::Ipv4, v4.to_vec()),
                None => (AddressType::Ipv6, v6.octets().to_vec()),
            },
        };
        NetAddress {
            addr_type,
            addr,
            port,
            timestamp: unix_now(),
            services,
        }
    }

    /// Creates an endpoint from a `"host:port"` string with explicit
    /// timestamp and services.
    pub fn from_string(s: &str, timestamp: u64, services: ServiceFlags) -> Result<NetAddress> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| Error::UnknownAddressType {
            host: s.to_string(),
        })?;
        let port: u16 = port.parse().map_err(|_| Error::UnknownAddressType {
            host: s.to_string(),
        })?;
        let (addr_type, addr) = parse_host(host)?;
        NetAddress::from_parts(addr_type, &addr, port, timestamp, services)
    }

    /// String form of the address without the port. TorV3 endpoints are
    /// rendered as the full `.onion` host name, checksum recomputed.
    pub fn ip_string(&self) -> String {
        match self.addr_type {
            AddressType::Ipv4 if self.addr.len() == 4 => {
                let mut o = [0u8; 4];
                o.copy_from_slice(&self.addr);
                std::net::Ipv4Addr::from(o).to_string()
            }
            AddressType::Ipv6 if self.addr.len() == 16 => {
                let mut o = [0u8; 16];
                o.copy_from_slice(&self.addr);
                std::net::Ipv6Addr::from(o).to_string()
            }
            AddressType::TorV3 if self.addr.len() == TORV3_PUBKEY_LEN => {
                let mut payload = [0u8; TORV3_ONION_LEN];
                payload[..TORV3_PUBKEY_LEN].copy_from_slice(&self.addr);
                let mut pubkey = [0u8; TORV3_PUBKEY_LEN];
                pubkey.copy_from_slice(&self.addr);
                let checksum = torv3_checksum(&pubkey);
                payload[TORV3_PUBKEY_LEN..TORV3_PUBKEY_LEN + 2].copy_from_slice(&checksum);
                payload[TORV3_ONION_LEN - 1] = TORV3_VERSION;
                format!("{}.onion", base32_encode(&payload))
            }
            _ => format!("unsupported address type {}: {}", self.addr_type, hex::encode(&self.addr)),
        }
    }

    /// Unique key for the endpoint: host joined with port, IPv6 bracketed.
    pub fn key(&self) -> String {
        let host = self.ip_string();
        if host.contains(':') {
            format!("[{host}]:{}", self.port)
        } else {
            format!("{host}:{}", self.port)
        }
    }

    /// Shallow copy with the given services merged in.
    pub(crate) fn with_services_added(&self, services: ServiceFlags) -> NetAddress {
        let mut copy = self.clone();
        copy.services |= services;
        copy
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for NetAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<NetAddress> {
        NetAddress::from_string(s, unix_now(), ServiceFlags::NETWORK)
    }
}

/// Parses a host string into its address type and canonical bytes.
///
/// Accepts a dotted quad, a bare or bracketed IPv6 literal, or a TorV3
/// `.onion` label. Never performs DNS resolution.
pub fn parse_host(host: &str) -> Result<(AddressType, Vec<u8>)> {
    if let Some(label) = host.strip_suffix(".onion") {
        let pubkey = parse_torv3_label(label).ok_or_else(|| Error::UnknownAddressType {
            host: host.to_string(),
        })?;
        return Ok((AddressType::TorV3, pubkey.to_vec()));
    }

    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    match bare.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Ok((AddressType::Ipv4, v4.octets().to_vec())),
        Ok(IpAddr::V6(v6)) => match ipv4_mapped(&v6.octets()) {
            Some(v4) => Ok((AddressType::Ipv4, v4.to_vec())),
            None => Ok((AddressType::Ipv6, v6.octets().to_vec())),
        },
        Err(_) => Err(Error::UnknownAddressType {
            host: host.to_string(),
        }),
    }
}

/// Canonicalizes raw bytes for the given address type: IPv4-mapped IPv6
/// bytes fold to 4-byte IPv4, short IPv6 forms widen to 16 bytes. Other
/// types pass through unchanged.
fn canonicalize(addr_type: AddressType, addr: &[u8]) -> Vec<u8> {
    match addr_type {
        AddressType::Ipv4 if addr.len() == 16 => {
            let mut o = [0u8; 16];
            o.copy_from_slice(addr);
            match ipv4_mapped(&o) {
                Some(v4) => v4.to_vec(),
                None => addr.to_vec(),
            }
        }
        AddressType::Ipv6 if addr.len() == 4 => {
            let mut o = [0u8; 16];
            o[10] = 0xff;
            o[11] = 0xff;
            o[12..].copy_from_slice(addr);
            o.to_vec()
        }
        _ => addr.to_vec(),
    }
}

/// Determines the address type implied by raw bytes.
fn derive_address_type(claimed: AddressType, addr: &[u8]) -> Result<AddressType> {
    if addr.len() == 4 || (addr.len() == 16 && ipv4_mapped(first_16(addr)).is_some()) {
        return Ok(AddressType::Ipv4);
    }
    if addr.len() == 16 {
        return Ok(AddressType::Ipv6);
    }
    if addr.len() == TORV3_PUBKEY_LEN && claimed == AddressType::TorV3 {
        return Ok(AddressType::TorV3);
    }
    Err(Error::UnknownAddressType {
        host: hex::encode(addr),
    })
}

fn first_16(addr: &[u8]) -> &[u8; 16] {
    // Only called with 16-byte input.
    addr.try_into().unwrap_or(&[0u8; 16])
}

/// The embedded IPv4 octets if the 16 bytes are an IPv4-mapped IPv6 address.
fn ipv4_mapped(octets: &[u8; 16]) -> Option<[u8; 4]> {
    if octets[..10] == [0u8; 10] && octets[10] == 0xff && octets[11] == 0xff {
        let mut v4 = [0u8; 4];
        v4.copy_from_slice(&octets[12..]);
        Some(v4)
    } else {
        None
    }
}

/// Decodes and validates a 56-character TorV3 base32 label, returning the
/// embedded public key.
fn parse_torv3_label(label: &str) -> Option<[u8; TORV3_PUBKEY_LEN]> {
    if label.len() != TORV3_LABEL_LEN {
        return None;
    }
    let payload = base32_decode(label)?;
    is_torv3(&payload)
}

/// Validates a 35-byte onion payload: version byte and checksum must match.
/// Returns the 32-byte public key on success.
pub(crate) fn is_torv3(payload: &[u8]) -> Option<[u8; TORV3_PUBKEY_LEN]> {
    if payload.len() != TORV3_ONION_LEN {
        return None;
    }
    if payload[TORV3_ONION_LEN - 1] != TORV3_VERSION {
        return None;
    }
    let mut pubkey = [0u8; TORV3_PUBKEY_LEN];
    pubkey.copy_from_slice(&payload[..TORV3_PUBKEY_LEN]);
    let checksum = torv3_checksum(&pubkey);
    if payload[TORV3_PUBKEY_LEN..TORV3_PUBKEY_LEN + 2] != checksum {
        return None;
    }
    Some(pubkey)
}

/// The two checksum bytes of an onion address:
/// `SHA3-256(".onion checksum" || pubkey || version)[0..2]`.
fn torv3_checksum(pubkey: &[u8; TORV3_PUBKEY_LEN]) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(b".onion checksum");
    hasher.update(pubkey);
    hasher.update([TORV3_VERSION]);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// RFC 4648 base32, lowercase, no padding.
fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buf: u32 = 0;
    let mut bits = 0;
    for &b in data {
        buf = (buf << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buf >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buf << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// RFC 4648 base32 decode, case-insensitive, no padding.
fn base32_decode(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut buf: u32 = 0;
    let mut bits = 0;
    for c in s.bytes() {
        let v = match c {
            b'a'..=b'z' => c - b'a',
            b'A'..=b'Z' => c - b'A',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        buf = (buf << 5) | u32::from(v);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buf >> bits) as u8);
        }
    }
    Some(out)
}

/// Current wall clock in unix seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
