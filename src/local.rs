//! The node's own advertisable endpoints, ranked by how they were
//! discovered, and the best-match selection against a remote peer.

use std::collections::HashMap;
use std::sync::Arc;

use crate::address::{AddressType, NetAddress, ServiceFlags};
use crate::error::{Error, Result};
use crate::network::{reachability_from, Reach};

/// How a local endpoint was discovered. Higher priorities win when
/// advertising; re-adding with a lower or equal priority is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddressPriority {
    /// Unknown provenance.
    None,
    /// Learned from a network interface.
    Interface,
    /// Explicitly bound by configuration.
    Bound,
    /// Discovered through UPnP.
    Upnp,
    /// Reported by an external HTTP scan.
    HttpScan,
    /// Supplied manually by the operator.
    Manual,
}

/// A local endpoint together with its discovery priority.
#[derive(Debug, Clone)]
pub struct LocalAddress {
    /// The endpoint itself.
    pub address: Arc<NetAddress>,
    /// How it was discovered.
    pub priority: AddressPriority,
}

/// Priority-ranked set of self-endpoints, keyed like the reservoir.
#[derive(Debug, Default)]
pub(crate) struct LocalAddressTable {
    entries: HashMap<String, LocalAddress>,
}

impl LocalAddressTable {
    /// Inserts an endpoint or upgrades its priority. Rejects endpoints that
    /// are not publicly routable.
    pub(crate) fn add(&mut self, na: Arc<NetAddress>, priority: AddressPriority) -> Result<()> {
        if !na.is_routable() {
            return Err(Error::UnroutableAddress { key: na.key() });
        }
        let key = na.key();
        match self.entries.get_mut(&key) {
            Some(entry) if priority <= entry.priority => {}
            Some(entry) => {
                entry.priority = priority;
                entry.address = na;
            }
            None => {
                self.entries.insert(key, LocalAddress { address: na, priority });
            }
        }
        Ok(())
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn snapshot(&self) -> Vec<LocalAddress> {
        self.entries.values().cloned().collect()
    }

    /// The local endpoint best suited for advertising to `remote`:
    /// maximizes reach, then priority, then prefers IPv4, with the lowest
    /// key as the deterministic tie-break. Falls back to the all-zero
    /// endpoint of the matching family when nothing qualifies.
    pub(crate) fn best_for(&self, remote: &NetAddress) -> Arc<NetAddress> {
        let mut best: Option<(&String, &LocalAddress, Reach)> = None;
        for (key, entry) in &self.entries {
            let reach = reachability_from(&entry.address, remote);
            if reach == Reach::Unreachable {
                continue;
            }
            let candidate = (reach, entry.priority, entry.address.addr_type == AddressType::Ipv4);
            let better = match best {
                None => true,
                Some((best_key, best_entry, best_reach)) => {
                    let current = (
                        best_reach,
                        best_entry.priority,
                        best_entry.address.addr_type == AddressType::Ipv4,
                    );
                    candidate > current || (candidate == current && key < best_key)
                }
            };
            if better {
                best = Some((key, entry, reach));
            }
        }

        match best {
            Some((_, entry, _)) => entry.address.clone(),
            None => Arc::new(zero_address_for(remote)),
        }
    }
}

/// Whether `local`, as seen by `remote`, is a plausible candidate for our
/// external address, along with the computed reach.
pub(crate) fn is_external_addr_candidate(
    local: &NetAddress,
    remote: &NetAddress,
) -> (bool, Reach) {
    let reach = reachability_from(local, remote);
    let good = reach >= Reach::Ipv4
        || (remote.addr_type == AddressType::TorV3 && reach >= Reach::Ipv6Weak);
    (good, reach)
}

/// The all-zero endpoint of the family matching `remote`.
fn zero_address_for(remote: &NetAddress) -> NetAddress {
    let (addr_type, addr) = match remote.addr_type {
        AddressType::Ipv6 => (AddressType::Ipv6, vec![0u8; 16]),
        _ => (AddressType::Ipv4, vec![0u8; 4]),
    };
    NetAddress {
        addr_type,
        addr,
        port: 0,
        timestamp: 0,
        services: ServiceFlags::NONE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::parse_host;

    const TOR: &str = "xa4r2iadxm55fbnqgwwi5mymqdcofiu3w6rpbtqn7b2dyn7mgwj64jyd.onion";

    fn addr(host: &str) -> Arc<NetAddress> {
        let (addr_type, bytes) = parse_host(host).unwrap();
        Arc::new(NetAddress::from_parts(addr_type, &bytes, 0, 0, ServiceFlags::NETWORK).unwrap())
    }

    #[test]
    fn test_add_rejects_unroutable() {
        let mut table = LocalAddressTable::default();
        let cases = [
            ("192.168.0.100", false),
            ("204.124.1.1", true),
            ("::1", false),
            ("fe80::1", false),
            ("2620:100::1", true),
        ];

        for (host, valid) in cases {
            let na = addr(host);
            let result = table.add(na.clone(), AddressPriority::Interface);
            assert_eq!(result.is_ok(), valid, "adding {host}");
            assert_eq!(table.contains(&na.key()), valid, "membership of {host}");
        }

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        for entry in snapshot {
            assert!(entry.address.is_routable());
        }
    }

    #[test]
    fn test_priority_upgrade_only() {
        let mut table = LocalAddressTable::default();
        let na = addr("204.124.1.1");
        table.add(na.clone(), AddressPriority::Bound).unwrap();

        // Lower or equal priority leaves the entry untouched.
        table.add(na.clone(), AddressPriority::Interface).unwrap();
        table.add(na.clone(), AddressPriority::Bound).unwrap();
        assert_eq!(table.snapshot()[0].priority, AddressPriority::Bound);

        table.add(na.clone(), AddressPriority::Manual).unwrap();
        assert_eq!(table.snapshot()[0].priority, AddressPriority::Manual);
    }

    #[test]
    fn test_best_for_empty_table_returns_zero_of_family() {
        let table = LocalAddressTable::default();

        let v4 = table.best_for(&addr("204.124.8.1"));
        assert_eq!(v4.addr_type, AddressType::Ipv4);
        assert_eq!(v4.addr, vec![0u8; 4]);

        let v6 = table.best_for(&addr("2602:100:abcd::102"));
        assert_eq!(v6.addr_type, AddressType::Ipv6);
        assert_eq!(v6.addr, vec![0u8; 16]);

        // TorV3 remotes fall back to the IPv4 zero address.
        let tor = table.best_for(&addr(TOR));
        assert_eq!(tor.addr_type, AddressType::Ipv4);
    }

    #[test]
    fn test_best_for_prefers_reach_then_priority() {
        let mut table = LocalAddressTable::default();
        for host in ["192.168.0.100", "::1", "fe80::1", "2001:470::1"] {
            // Unroutable entries are rejected; only the public IPv6 sticks.
            let _ = table.add(addr(host), AddressPriority::Interface);
        }

        // Public IPv6 remote: the native IPv6 local wins.
        let best = table.best_for(&addr("2602:100:abcd::102"));
        assert_eq!(best.key(), addr("2001:470::1").key());

        // Public IPv4 remote: no IPv4 local yet, so the zero address.
        let best = table.best_for(&addr("204.124.8.1"));
        assert_eq!(best.addr, vec![0u8; 4]);

        // Private IPv4 remote is unreachable for everyone.
        let best = table.best_for(&addr("172.16.0.254"));
        assert_eq!(best.addr, vec![0u8; 4]);

        table
            .add(addr("204.124.8.100"), AddressPriority::Interface)
            .unwrap();

        // IPv4 remote now gets the public IPv4 local.
        let best = table.best_for(&addr("204.124.8.1"));
        assert_eq!(best.key(), addr("204.124.8.100").key());

        // IPv6 remote still strictly prefers the IPv6 local.
        let best = table.best_for(&addr("2602:100:abcd::102"));
        assert_eq!(best.key(), addr("2001:470::1").key());
    }

    #[test]
    fn test_best_for_deterministic_tie_break() {
        let mut table = LocalAddressTable::default();
        table.add(addr("204.124.8.2"), AddressPriority::Interface).unwrap();
        table.add(addr("204.124.8.1"), AddressPriority::Interface).unwrap();

        // Equal reach, priority, and family: the lowest key wins.
        let best = table.best_for(&addr("12.1.2.3"));
        assert_eq!(best.key(), "204.124.8.1:0");
    }

    #[test]
    fn test_is_external_addr_candidate() {
        let cases = [
            ("127.0.0.1", "12.1.2.3", false, Reach::Unreachable),
            (TOR, TOR, true, Reach::PrivateTorV3),
            ("12.1.2.3", TOR, true, Reach::Ipv4),
            ("0.0.0.0", TOR, false, Reach::Default),
            ("2003::", TOR, true, Reach::Ipv6Weak),
            ("::1", TOR, false, Reach::Default),
            ("2001::1", "2001::1", false, Reach::Teredo),
            ("0.0.0.0", "2001::1", false, Reach::Default),
            ("12.1.2.3", "2001::1", true, Reach::Ipv4),
            ("2003::", "2001::1", false, Reach::Ipv6Weak),
            ("12.1.2.3", "12.1.2.3", true, Reach::Ipv4),
            ("2003::", "12.1.2.3", false, Reach::Unreachable),
            ("0.0.0.0", "2003::", false, Reach::Default),
            ("::1", "2003::", false, Reach::Default),
            ("12.1.2.3", "::1", false, Reach::Unreachable),
            ("2001::1", "2003::", false, Reach::Teredo),
            ("12.1.2.3", "2003::", true, Reach::Ipv4),
            ("2002:0c01:0203::", "2003::", false, Reach::Ipv6Weak),
            ("64:ff9b::1", "2003::", false, Reach::Ipv6Weak),
            ("::ffff:0:0c01:0203", "2003::", false, Reach::Ipv6Weak),
            ("2003::1", "2003::", true, Reach::Ipv6Strong),
        ];

        for (local, remote, expected_good, expected_reach) in cases {
            let (good, reach) = is_external_addr_candidate(&addr(local), &addr(remote));
            assert_eq!(good, expected_good, "candidate {local} -> {remote}");
            assert_eq!(reach, expected_reach, "reach {local} -> {remote}");
        }
    }
}
