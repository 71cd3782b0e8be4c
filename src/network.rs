//! Address classification: RFC range predicates, routability, reach
//! scoring, and the coarse group keys used for bucket dispersion.

use std::net::Ipv6Addr;

use crate::address::{AddressType, NetAddress};

fn ipv4_octets(na: &NetAddress) -> Option<[u8; 4]> {
    if na.addr_type == AddressType::Ipv4 && na.addr.len() == 4 {
        let mut o = [0u8; 4];
        o.copy_from_slice(&na.addr);
        Some(o)
    } else {
        None
    }
}

fn ipv6_octets(na: &NetAddress) -> Option<[u8; 16]> {
    if na.addr_type == AddressType::Ipv6 && na.addr.len() == 16 {
        let mut o = [0u8; 16];
        o.copy_from_slice(&na.addr);
        Some(o)
    } else {
        None
    }
}

/// RFC 1918 private networks: 10/8, 172.16/12, 192.168/16.
pub(crate) fn is_rfc1918(na: &NetAddress) -> bool {
    let Some(o) = ipv4_octets(na) else { return false };
    o[0] == 10 || (o[0] == 172 && (16..32).contains(&o[1])) || (o[0] == 192 && o[1] == 168)
}

/// RFC 2544 benchmarking: 198.18.0.0/15.
pub(crate) fn is_rfc2544(na: &NetAddress) -> bool {
    let Some(o) = ipv4_octets(na) else { return false };
    o[0] == 198 && (o[1] == 18 || o[1] == 19)
}

/// RFC 3849 IPv6 documentation prefix: 2001:db8::/32.
pub(crate) fn is_rfc3849(na: &NetAddress) -> bool {
    let Some(o) = ipv6_octets(na) else { return false };
    o[..4] == [0x20, 0x01, 0x0d, 0xb8]
}

/// RFC 3927 IPv4 link-local: 169.254/16.
pub(crate) fn is_rfc3927(na: &NetAddress) -> bool {
    let Some(o) = ipv4_octets(na) else { return false };
    o[0] == 169 && o[1] == 254
}

/// RFC 3964 6to4 tunnels: 2002::/16.
pub(crate) fn is_rfc3964(na: &NetAddress) -> bool {
    let Some(o) = ipv6_octets(na) else { return false };
    o[..2] == [0x20, 0x02]
}

/// RFC 4193 unique local IPv6: fc00::/7.
pub(crate) fn is_rfc4193(na: &NetAddress) -> bool {
    let Some(o) = ipv6_octets(na) else { return false };
    o[0] & 0xfe == 0xfc
}

/// RFC 4380 Teredo tunnels: 2001::/32.
pub(crate) fn is_rfc4380(na: &NetAddress) -> bool {
    let Some(o) = ipv6_octets(na) else { return false };
    o[..4] == [0x20, 0x01, 0x00, 0x00]
}

/// RFC 4843 ORCHID: 2001:10::/28.
pub(crate) fn is_rfc4843(na: &NetAddress) -> bool {
    let Some(o) = ipv6_octets(na) else { return false };
    o[..3] == [0x20, 0x01, 0x00] && o[3] & 0xf0 == 0x10
}

/// RFC 4862 IPv6 link-local autoconfiguration: fe80::/64.
pub(crate) fn is_rfc4862(na: &NetAddress) -> bool {
    let Some(o) = ipv6_octets(na) else { return false };
    o[..8] == [0xfe, 0x80, 0, 0, 0, 0, 0, 0]
}

/// RFC 5737 IPv4 documentation ranges: 192.0.2/24, 198.51.100/24, 203.0.113/24.
pub(crate) fn is_rfc5737(na: &NetAddress) -> bool {
    let Some(o) = ipv4_octets(na) else { return false };
    [[192, 0, 2], [198, 51, 100], [203, 0, 113]].contains(&[o[0], o[1], o[2]])
}

/// RFC 6052 IPv4/IPv6 translation well-known prefix: 64:ff9b::/96.
pub(crate) fn is_rfc6052(na: &NetAddress) -> bool {
    let Some(o) = ipv6_octets(na) else { return false };
    o[..12] == [0x00, 0x64, 0xff, 0x9b, 0, 0, 0, 0, 0, 0, 0, 0]
}

/// RFC 6145 IPv4-translated IPv6: ::ffff:0:0:0/96.
pub(crate) fn is_rfc6145(na: &NetAddress) -> bool {
    let Some(o) = ipv6_octets(na) else { return false };
    o[..12] == [0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0, 0]
}

/// RFC 6598 carrier-grade NAT: 100.64/10.
pub(crate) fn is_rfc6598(na: &NetAddress) -> bool {
    let Some(o) = ipv4_octets(na) else { return false };
    o[0] == 100 && (64..128).contains(&o[1])
}

/// Loopback, the unspecified address, and IPv4 first-octet-zero.
pub(crate) fn is_local(na: &NetAddress) -> bool {
    if let Some(o) = ipv4_octets(na) {
        return o[0] == 127 || o[0] == 0;
    }
    if let Some(o) = ipv6_octets(na) {
        let ip = Ipv6Addr::from(o);
        return ip.is_loopback() || ip.is_unspecified();
    }
    false
}

/// Rejects the unspecified addresses and the IPv4 broadcast address.
pub(crate) fn is_valid(na: &NetAddress) -> bool {
    if let Some(o) = ipv4_octets(na) {
        return o != [0, 0, 0, 0] && o != [255, 255, 255, 255];
    }
    if let Some(o) = ipv6_octets(na) {
        return o != [0u8; 16];
    }
    na.addr_type == AddressType::TorV3
}

/// How well a local endpoint can be used to reach a given remote; higher is
/// better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Reach {
    /// The local endpoint cannot carry traffic toward the remote.
    Unreachable,
    /// No useful information; the local endpoint is not publicly routable.
    Default,
    /// Connectivity through a Teredo tunnel.
    Teredo,
    /// Tunneled or cross-family IPv6 connectivity.
    Ipv6Weak,
    /// Native IPv4 connectivity.
    Ipv4,
    /// Native IPv6 connectivity.
    Ipv6Strong,
    /// Both sides are Tor hidden services.
    PrivateTorV3,
}

/// Scores how well `local` can reach `remote`.
pub fn reachability_from(local: &NetAddress, remote: &NetAddress) -> Reach {
    if !remote.is_routable() {
        return Reach::Unreachable;
    }

    if remote.addr_type == AddressType::TorV3 {
        if local.addr_type == AddressType::TorV3 {
            return Reach::PrivateTorV3;
        }
        if local.is_routable() && local.addr_type == AddressType::Ipv4 {
            return Reach::Ipv4;
        }
        if local.is_routable() && local.addr_type == AddressType::Ipv6 {
            return Reach::Ipv6Weak;
        }
        return Reach::Default;
    }

    if is_rfc4380(remote) {
        if !local.is_routable() {
            return Reach::Default;
        }
        if is_rfc4380(local) {
            return Reach::Teredo;
        }
        if local.addr_type == AddressType::Ipv4 {
            return Reach::Ipv4;
        }
        return Reach::Ipv6Weak;
    }

    if remote.addr_type == AddressType::Ipv4 {
        if local.is_routable() && local.addr_type == AddressType::Ipv4 {
            return Reach::Ipv4;
        }
        return Reach::Unreachable;
    }

    // Remote is plain IPv6.
    let tunneled = is_rfc3964(local) || is_rfc6052(local) || is_rfc6145(local);
    if !local.is_routable() {
        return Reach::Default;
    }
    if is_rfc4380(local) {
        return Reach::Teredo;
    }
    if local.addr_type == AddressType::Ipv4 {
        return Reach::Ipv4;
    }
    if tunneled {
        return Reach::Ipv6Weak;
    }
    Reach::Ipv6Strong
}

impl NetAddress {
    /// Whether the endpoint is publicly routable.
    pub fn is_routable(&self) -> bool {
        if self.addr_type == AddressType::TorV3 {
            return true;
        }
        is_valid(self)
            && !(is_rfc1918(self)
                || is_rfc2544(self)
                || is_rfc3927(self)
                || is_rfc4862(self)
                || is_rfc3849(self)
                || is_rfc4843(self)
                || is_rfc5737(self)
                || is_rfc4193(self)
                || is_rfc6598(self)
                || is_local(self))
    }

    /// Coarse group key used to disperse related endpoints across buckets.
    ///
    /// Endpoints that share infrastructure (the same IPv4 /16, the same
    /// IPv6 /32, the embedded IPv4 network of a tunnel) map to the same
    /// key; the key is a pure function of the canonical bytes.
    pub fn group_key(&self) -> String {
        if is_local(self) {
            return "local".to_string();
        }
        if !self.is_routable() {
            return "unroutable".to_string();
        }
        if let Some(o) = ipv4_octets(self) {
            return format!("{}.{}.0.0", o[0], o[1]);
        }
        if self.addr_type == AddressType::TorV3 {
            // Grouped by the first 4 bits of the public key.
            return format!("torv3:{}", self.addr.first().map_or(0, |b| b & 0x0f));
        }

        let mut o = [0u8; 16];
        o.copy_from_slice(&self.addr);

        // Tunneled addresses group by the embedded IPv4 network.
        if is_rfc6052(self) || is_rfc6145(self) {
            return format!("{}.{}.0.0", o[12], o[13]);
        }
        if is_rfc3964(self) {
            return format!("{}.{}.0.0", o[2], o[3]);
        }
        if is_rfc4380(self) {
            // Teredo stores the client address inverted in the low bytes.
            return format!("{}.{}.0.0", o[12] ^ 0xff, o[13] ^ 0xff);
        }

        // Plain IPv6 groups by /32, except Hurricane Electric (2001:470::/32)
        // which hands out /36 allocations.
        let bits = if o[..4] == [0x20, 0x01, 0x04, 0x70] { 36 } else { 32 };
        let mut masked = [0u8; 16];
        masked[..bits / 8].copy_from_slice(&o[..bits / 8]);
        if bits % 8 != 0 {
            masked[bits / 8] = o[bits / 8] & (0xff << (8 - bits % 8));
        }
        Ipv6Addr::from(masked).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{parse_host, ServiceFlags};

    fn addr(host: &str) -> NetAddress {
        let (addr_type, bytes) = parse_host(host).unwrap();
        NetAddress::from_parts(addr_type, &bytes, 8333, 0, ServiceFlags::NETWORK).unwrap()
    }

    struct IpTest {
        ip: &'static str,
        rfc1918: bool,
        rfc2544: bool,
        rfc3849: bool,
        rfc3927: bool,
        rfc3964: bool,
        rfc4193: bool,
        rfc4380: bool,
        rfc4843: bool,
        rfc4862: bool,
        rfc5737: bool,
        rfc6052: bool,
        rfc6145: bool,
        rfc6598: bool,
        local: bool,
        valid: bool,
        routable: bool,
    }

    fn ip_test(
        ip: &'static str,
        flags: [bool; 13],
        local: bool,
        valid: bool,
        routable: bool,
    ) -> IpTest {
        IpTest {
            ip,
            rfc1918: flags[0],
            rfc2544: flags[1],
            rfc3849: flags[2],
            rfc3927: flags[3],
            rfc3964: flags[4],
            rfc4193: flags[5],
            rfc4380: flags[6],
            rfc4843: flags[7],
            rfc4862: flags[8],
            rfc5737: flags[9],
            rfc6052: flags[10],
            rfc6145: flags[11],
            rfc6598: flags[12],
            local,
            valid,
            routable,
        }
    }

    #[test]
    fn test_ip_types() {
        const F: bool = false;
        const T: bool = true;
        let tests = [
            ip_test("10.255.255.255", [T, F, F, F, F, F, F, F, F, F, F, F, F], F, T, F),
            ip_test("192.168.0.1", [T, F, F, F, F, F, F, F, F, F, F, F, F], F, T, F),
            ip_test("172.31.255.1", [T, F, F, F, F, F, F, F, F, F, F, F, F], F, T, F),
            ip_test("172.32.1.1", [F; 13], F, T, T),
            ip_test("169.254.250.120", [F, F, F, T, F, F, F, F, F, F, F, F, F], F, T, F),
            ip_test("0.0.0.0", [F; 13], T, F, F),
            ip_test("255.255.255.255", [F; 13], F, F, F),
            ip_test("127.0.0.1", [F; 13], T, T, F),
            ip_test("fd00:dead::1", [F, F, F, F, F, T, F, F, F, F, F, F, F], F, T, F),
            ip_test("2001::1", [F, F, F, F, F, F, T, F, F, F, F, F, F], F, T, T),
            ip_test("2001:10:abcd::1:1", [F, F, F, F, F, F, F, T, F, F, F, F, F], F, T, F),
            ip_test("fe80::1", [F, F, F, F, F, F, F, F, T, F, F, F, F], F, T, F),
            ip_test("fe80:1::1", [F; 13], F, T, T),
            ip_test("64:ff9b::1", [F, F, F, F, F, F, F, F, F, F, T, F, F], F, T, T),
            ip_test("::ffff:abcd:ef12:1", [F; 13], F, T, T),
            ip_test("::1", [F; 13], T, T, F),
            ip_test("198.18.0.1", [F, T, F, F, F, F, F, F, F, F, F, F, F], F, T, F),
            ip_test("100.127.255.1", [F, F, F, F, F, F, F, F, F, F, F, F, T], F, T, F),
            ip_test("203.0.113.1", [F, F, F, F, F, F, F, F, F, T, F, F, F], F, T, F),
            ip_test("2002:0c01:0203::", [F, F, F, F, T, F, F, F, F, F, F, F, F], F, T, T),
            ip_test("2001:db8::1234", [F, F, T, F, F, F, F, F, F, F, F, F, F], F, T, F),
        ];

        for t in tests {
            let na = addr(t.ip);
            assert_eq!(is_rfc1918(&na), t.rfc1918, "isRFC1918 {}", t.ip);
            assert_eq!(is_rfc2544(&na), t.rfc2544, "isRFC2544 {}", t.ip);
            assert_eq!(is_rfc3849(&na), t.rfc3849, "isRFC3849 {}", t.ip);
            assert_eq!(is_rfc3927(&na), t.rfc3927, "isRFC3927 {}", t.ip);
            assert_eq!(is_rfc3964(&na), t.rfc3964, "isRFC3964 {}", t.ip);
            assert_eq!(is_rfc4193(&na), t.rfc4193, "isRFC4193 {}", t.ip);
            assert_eq!(is_rfc4380(&na), t.rfc4380, "isRFC4380 {}", t.ip);
            assert_eq!(is_rfc4843(&na), t.rfc4843, "isRFC4843 {}", t.ip);
            assert_eq!(is_rfc4862(&na), t.rfc4862, "isRFC4862 {}", t.ip);
            assert_eq!(is_rfc5737(&na), t.rfc5737, "isRFC5737 {}", t.ip);
            assert_eq!(is_rfc6052(&na), t.rfc6052, "isRFC6052 {}", t.ip);
            assert_eq!(is_rfc6145(&na), t.rfc6145, "isRFC6145 {}", t.ip);
            assert_eq!(is_rfc6598(&na), t.rfc6598, "isRFC6598 {}", t.ip);
            assert_eq!(is_local(&na), t.local, "isLocal {}", t.ip);
            assert_eq!(is_valid(&na), t.valid, "isValid {}", t.ip);
            assert_eq!(na.is_routable(), t.routable, "isRoutable {}", t.ip);
        }
    }

    #[test]
    fn test_group_key() {
        let tests = [
            // Local addresses.
            ("127.0.0.1", "local"),
            ("::1", "local"),
            ("0.0.0.0", "local"),
            ("0.1.2.3", "local"),
            // Unroutable addresses.
            ("255.255.255.255", "unroutable"),
            ("10.1.2.3", "unroutable"),
            ("172.16.1.2", "unroutable"),
            ("192.168.1.2", "unroutable"),
            ("2001:db8::1234", "unroutable"),
            ("169.254.1.2", "unroutable"),
            ("fc00::1234", "unroutable"),
            ("2001:10::1234", "unroutable"),
            ("fe80::1234", "unroutable"),
            // Plain IPv4.
            ("12.1.2.3", "12.1.0.0"),
            ("173.1.2.3", "173.1.0.0"),
            ("196.1.2.3", "196.1.0.0"),
            // IPv6/IPv4 translations.
            ("2002:0c01:0203::", "12.1.0.0"),
            ("2001:0:1234::f3fe:fdfc", "12.1.0.0"),
            ("64:ff9b::0c01:0203", "12.1.0.0"),
            ("::ffff:0:0c01:0203", "12.1.0.0"),
            // Plain IPv6.
            ("2602:100::1", "2602:100::"),
            ("2602:0100::1234", "2602:100::"),
            ("2001:470:1f10:a1::2", "2001:470:1000::"),
            ("2001:0470:1f10:a1::2", "2001:470:1000::"),
            // TorV3.
            (
                "xa4r2iadxm55fbnqgwwi5mymqdcofiu3w6rpbtqn7b2dyn7mgwj64jyd.onion",
                "torv3:8",
            ),
        ];

        for (host, expected) in tests {
            assert_eq!(addr(host).group_key(), expected, "group key for {host}");
        }
    }

    #[test]
    fn test_group_key_is_pure() {
        let na = addr("2001:470:1f10:a1::2");
        assert_eq!(na.group_key(), na.group_key());

        let copy = NetAddress::from_parts(na.addr_type, &na.addr, 1, 99, ServiceFlags::NONE).unwrap();
        assert_eq!(na.group_key(), copy.group_key());
    }

    #[test]
    fn test_reachability() {
        const TOR: &str = "xa4r2iadxm55fbnqgwwi5mymqdcofiu3w6rpbtqn7b2dyn7mgwj64jyd.onion";
        let tests = [
            // Local peer suggested by a remote: useless for reaching anyone.
            ("127.0.0.1", "12.1.2.3", Reach::Unreachable),
            (TOR, TOR, Reach::PrivateTorV3),
            ("12.1.2.3", TOR, Reach::Ipv4),
            ("0.0.0.0", TOR, Reach::Default),
            ("2003::", TOR, Reach::Ipv6Weak),
            ("::1", TOR, Reach::Default),
            ("2001::1", "2001::1", Reach::Teredo),
            ("0.0.0.0", "2001::1", Reach::Default),
            ("12.1.2.3", "2001::1", Reach::Ipv4),
            ("2003::", "2001::1", Reach::Ipv6Weak),
            ("12.1.2.3", "12.1.2.3", Reach::Ipv4),
            ("2003::", "12.1.2.3", Reach::Unreachable),
            ("0.0.0.0", "2003::", Reach::Default),
            ("::1", "2003::", Reach::Default),
            ("12.1.2.3", "::1", Reach::Unreachable),
            ("2001::1", "2003::", Reach::Teredo),
            ("12.1.2.3", "2003::", Reach::Ipv4),
            ("2002:0c01:0203::", "2003::", Reach::Ipv6Weak),
            ("64:ff9b::1", "2003::", Reach::Ipv6Weak),
            ("::ffff:0:0c01:0203", "2003::", Reach::Ipv6Weak),
            ("2003::1", "2003::", Reach::Ipv6Strong),
        ];

        for (local, remote, expected) in tests {
            assert_eq!(
                reachability_from(&addr(local), &addr(remote)),
                expected,
                "reach from {local} to {remote}"
            );
        }
    }

    #[test]
    fn test_reach_ordering() {
        assert!(Reach::Unreachable < Reach::Default);
        assert!(Reach::Default < Reach::Teredo);
        assert!(Reach::Teredo < Reach::Ipv6Weak);
        assert!(Reach::Ipv6Weak < Reach::Ipv4);
        assert!(Reach::Ipv4 < Reach::Ipv6Strong);
        assert!(Reach::Ipv6Strong < Reach::PrivateTorV3);
    }
}
