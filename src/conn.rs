//! Connection meta bits shared by every kernel program that reports a
//! connection.

use std::fmt;
use std::net::IpAddr;

pub const CONN_L3_MASK: u32 = 0xFF;
pub const CONN_L3_IPV4: u32 = 0x00;
pub const CONN_L3_IPV6: u32 = 0x01;

pub const CONN_L4_MASK: u32 = 0xFF00;
pub const CONN_L4_TCP: u32 = 0x0000;
pub const CONN_L4_UDP: u32 = 0x0100;

pub const CONN_DIRECTION_MASK: u32 = 0xFF0000;
pub const CONN_DIRECTION_INCOMING: u32 = 0x10000;

pub fn is_ipv6(meta: u32) -> bool {
    meta & CONN_L3_MASK == CONN_L3_IPV6
}

pub fn is_udp(meta: u32) -> bool {
    meta & CONN_L4_MASK == CONN_L4_UDP
}

pub fn is_incoming(meta: u32) -> bool {
    meta & CONN_DIRECTION_MASK == CONN_DIRECTION_INCOMING
}

pub fn transport_name(meta: u32) -> &'static str {
    if is_udp(meta) {
        "udp"
    } else {
        "tcp"
    }
}

pub fn family_name(meta: u32) -> &'static str {
    if is_ipv6(meta) {
        "ipv6"
    } else {
        "ipv4"
    }
}

/// Coarse class of an address: `private`, `multicast`, `loopback` or `other`.
pub fn ip_type(addr: &IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(v4) if v4.is_loopback() => "loopback",
        IpAddr::V4(v4) if v4.is_private() => "private",
        IpAddr::V4(v4) if v4.is_multicast() => "multicast",
        IpAddr::V6(v6) if v6.is_loopback() => "loopback",
        IpAddr::V6(v6) if v6.segments()[0] & 0xfe00 == 0xfc00 => "private",
        IpAddr::V6(v6) if v6.is_multicast() => "multicast",
        _ => "other",
    }
}

/// Address pair of one connection as seen from the local socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnTuple {
    pub saddr: IpAddr,
    pub sport: u16,
    pub daddr: IpAddr,
    pub dport: u16,
    pub meta: u32,
}

impl ConnTuple {
    pub fn new(saddr: IpAddr, sport: u16, daddr: IpAddr, dport: u16, meta: u32) -> Self {
        Self {
            saddr,
            sport,
            daddr,
            dport,
            meta,
        }
    }

    /// The same tuple seen from the peer.
    pub fn reversed(&self) -> Self {
        Self {
            saddr: self.daddr,
            sport: self.dport,
            daddr: self.saddr,
            dport: self.sport,
            meta: self.meta,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        is_ipv6(self.meta)
    }

    pub fn is_udp(&self) -> bool {
        is_udp(self.meta)
    }

    pub fn is_incoming(&self) -> bool {
        is_incoming(self.meta)
    }
}

impl fmt::Display for ConnTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            transport_name(self.meta),
            self.saddr,
            self.sport,
            self.daddr,
            self.dport
        )
    }
}
