//! Which connections are worth reporting.

use std::net::IpAddr;

use crate::conn::ConnTuple;
use crate::netflow::event::ConnCounters;

fn is_loopback(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}

/// Drop connections with a zero address or port, loopback-to-loopback
/// traffic, idle connections, and UDP unless it was asked for.
pub fn needs_report(tuple: &ConnTuple, delta: &ConnCounters, udp_enabled: bool) -> bool {
    if tuple.is_udp() && !udp_enabled {
        return false;
    }
    if tuple.saddr.is_unspecified()
        || tuple.daddr.is_unspecified()
        || tuple.sport == 0
        || tuple.dport == 0
    {
        return false;
    }
    if is_loopback(&tuple.saddr) && is_loopback(&tuple.daddr) {
        return false;
    }
    !delta.is_idle()
}

pub fn is_ephemeral_port(port: u16, ephemeral_min: u16) -> bool {
    port >= ephemeral_min
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{CONN_L3_IPV6, CONN_L4_UDP};

    fn tuple(s: &str, sport: u16, d: &str, dport: u16, meta: u32) -> ConnTuple {
        ConnTuple::new(s.parse().unwrap(), sport, d.parse().unwrap(), dport, meta)
    }

    fn active() -> ConnCounters {
        ConnCounters {
            sent_bytes: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_filter_rules() {
        let ok = tuple("10.0.0.1", 40000, "10.0.0.2", 80, 0);
        assert!(needs_report(&ok, &active(), false));
        assert!(!needs_report(&ok, &ConnCounters::default(), false));

        let established = ConnCounters {
            established: true,
            ..Default::default()
        };
        assert!(needs_report(&ok, &established, false));

        assert!(!needs_report(&tuple("0.0.0.0", 40000, "10.0.0.2", 80, 0), &active(), false));
        assert!(!needs_report(&tuple("10.0.0.1", 0, "10.0.0.2", 80, 0), &active(), false));
        assert!(!needs_report(&tuple("127.0.0.1", 40000, "127.0.0.53", 53, 0), &active(), false));
        // Only one side on loopback is still reported
        assert!(needs_report(&tuple("127.0.0.1", 40000, "10.0.0.2", 80, 0), &active(), false));

        let v6 = tuple("::1", 40000, "::1", 80, CONN_L3_IPV6);
        assert!(!needs_report(&v6, &active(), false));
        let mapped = tuple("::ffff:127.0.0.1", 40000, "::ffff:127.0.0.1", 80, CONN_L3_IPV6);
        assert!(!needs_report(&mapped, &active(), false));

        let udp = tuple("10.0.0.1", 40000, "10.0.0.2", 53, CONN_L4_UDP);
        assert!(!needs_report(&udp, &active(), false));
        assert!(needs_report(&udp, &active(), true));
    }

    #[test]
    fn test_ephemeral_port() {
        assert!(is_ephemeral_port(40000, 32768));
        assert!(!is_ephemeral_port(8080, 32768));
    }
}
