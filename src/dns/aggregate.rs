//! Fixed window aggregation of DNS transactions.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::dns::capture::Transport;
use crate::dns::tracker::{Endpoint, Transaction};
use crate::netflow::listen::ListenRecorder;

pub const DNS_WINDOW: Duration = Duration::from_secs(30);

/// Client port is not part of the key, it is almost always ephemeral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DnsKey {
    pub client: IpAddr,
    pub server: Endpoint,
    pub transport: Transport,
    pub rcode: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsStats {
    pub count: u64,
    pub latency_sum: Duration,
    pub latency_max: Duration,
    pub timeouts: u64,
    pub domains: BTreeSet<String>,
}

impl DnsStats {
    pub fn latency_mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let mean = self.latency_sum.as_nanos() / self.count as u128;
        Duration::from_nanos(u64::try_from(mean).unwrap_or(u64::MAX))
    }
}

pub struct DnsAggregator {
    listen: Arc<ListenRecorder>,
    window: BTreeMap<DnsKey, DnsStats>,
}

impl DnsAggregator {
    pub fn new(listen: Arc<ListenRecorder>) -> Self {
        Self {
            listen,
            window: BTreeMap::new(),
        }
    }

    /// Roles are swapped when the supposed server is an address this host
    /// has been seen accepting connections on. Best effort only: two local
    /// services talking to each other can be misread.
    fn roles(&self, tx: &Transaction) -> (Endpoint, Endpoint) {
        if self.listen.contains(&tx.server.0) {
            (tx.server, tx.client)
        } else {
            (tx.client, tx.server)
        }
    }

    pub fn add(&mut self, tx: &Transaction) {
        let (client, server) = self.roles(tx);
        let key = DnsKey {
            client: client.0,
            server,
            transport: tx.transport,
            rcode: tx.rcode,
        };
        let stats = self.window.entry(key).or_default();
        stats.count += 1;
        stats.latency_sum += tx.latency;
        stats.latency_max = stats.latency_max.max(tx.latency);
        stats.timeouts += tx.timeout as u64;
        if !tx.domain.is_empty() {
            stats.domains.insert(tx.domain.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn flush(&mut self) -> BTreeMap<DnsKey, DnsStats> {
        mem::take(&mut self.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tracker::RCODE_TIMEOUT;

    fn ep(s: &str, port: u16) -> Endpoint {
        (s.parse().unwrap(), port)
    }

    fn tx(client_port: u16, ms: u64, rcode: i32, domain: &str) -> Transaction {
        Transaction {
            client: ep("10.0.0.5", client_port),
            server: ep("10.0.0.2", 53),
            transport: Transport::Udp,
            rcode,
            latency: Duration::from_millis(ms),
            timeout: rcode == RCODE_TIMEOUT,
            domain: domain.to_string(),
            answers: Vec::new(),
        }
    }

    #[test]
    fn test_count_mean_and_max() {
        let mut agg = DnsAggregator::new(Arc::new(ListenRecorder::new()));
        agg.add(&tx(41000, 2, 0, "a.example"));
        agg.add(&tx(41001, 4, 0, "b.example"));
        agg.add(&tx(41002, 9, 0, "a.example"));
        agg.add(&tx(41003, 6000, RCODE_TIMEOUT, "c.example"));
        let window = agg.flush();
        assert_eq!(window.len(), 2);
        let ok = window
            .iter()
            .find(|(k, _)| k.rcode == 0)
            .map(|(_, v)| v)
            .unwrap();
        assert_eq!(ok.count, 3);
        assert_eq!(ok.latency_mean(), Duration::from_millis(5));
        assert_eq!(ok.latency_max, Duration::from_millis(9));
        assert_eq!(ok.domains.len(), 2);
        assert!(agg.is_empty());
    }

    #[test]
    fn test_roles_swapped_when_server_is_local_listener() {
        let listen = Arc::new(ListenRecorder::new());
        // Seen accepting on another port, the address alone decides
        listen.insert("10.0.0.2".parse().unwrap());
        let mut agg = DnsAggregator::new(listen);
        agg.add(&tx(41000, 1, 0, "x.example"));
        let window = agg.flush();
        let key = window.keys().next().unwrap();
        assert_eq!(key.client, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(key.server, ep("10.0.0.5", 41000));
    }

    #[test]
    fn test_roles_kept_when_only_client_listens() {
        let listen = Arc::new(ListenRecorder::new());
        listen.insert("10.0.0.5".parse().unwrap());
        let mut agg = DnsAggregator::new(listen);
        agg.add(&tx(41000, 1, 0, "x.example"));
        let window = agg.flush();
        let key = window.keys().next().unwrap();
        assert_eq!(key.client, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(key.server, ep("10.0.0.2", 53));
    }

    #[test]
    fn test_latency_mean_of_large_counts() {
        let stats = DnsStats {
            count: 5_000_000_000,
            latency_sum: Duration::from_secs(10_000_000_000),
            ..Default::default()
        };
        assert_eq!(stats.latency_mean(), Duration::from_secs(2));
        assert_eq!(DnsStats::default().latency_mean(), Duration::ZERO);
    }
}
