//! Window aggregation of per-connection deltas into flows.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::net::IpAddr;
use std::sync::Arc;

use crate::conn::ConnTuple;
use crate::conntrack::ConntrackTable;
use crate::netflow::event::{ClosedConn, ConnCounters, ConnInfo};
use crate::netflow::filter::{is_ephemeral_port, needs_report};
use crate::netflow::listen::ListenRecorder;

/// One flow of a window. The local endpoint is always the source; an
/// ephemeral port on the initiating side is folded to 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub saddr: IpAddr,
    pub sport: u16,
    pub daddr: IpAddr,
    pub dport: u16,
    pub meta: u32,
    pub pid: u32,
    /// Destination as seen on the wire after NAT, when it differs.
    pub nat: Option<(IpAddr, u16)>,
}

impl FlowKey {
    pub fn tuple(&self) -> ConnTuple {
        ConnTuple::new(self.saddr, self.sport, self.daddr, self.dport, self.meta)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowValue {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub packets: u64,
    pub retransmits: u64,
    pub syn_retransmits: u64,
    pub rtt_sum: u64,
    pub rtt_var_sum: u64,
    pub rtt_samples: u64,
    pub established: u64,
    pub closed: u64,
}

impl FlowValue {
    fn add(&mut self, delta: &ConnCounters) {
        self.bytes_read += delta.recv_bytes;
        self.bytes_written += delta.sent_bytes;
        self.packets += delta.sent_packets + delta.recv_packets;
        self.retransmits += delta.retransmits;
        self.syn_retransmits += delta.syn_retransmits;
        if delta.rtt > 0 {
            self.rtt_sum += delta.rtt as u64;
            self.rtt_var_sum += delta.rtt_var as u64;
            self.rtt_samples += 1;
        }
        self.established += delta.established as u64;
        self.closed += delta.closed as u64;
    }

    /// Mean smoothed RTT and its variance in microseconds.
    pub fn rtt(&self) -> Option<(u64, u64)> {
        (self.rtt_samples > 0).then(|| {
            (
                self.rtt_sum / self.rtt_samples,
                self.rtt_var_sum / self.rtt_samples,
            )
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AggregateOptions {
    pub ephemeral_port_min: u16,
    pub udp: bool,
}

pub struct Aggregator {
    opts: AggregateOptions,
    nat: Option<Arc<ConntrackTable>>,
    listen: Arc<ListenRecorder>,
    flows: HashMap<FlowKey, FlowValue>,
    /// Counters of every connection as of the last snapshot.
    prev: HashMap<ConnInfo, ConnCounters>,
    /// Connections missing from the last snapshot whose closed event may
    /// still be in flight. Kept for one interval.
    vanished: HashMap<ConnInfo, ConnCounters>,
}

impl Aggregator {
    pub fn new(
        opts: AggregateOptions,
        nat: Option<Arc<ConntrackTable>>,
        listen: Arc<ListenRecorder>,
    ) -> Self {
        Self {
            opts,
            nat,
            listen,
            flows: HashMap::new(),
            prev: HashMap::new(),
            vanished: HashMap::new(),
        }
    }

    fn take_prev(&mut self, info: &ConnInfo) -> ConnCounters {
        self.prev
            .remove(info)
            .or_else(|| self.vanished.remove(info))
            .unwrap_or_default()
    }

    /// Account what is left of a connection's totals when it closes.
    pub fn add_closed(&mut self, closed: &ClosedConn) {
        let prev = self.take_prev(&closed.info);
        let delta = closed.counters.delta_since(&prev);
        self.add(&closed.info, &delta);
    }

    /// Account the growth of every live connection since the previous
    /// snapshot.
    pub fn add_snapshot(&mut self, live: Vec<(ConnInfo, ConnCounters)>) {
        let mut current = HashMap::with_capacity(live.len());
        for (info, counters) in live {
            let prev = self.take_prev(&info);
            let delta = counters.delta_since(&prev);
            self.add(&info, &delta);
            current.insert(info, counters);
        }
        self.vanished = mem::replace(&mut self.prev, current);
    }

    fn add(&mut self, info: &ConnInfo, delta: &ConnCounters) {
        let tuple = &info.tuple;
        if !needs_report(tuple, delta, self.opts.udp) {
            return;
        }
        let key = self.key(info);
        if tuple.is_incoming() {
            self.listen.insert(tuple.saddr);
        }
        self.flows.entry(key).or_default().add(delta);
    }

    fn key(&self, info: &ConnInfo) -> FlowKey {
        let t = &info.tuple;
        let mut sport = t.sport;
        let mut dport = t.dport;
        if t.is_incoming() {
            if is_ephemeral_port(dport, self.opts.ephemeral_port_min) {
                dport = 0;
            }
        } else if is_ephemeral_port(sport, self.opts.ephemeral_port_min) {
            sport = 0;
        }
        let nat = self
            .nat
            .as_ref()
            .and_then(|table| table.resolve(t))
            .map(|reply| (reply.saddr, reply.sport))
            .filter(|wire| *wire != (t.daddr, t.dport));
        FlowKey {
            saddr: t.saddr,
            sport,
            daddr: t.daddr,
            dport,
            meta: t.meta,
            pid: info.pid,
            nat,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Close the window: hand out every flow in key order and start empty.
    pub fn flush(&mut self) -> Vec<(FlowKey, FlowValue)> {
        let flows: BTreeMap<FlowKey, FlowValue> = mem::take(&mut self.flows).into_iter().collect();
        flows.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{CONN_DIRECTION_INCOMING, CONN_L4_UDP};
    use crate::conntrack::ConntrackTuple;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn info(sport: u16, dport: u16, meta: u32, pid: u32) -> ConnInfo {
        ConnInfo {
            tuple: ConnTuple::new(ip("10.0.0.5"), sport, ip("10.96.0.10"), dport, meta),
            pid,
            netns: 1,
        }
    }

    fn sent(bytes: u64) -> ConnCounters {
        ConnCounters {
            sent_bytes: bytes,
            sent_packets: 1,
            ..Default::default()
        }
    }

    fn aggregator(nat: Option<Arc<ConntrackTable>>) -> (Aggregator, Arc<ListenRecorder>) {
        let listen = Arc::new(ListenRecorder::new());
        let agg = Aggregator::new(
            AggregateOptions {
                ephemeral_port_min: 32768,
                udp: false,
            },
            nat,
            listen.clone(),
        );
        (agg, listen)
    }

    #[test]
    fn test_ephemeral_ports_merge_into_one_flow() {
        let (mut agg, _) = aggregator(None);
        agg.add_snapshot(vec![(info(40001, 80, 0, 7), sent(100)), (info(40002, 80, 0, 7), sent(50))]);
        let flows = agg.flush();
        assert_eq!(flows.len(), 1);
        let (key, value) = flows[0];
        assert_eq!(key.sport, 0);
        assert_eq!(key.dport, 80);
        assert_eq!(value.bytes_written, 150);
        assert_eq!(value.packets, 2);
        assert!(agg.is_empty());
    }

    #[test]
    fn test_snapshot_then_close_counts_once() {
        let (mut agg, _) = aggregator(None);
        let conn = info(40001, 80, 0, 7);
        agg.add_snapshot(vec![(conn, sent(100))]);
        assert_eq!(agg.flush()[0].1.bytes_written, 100);

        // The connection is gone from the next snapshot, its close event
        // arrives afterwards
        agg.add_snapshot(vec![]);
        let mut final_counters = sent(130);
        final_counters.closed = true;
        agg.add_closed(&ClosedConn {
            info: conn,
            counters: final_counters,
        });
        let flows = agg.flush();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].1.bytes_written, 30);
        assert_eq!(flows[0].1.closed, 1);
    }

    #[test]
    fn test_incoming_feeds_listen_recorder() {
        let (mut agg, listen) = aggregator(None);
        let conn = info(8080, 51000, CONN_DIRECTION_INCOMING, 9);
        agg.add_snapshot(vec![(conn, sent(10))]);
        let flows = agg.flush();
        assert_eq!(flows[0].0.sport, 8080);
        assert_eq!(flows[0].0.dport, 0);
        assert!(listen.contains(&ip("10.0.0.5")));
    }

    #[test]
    fn test_udp_and_idle_are_skipped() {
        let (mut agg, _) = aggregator(None);
        agg.add_snapshot(vec![
            (info(40001, 53, CONN_L4_UDP, 7), sent(64)),
            (info(40002, 80, 0, 7), ConnCounters::default()),
        ]);
        assert!(agg.flush().is_empty());
    }

    #[test]
    fn test_nat_destination_is_part_of_key() {
        let table = Arc::new(ConntrackTable::new());
        let conn = info(40001, 80, 0, 7);
        table.insert(ConntrackTuple {
            origin: conn.tuple,
            reply: ConnTuple::new(ip("10.1.2.3"), 8080, ip("10.0.0.5"), 40001, 0),
            netns: 1,
        });
        let (mut agg, _) = aggregator(Some(table));
        agg.add_snapshot(vec![(conn, sent(10)), (info(40002, 80, 0, 7), sent(10))]);
        let flows = agg.flush();
        assert_eq!(flows.len(), 2);
        let nat: Vec<_> = flows.iter().filter_map(|(k, _)| k.nat).collect();
        assert_eq!(nat, vec![(ip("10.1.2.3"), 8080)]);
    }

    #[test]
    fn test_rtt_is_averaged_over_samples() {
        let (mut agg, _) = aggregator(None);
        let mut a = sent(1);
        a.rtt = 100;
        a.rtt_var = 10;
        let mut b = sent(1);
        b.rtt = 300;
        b.rtt_var = 30;
        agg.add_snapshot(vec![(info(40001, 80, 0, 7), a), (info(40002, 80, 0, 7), b)]);
        assert_eq!(agg.flush()[0].1.rtt(), Some((200, 20)));
    }
}
