//! Fixed layouts of the netflow program's maps and closed-connection events.
//!
//! ```text
//! conn info   saddr[16] daddr[16] sport:u16 dport:u16 pid:u32 netns:u32 meta:u32   (48)
//! conn stats  sent:u64 recv:u64 sent_pkts:u32 recv_pkts:u32 pad:u64 ts:u64         (40)
//! tcp stats   retrans:u32 rtt:u32 rtt_var:u32 states:u16 syn_retrans:u16          (16)
//! closed      conn info, conn stats, tcp stats                                     (104)
//! ```

use crate::conn::{is_ipv6, ConnTuple};
use crate::layout::{DecodeError, Reader, Writer};

pub const CONN_INFO_SIZE: usize = 48;
pub const CONN_STATS_SIZE: usize = 40;
pub const TCP_STATS_SIZE: usize = 16;
pub const CLOSED_EVENT_SIZE: usize = CONN_INFO_SIZE + CONN_STATS_SIZE + TCP_STATS_SIZE;

// Bits of the tcp state transition mask
const TCP_ESTABLISHED: u16 = 1;
const TCP_CLOSE: u16 = 7;

/// Identity of one socket as keyed by the kernel maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnInfo {
    pub tuple: ConnTuple,
    pub pid: u32,
    pub netns: u32,
}

impl ConnInfo {
    pub fn decode(r: &Reader, base: usize) -> Result<Self, DecodeError> {
        r.require(base + CONN_INFO_SIZE)?;
        let meta = r.u32(base + 44)?;
        let ipv6 = is_ipv6(meta);
        Ok(ConnInfo {
            tuple: ConnTuple::new(
                r.addr(base, ipv6)?,
                r.u16(base + 32)?,
                r.addr(base + 16, ipv6)?,
                r.u16(base + 34)?,
                meta,
            ),
            pid: r.u32(base + 36)?,
            netns: r.u32(base + 40)?,
        })
    }

    pub fn encode(&self, w: &mut Writer, base: usize) {
        w.put_addr(base, &self.tuple.saddr)
            .put_addr(base + 16, &self.tuple.daddr)
            .put_u16(base + 32, self.tuple.sport)
            .put_u16(base + 34, self.tuple.dport)
            .put_u32(base + 36, self.pid)
            .put_u32(base + 40, self.netns)
            .put_u32(base + 44, self.tuple.meta);
    }

    /// TCP stats are keyed without the pid.
    pub fn tcp_key(&self) -> Vec<u8> {
        let mut w = Writer::new(CONN_INFO_SIZE);
        ConnInfo { pid: 0, ..*self }.encode(&mut w, 0);
        w.into_inner()
    }

    pub fn key(&self) -> Vec<u8> {
        let mut w = Writer::new(CONN_INFO_SIZE);
        self.encode(&mut w, 0);
        w.into_inner()
    }
}

/// Cumulative counters of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnCounters {
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub sent_packets: u64,
    pub recv_packets: u64,
    pub retransmits: u64,
    pub syn_retransmits: u64,
    /// Smoothed round trip time in microseconds, a gauge.
    pub rtt: u32,
    pub rtt_var: u32,
    pub established: bool,
    pub closed: bool,
}

impl ConnCounters {
    pub fn decode(stats: &Reader, base: usize, tcp: Option<(&Reader, usize)>) -> Result<Self, DecodeError> {
        stats.require(base + CONN_STATS_SIZE)?;
        let mut c = ConnCounters {
            sent_bytes: stats.u64(base)?,
            recv_bytes: stats.u64(base + 8)?,
            sent_packets: stats.u32(base + 16)? as u64,
            recv_packets: stats.u32(base + 20)? as u64,
            ..Default::default()
        };
        if let Some((tcp, tbase)) = tcp {
            tcp.require(tbase + TCP_STATS_SIZE)?;
            let states = tcp.u16(tbase + 12)?;
            c.retransmits = tcp.u32(tbase)? as u64;
            c.rtt = tcp.u32(tbase + 4)?;
            c.rtt_var = tcp.u32(tbase + 8)?;
            c.established = states & (1 << TCP_ESTABLISHED) != 0;
            c.closed = states & (1 << TCP_CLOSE) != 0;
            c.syn_retransmits = tcp.u16(tbase + 14)? as u64;
        }
        Ok(c)
    }

    pub fn encode_stats(&self, w: &mut Writer, base: usize) {
        w.put_u64(base, self.sent_bytes)
            .put_u64(base + 8, self.recv_bytes)
            .put_u32(base + 16, self.sent_packets as u32)
            .put_u32(base + 20, self.recv_packets as u32)
            .put_u64(base + 32, 0);
    }

    pub fn encode_tcp(&self, w: &mut Writer, base: usize) {
        let mut states = 0u16;
        if self.established {
            states |= 1 << TCP_ESTABLISHED;
        }
        if self.closed {
            states |= 1 << TCP_CLOSE;
        }
        w.put_u32(base, self.retransmits as u32)
            .put_u32(base + 4, self.rtt)
            .put_u32(base + 8, self.rtt_var)
            .put_u16(base + 12, states)
            .put_u16(base + 14, self.syn_retransmits as u16);
    }

    /// Growth since `prev`. Gauges are taken as they are now and state
    /// transitions count only when they are new.
    pub fn delta_since(&self, prev: &ConnCounters) -> ConnCounters {
        ConnCounters {
            sent_bytes: self.sent_bytes.saturating_sub(prev.sent_bytes),
            recv_bytes: self.recv_bytes.saturating_sub(prev.recv_bytes),
            sent_packets: self.sent_packets.saturating_sub(prev.sent_packets),
            recv_packets: self.recv_packets.saturating_sub(prev.recv_packets),
            retransmits: self.retransmits.saturating_sub(prev.retransmits),
            syn_retransmits: self.syn_retransmits.saturating_sub(prev.syn_retransmits),
            rtt: self.rtt,
            rtt_var: self.rtt_var,
            established: self.established && !prev.established,
            closed: self.closed && !prev.closed,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.sent_bytes == 0 && self.recv_bytes == 0 && !self.established && !self.closed
    }
}

/// A connection reported by the kernel when it closed, with its final totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedConn {
    pub info: ConnInfo,
    pub counters: ConnCounters,
}

impl ClosedConn {
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let r = Reader::new(buf);
        r.require(CLOSED_EVENT_SIZE)?;
        let info = ConnInfo::decode(&r, 0)?;
        let tcp = (!info.tuple.is_udp()).then_some((&r, CONN_INFO_SIZE + CONN_STATS_SIZE));
        let mut counters = ConnCounters::decode(&r, CONN_INFO_SIZE, tcp)?;
        counters.closed = counters.closed || !info.tuple.is_udp();
        Ok(ClosedConn { info, counters })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(CLOSED_EVENT_SIZE);
        self.info.encode(&mut w, 0);
        self.counters.encode_stats(&mut w, CONN_INFO_SIZE);
        self.counters
            .encode_tcp(&mut w, CONN_INFO_SIZE + CONN_STATS_SIZE);
        w.into_inner()
    }
}
