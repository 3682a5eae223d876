//! NAT translation through the kernel connection tracker.
//!
//! The `conntrack` program hooks conntrack confirm/destroy and reports
//! every entry whose reply tuple is not simply the mirror of its original
//! tuple, i.e. every translated connection. The table maps the locally
//! observed original tuple to its reply tuple.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::AgentContext;
use crate::conn::{ConnTuple, CONN_L3_MASK, CONN_L4_MASK};
use crate::layout::{DecodeError, Reader, Writer};
use crate::offset::OffsetTable;
use crate::probe::{CleanupPolicy, ProbeHost, ProbeMap, ProgramHandle, ProgramOptions, RawEvent};

pub const CONNTRACK_PROGRAM: &str = "conntrack";
pub const CONNTRACK_EVENT_MAP: &str = "bpfmap_conntrack_event";
/// Kernel side translation map, shared with the netflow program.
pub const CONNTRACK_TUPLE_MAP: &str = "bpfmap_conntrack_tuple";

const KIND_INSERT: u32 = 1;
const KIND_DELETE: u32 = 2;

const TUPLE_SIZE: usize = 40;
const EVENT_SIZE: usize = 8 + 2 * TUPLE_SIZE;
const EVENT_QUEUE: usize = 4096;
const POLL: Duration = Duration::from_millis(200);

/// One conntrack entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConntrackTuple {
    pub origin: ConnTuple,
    pub reply: ConnTuple,
    pub netns: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConntrackEvent {
    Insert(ConntrackTuple),
    Delete(ConntrackTuple),
}

// Tuple layout: saddr[16], daddr[16], sport u16, dport u16, meta u32.
fn decode_tuple(r: &Reader, base: usize) -> Result<ConnTuple, DecodeError> {
    let meta = r.u32(base + 36)?;
    let ipv6 = crate::conn::is_ipv6(meta);
    Ok(ConnTuple::new(
        r.addr(base, ipv6)?,
        r.u16(base + 32)?,
        r.addr(base + 16, ipv6)?,
        r.u16(base + 34)?,
        meta,
    ))
}

fn encode_tuple(w: &mut Writer, base: usize, t: &ConnTuple) {
    w.put_addr(base, &t.saddr)
        .put_addr(base + 16, &t.daddr)
        .put_u16(base + 32, t.sport)
        .put_u16(base + 34, t.dport)
        .put_u32(base + 36, t.meta);
}

impl ConntrackEvent {
    /// Layout: kind u32, netns u32, origin tuple, reply tuple.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let r = Reader::new(buf);
        r.require(EVENT_SIZE)?;
        let entry = ConntrackTuple {
            origin: decode_tuple(&r, 8)?,
            reply: decode_tuple(&r, 8 + TUPLE_SIZE)?,
            netns: r.u32(4)?,
        };
        match r.u32(0)? {
            KIND_INSERT => Ok(ConntrackEvent::Insert(entry)),
            KIND_DELETE => Ok(ConntrackEvent::Delete(entry)),
            kind => Err(DecodeError::Invalid {
                field: "conntrack event kind",
                value: kind as u64,
            }),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (kind, entry) = match self {
            ConntrackEvent::Insert(e) => (KIND_INSERT, e),
            ConntrackEvent::Delete(e) => (KIND_DELETE, e),
        };
        let mut w = Writer::new(EVENT_SIZE);
        w.put_u32(0, kind).put_u32(4, entry.netns);
        encode_tuple(&mut w, 8, &entry.origin);
        encode_tuple(&mut w, 8 + TUPLE_SIZE, &entry.reply);
        w.into_inner()
    }
}

/// Only protocol and family take part in the lookup key.
fn normalize(t: &ConnTuple) -> ConnTuple {
    ConnTuple {
        meta: t.meta & (CONN_L3_MASK | CONN_L4_MASK),
        ..*t
    }
}

/// Translation table, readable from any thread.
#[derive(Default)]
pub struct ConntrackTable {
    entries: DashMap<ConnTuple, ConntrackTuple>,
}

impl ConntrackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: ConntrackTuple) {
        if entry.reply == entry.origin.reversed() {
            // Not translated, nothing to resolve
            return;
        }
        self.entries.insert(normalize(&entry.origin), entry);
    }

    pub fn remove(&self, origin: &ConnTuple) {
        self.entries.remove(&normalize(origin));
    }

    /// The reply tuple of a translated connection, or None if the tuple is
    /// not known to be translated.
    pub fn resolve(&self, tuple: &ConnTuple) -> Option<ConnTuple> {
        self.entries.get(&normalize(tuple)).map(|e| e.reply)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn apply(&self, event: ConntrackEvent) {
        match event {
            ConntrackEvent::Insert(entry) => self.insert(entry),
            ConntrackEvent::Delete(entry) => self.remove(&entry.origin),
        }
    }
}

pub struct ConntrackTracker {
    host: Arc<dyn ProbeHost>,
    handle: ProgramHandle,
    table: Arc<ConntrackTable>,
}

impl ConntrackTracker {
    pub fn load(ctx: &AgentContext, host: Arc<dyn ProbeHost>, offsets: &OffsetTable) -> Result<Self> {
        let options =
            ProgramOptions::new(CONNTRACK_PROGRAM).with_constants(offsets.as_constants());
        let handle = host
            .load_object(&ctx.config.probe_object(CONNTRACK_PROGRAM), &options)
            .context("Failed to load conntrack program")?;
        if let Err(e) = host.start(handle) {
            let _ = host.stop(handle, CleanupPolicy::All);
            return Err(e.context("Failed to start conntrack program"));
        }
        Ok(Self {
            host,
            handle,
            table: Arc::new(ConntrackTable::new()),
        })
    }

    pub fn table(&self) -> Arc<ConntrackTable> {
        self.table.clone()
    }

    /// Kernel side translation map for programs that resolve in the kernel.
    pub fn tuple_map(&self) -> Option<Arc<dyn ProbeMap>> {
        self.host.get_map(self.handle, CONNTRACK_TUPLE_MAP)
    }

    pub fn spawn(self, cancel: CancelToken) -> Result<JoinHandle<()>> {
        let events = self
            .host
            .subscribe(self.handle, CONNTRACK_EVENT_MAP, EVENT_QUEUE)
            .context("Failed to subscribe to conntrack events")?;
        if let Some(map) = self.tuple_map() {
            match resync(&self.table, map.as_ref()) {
                Ok(loaded) => debug!(loaded, "existing translations loaded"),
                Err(e) => warn!("Failed to read conntrack map: {:#}", e),
            }
        }
        let handle = thread::Builder::new()
            .name("conntrack".to_string())
            .spawn(move || self.run(events, cancel))?;
        Ok(handle)
    }

    fn run(self, events: Receiver<RawEvent>, cancel: CancelToken) {
        info!("conntrack tracking started");
        while !cancel.is_cancelled() {
            match events.recv_timeout(POLL) {
                Ok(raw) => match ConntrackEvent::decode(&raw.data) {
                    Ok(event) => self.table.apply(event),
                    Err(e) => debug!("skipping conntrack event: {}", e),
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if let Err(e) = self.host.stop(self.handle, CleanupPolicy::All) {
            warn!("Failed to stop conntrack program: {:#}", e);
        }
    }
}

/// Load the translations already present in the kernel map.
pub fn resync(table: &ConntrackTable, map: &dyn ProbeMap) -> Result<usize> {
    let mut loaded = 0;
    for key in map.keys()? {
        let Some(value) = map.lookup(&key)? else {
            continue;
        };
        let r_key = Reader::new(&key);
        let r_value = Reader::new(&value);
        let (Ok(origin), Ok(reply)) = (decode_tuple(&r_key, 0), decode_tuple(&r_value, 0)) else {
            continue;
        };
        table.insert(ConntrackTuple {
            origin,
            reply,
            netns: 0,
        });
        loaded += 1;
    }
    Ok(loaded)
}

/// Encode a tuple the way the kernel map keys it.
pub fn tuple_key(t: &ConnTuple) -> Vec<u8> {
    let mut w = Writer::new(TUPLE_SIZE);
    encode_tuple(&mut w, 0, t);
    w.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{CONN_DIRECTION_INCOMING, CONN_L4_UDP};
    use crate::probe::memory::MemoryMap;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn service_entry() -> ConntrackTuple {
        // Pod 10.0.0.5 talks to a ClusterIP that is DNATed to 10.1.2.3:8080
        let origin = ConnTuple::new(ip("10.0.0.5"), 41000, ip("10.96.0.10"), 80, 0);
        let reply = ConnTuple::new(ip("10.1.2.3"), 8080, ip("10.0.0.5"), 41000, 0);
        ConntrackTuple {
            origin,
            reply,
            netns: 4026531840,
        }
    }

    #[test]
    fn test_resolve_translated_tuple() {
        let table = ConntrackTable::new();
        let entry = service_entry();
        table.apply(ConntrackEvent::Insert(entry));
        assert_eq!(table.resolve(&entry.origin), Some(entry.reply));

        // Direction bits do not take part in the lookup
        let mut incoming = entry.origin;
        incoming.meta |= CONN_DIRECTION_INCOMING;
        assert_eq!(table.resolve(&incoming), Some(entry.reply));

        let mut udp = entry.origin;
        udp.meta |= CONN_L4_UDP;
        assert_eq!(table.resolve(&udp), None);
    }

    #[test]
    fn test_unknown_tuple_is_not_found() {
        let table = ConntrackTable::new();
        let other = ConnTuple::new(ip("10.0.0.9"), 1234, ip("10.0.0.1"), 53, 0);
        assert_eq!(table.resolve(&other), None);
    }

    #[test]
    fn test_untranslated_and_deleted_entries() {
        let table = ConntrackTable::new();
        let origin = ConnTuple::new(ip("10.0.0.5"), 41000, ip("10.0.0.6"), 80, 0);
        table.insert(ConntrackTuple {
            origin,
            reply: origin.reversed(),
            netns: 1,
        });
        assert!(table.is_empty());

        let entry = service_entry();
        table.apply(ConntrackEvent::Insert(entry));
        table.apply(ConntrackEvent::Delete(entry));
        assert_eq!(table.resolve(&entry.origin), None);
    }

    #[test]
    fn test_event_decode() {
        let event = ConntrackEvent::Insert(service_entry());
        assert_eq!(ConntrackEvent::decode(&event.encode()).unwrap(), event);
        let mut raw = event.encode();
        raw[0] = 7;
        assert!(ConntrackEvent::decode(&raw).is_err());
        assert!(ConntrackEvent::decode(&raw[..20]).is_err());
    }

    #[test]
    fn test_resync_from_map() {
        let map = MemoryMap::new();
        let entry = service_entry();
        map.update(&tuple_key(&entry.origin), &tuple_key(&entry.reply))
            .unwrap();
        map.update(&[1, 2, 3], &[4]).unwrap();
        let table = ConntrackTable::new();
        assert_eq!(resync(&table, &map).unwrap(), 1);
        assert_eq!(table.resolve(&entry.origin), Some(entry.reply));
    }
}
