//! Connection flows from the netflow program.
//!
//! Closed connections arrive as events with their final totals; live
//! connections are read from the stats maps once per interval. Both are
//! reduced to deltas, merged per [`FlowKey`](aggregate::FlowKey) and emitted
//! as one record per flow when the interval closes.

pub mod aggregate;
pub mod event;
pub mod filter;
pub mod listen;
pub mod tags;

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::channel::{bounded, DropSender};
use crate::config::AgentContext;
use crate::conntrack::{ConntrackTable, CONNTRACK_TUPLE_MAP};
use crate::dns::ReverseCache;
use crate::layout::Reader;
use crate::offset::OffsetTable;
use crate::output::{wall_clock_ns, Category, Output};
use crate::probe::{CleanupPolicy, ProbeHost, ProbeMap, ProgramHandle, ProgramOptions, RawEvent};
use crate::process_filter::ProcessFilter;

use aggregate::{AggregateOptions, Aggregator};
use event::{ClosedConn, ConnCounters, ConnInfo};
use listen::{ListenRecorder, LISTEN_CLEAN_INTERVAL};
use tags::{ClusterMetadata, NoClusterMetadata, Tagger};

pub const NETFLOW_PROGRAM: &str = "netflow";
pub const NETFLOW_SOURCE: &str = "netflow";
pub const CLOSED_EVENT_MAP: &str = "bpfmap_closed_event";
pub const CONN_STATS_MAP: &str = "bpfmap_conn_stats";
pub const TCP_STATS_MAP: &str = "bpfmap_conn_tcp_stats";

const EVENT_QUEUE: usize = 8192;
const POLL: Duration = Duration::from_millis(200);

/// Everything a flow is tagged or keyed with besides its own tuple.
#[derive(Clone)]
pub struct Enrichment {
    pub nat: Option<Arc<ConntrackTable>>,
    /// Kernel side translation map, shared into the netflow program.
    pub tuple_map: Option<Arc<dyn ProbeMap>>,
    pub filter: Option<Arc<ProcessFilter>>,
    pub cluster: Arc<dyn ClusterMetadata>,
    pub domains: Option<Arc<ReverseCache>>,
    pub listen: Arc<ListenRecorder>,
}

impl Default for Enrichment {
    fn default() -> Self {
        Self {
            nat: None,
            tuple_map: None,
            filter: None,
            cluster: Arc::new(NoClusterMetadata),
            domains: None,
            listen: Arc::new(ListenRecorder::new()),
        }
    }
}

pub struct NetflowTracker {
    host: Arc<dyn ProbeHost>,
    handle: ProgramHandle,
    output: Arc<dyn Output>,
    aggregator: Aggregator,
    tagger: Tagger,
    listen: Arc<ListenRecorder>,
    interval: Duration,
}

impl NetflowTracker {
    pub fn load(
        ctx: &AgentContext,
        host: Arc<dyn ProbeHost>,
        offsets: &OffsetTable,
        enrichment: Enrichment,
    ) -> Result<Self> {
        let mut options =
            ProgramOptions::new(NETFLOW_PROGRAM).with_constants(offsets.as_constants());
        if let Some(map) = enrichment.tuple_map.clone() {
            options = options.share_map(CONNTRACK_TUPLE_MAP, map);
        }
        let handle = host
            .load_object(&ctx.config.probe_object(NETFLOW_PROGRAM), &options)
            .context("Failed to load netflow program")?;
        if let Err(e) = host.start(handle) {
            let _ = host.stop(handle, CleanupPolicy::All);
            return Err(e.context("Failed to start netflow program"));
        }

        let config = &ctx.config;
        let aggregator = Aggregator::new(
            AggregateOptions {
                ephemeral_port_min: config.ephemeral_port_min(),
                udp: config.netflow_udp,
            },
            enrichment.nat,
            enrichment.listen.clone(),
        );
        let tagger = Tagger::new(
            enrichment.filter,
            enrichment.cluster,
            enrichment.domains,
            config.tags.clone(),
        );
        Ok(Self {
            host,
            handle,
            output: ctx.output.clone(),
            aggregator,
            tagger,
            listen: enrichment.listen,
            interval: Duration::from_secs(config.netflow_interval_secs),
        })
    }

    /// Account one closed-connection event. Malformed events are skipped.
    pub fn handle_closed(&mut self, raw: &[u8]) -> bool {
        match ClosedConn::decode(raw) {
            Ok(closed) => {
                self.aggregator.add_closed(&closed);
                true
            }
            Err(e) => {
                debug!("skipping closed event: {}", e);
                false
            }
        }
    }

    /// Read every live connection from the stats maps.
    pub fn snapshot(&mut self) -> Result<usize> {
        let Some(stats) = self.host.get_map(self.handle, CONN_STATS_MAP) else {
            return Ok(0);
        };
        let tcp = self.host.get_map(self.handle, TCP_STATS_MAP);
        let mut live = Vec::new();
        for key in stats.keys()? {
            let Ok(info) = ConnInfo::decode(&Reader::new(&key), 0) else {
                continue;
            };
            // The entry may be gone by now
            let Some(value) = stats.lookup(&key)? else {
                continue;
            };
            let tcp_value = match (&tcp, info.tuple.is_udp()) {
                (Some(map), false) => map.lookup(&info.tcp_key())?,
                _ => None,
            };
            let stats_reader = Reader::new(&value);
            let tcp_reader = tcp_value.as_deref().map(Reader::new);
            let counters = ConnCounters::decode(&stats_reader, 0, tcp_reader.as_ref().map(|r| (r, 0)));
            match counters {
                Ok(counters) => live.push((info, counters)),
                Err(e) => debug!("skipping connection stats: {}", e),
            }
        }
        let count = live.len();
        self.aggregator.add_snapshot(live);
        Ok(count)
    }

    /// Close the window and emit its flows. Returns how many were emitted.
    pub fn flush(&mut self) -> Result<usize> {
        let time_ns = wall_clock_ns();
        let points: Vec<_> = self
            .aggregator
            .flush()
            .iter()
            .map(|(key, value)| self.tagger.point(key, value, time_ns))
            .collect();
        let count = points.len();
        if count > 0 {
            self.output
                .emit(NETFLOW_SOURCE, Category::Network, points)
                .context("Failed to emit netflow records")?;
        }
        Ok(count)
    }

    /// Start the event drain thread and the `netflow` aggregation thread.
    pub fn spawn(self, cancel: CancelToken) -> Result<Vec<JoinHandle<()>>> {
        let events = self
            .host
            .subscribe(self.handle, CLOSED_EVENT_MAP, EVENT_QUEUE)
            .context("Failed to subscribe to closed connection events")?;
        let (tx, rx) = bounded("netflow-events", EVENT_QUEUE);
        let drain_cancel = cancel.clone();
        let drain = thread::Builder::new()
            .name("netflow-events".to_string())
            .spawn(move || drain_events(events, tx, drain_cancel))?;
        let flows = thread::Builder::new()
            .name("netflow".to_string())
            .spawn(move || self.run(rx, cancel))?;
        Ok(vec![drain, flows])
    }

    fn tick(&mut self) {
        if let Err(e) = self.snapshot() {
            warn!("Failed to read connection stats: {:#}", e);
        }
        match self.flush() {
            Ok(count) => debug!(count, "netflow window emitted"),
            Err(e) => warn!("{:#}", e),
        }
    }

    fn run(mut self, rx: Receiver<Vec<u8>>, cancel: CancelToken) {
        info!(interval = ?self.interval, "netflow tracking started");
        let mut last_tick = Instant::now();
        let mut last_clean = Instant::now();
        while !cancel.is_cancelled() {
            match rx.recv_timeout(POLL) {
                Ok(raw) => {
                    self.handle_closed(&raw);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            let now = Instant::now();
            if now.duration_since(last_tick) >= self.interval {
                self.tick();
                last_tick = now;
            }
            if now.duration_since(last_clean) >= LISTEN_CLEAN_INTERVAL {
                let removed = self.listen.clean_at(now);
                debug!(removed, "listen endpoints cleaned");
                last_clean = now;
            }
        }
        for raw in rx.try_iter() {
            self.handle_closed(&raw);
        }
        self.tick();
        if let Err(e) = self.host.stop(self.handle, CleanupPolicy::All) {
            warn!("Failed to stop netflow program: {:#}", e);
        }
    }
}

fn drain_events(events: Receiver<RawEvent>, tx: DropSender<Vec<u8>>, cancel: CancelToken) {
    while !cancel.is_cancelled() {
        match events.recv_timeout(POLL) {
            Ok(raw) => {
                if !tx.push(raw.data) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
