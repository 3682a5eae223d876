//! DNS transaction tracking from raw packet captures.
//!
//! A capture thread lifts DNS messages out of frames and hands them to the
//! `dnsflow` thread, which matches answers to queries, expires unanswered
//! queries and emits one record per key every window. Answers also feed the
//! reverse cache the netflow tagger reads destination domains from.

pub mod aggregate;
pub mod capture;
pub mod packet;
pub mod reverse;
pub mod tracker;

pub use reverse::ReverseCache;

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::channel::{bounded, DropSender};
use crate::config::AgentContext;
use crate::netflow::listen::ListenRecorder;
use crate::output::{wall_clock_ns, Category, Output, Point};

use aggregate::{DnsAggregator, DnsKey, DnsStats, DNS_WINDOW};
use capture::{parse_frame, PacketSource, SNAPLEN};
use packet::DnsMessage;
use tracker::{Captured, QaTracker, Transaction};

pub const DNS_SOURCE: &str = "dnsflow";
const CAPTURE_QUEUE: usize = 4096;
const POLL: Duration = Duration::from_millis(200);
const EXPIRE_INTERVAL: Duration = Duration::from_secs(1);

/// Decode one frame. Anything that is not a well formed DNS message is
/// skipped.
pub fn capture_frame(frame: &[u8], at: Instant) -> Option<Captured> {
    let seg = match parse_frame(frame) {
        Ok(Some(seg)) => seg,
        Ok(None) => return None,
        Err(e) => {
            debug!("skipping frame: {}", e);
            return None;
        }
    };
    let msg = match DnsMessage::decode(seg.payload) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("skipping dns payload: {}", e);
            return None;
        }
    };
    Some(Captured {
        src: (seg.saddr, seg.sport),
        dst: (seg.daddr, seg.dport),
        transport: seg.transport,
        msg,
        at,
    })
}

/// State owned by the `dnsflow` thread.
pub struct DnsFlow {
    tracker: QaTracker,
    window: DnsAggregator,
    reverse: Arc<ReverseCache>,
    tags: BTreeMap<String, String>,
}

impl DnsFlow {
    pub fn new(
        reverse: Arc<ReverseCache>,
        listen: Arc<ListenRecorder>,
        tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            tracker: QaTracker::new(),
            window: DnsAggregator::new(listen),
            reverse,
            tags,
        }
    }

    pub fn handle(&mut self, captured: Captured) {
        let Some(tx) = self.tracker.observe(captured) else {
            return;
        };
        if tx.rcode == 0 {
            self.remember_answers(&tx);
        }
        self.window.add(&tx);
    }

    fn remember_answers(&self, tx: &Transaction) {
        for answer in &tx.answers {
            self.reverse.insert(answer.addr, &tx.domain, answer.ttl);
        }
    }

    /// Move timed out queries into the window.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired = self.tracker.expire(now);
        for tx in &expired {
            self.window.add(tx);
        }
        expired.len()
    }

    pub fn pending(&self) -> usize {
        self.tracker.pending()
    }

    /// Close the window and render its records.
    pub fn flush(&mut self, time_ns: u64) -> Vec<Point> {
        self.window
            .flush()
            .into_iter()
            .map(|(key, stats)| self.point(&key, &stats, time_ns))
            .collect()
    }

    fn point(&self, key: &DnsKey, stats: &DnsStats, time_ns: u64) -> Point {
        let mut p = Point::new(DNS_SOURCE, time_ns);
        for (k, v) in &self.tags {
            p.tag(k, v.as_str());
        }
        let family = if key.client.is_ipv6() { "IPv6" } else { "IPv4" };
        p.tag("src_ip", key.client.to_string())
            .tag("dst_ip", key.server.0.to_string())
            .tag("dst_port", key.server.1.to_string())
            .tag("transport", key.transport.name())
            .tag("family", family)
            .tag("rcode", key.rcode.to_string());
        if !stats.domains.is_empty() {
            let domains: Vec<&str> = stats.domains.iter().map(String::as_str).collect();
            p.tag("dst_domain", domains.join(","));
        }
        p.field("count", stats.count)
            .field("latency", stats.latency_mean().as_nanos() as u64)
            .field("latency_max", stats.latency_max.as_nanos() as u64)
            .field("timeout", stats.timeouts);
        p
    }
}

pub struct DnsTracker {
    output: Arc<dyn Output>,
    flow: DnsFlow,
}

impl DnsTracker {
    pub fn new(ctx: &AgentContext, reverse: Arc<ReverseCache>, listen: Arc<ListenRecorder>) -> Self {
        Self {
            output: ctx.output.clone(),
            flow: DnsFlow::new(reverse, listen, ctx.config.tags.clone()),
        }
    }

    /// Start the capture thread and the `dnsflow` thread.
    pub fn spawn(
        self,
        source: Box<dyn PacketSource>,
        cancel: CancelToken,
    ) -> Result<Vec<JoinHandle<()>>> {
        let (tx, rx) = bounded("dns-capture", CAPTURE_QUEUE);
        let capture_cancel = cancel.clone();
        let capture = thread::Builder::new()
            .name("dns-capture".to_string())
            .spawn(move || capture_loop(source, tx, capture_cancel))?;
        let flow = thread::Builder::new()
            .name("dnsflow".to_string())
            .spawn(move || self.run(rx, cancel))?;
        Ok(vec![capture, flow])
    }

    fn emit(&mut self) {
        let points = self.flow.flush(wall_clock_ns());
        if points.is_empty() {
            return;
        }
        let count = points.len();
        match self.output.emit(DNS_SOURCE, Category::Network, points) {
            Ok(()) => debug!(count, "dns window emitted"),
            Err(e) => warn!("Failed to emit dns records: {:#}", e),
        }
    }

    fn run(mut self, rx: Receiver<Captured>, cancel: CancelToken) {
        info!("dns tracking started");
        let mut last_expire = Instant::now();
        let mut last_flush = Instant::now();
        let mut last_clean = Instant::now();
        while !cancel.is_cancelled() {
            match rx.recv_timeout(POLL) {
                Ok(captured) => self.flow.handle(captured),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            let now = Instant::now();
            if now.duration_since(last_expire) >= EXPIRE_INTERVAL {
                self.flow.expire(now);
                last_expire = now;
            }
            if now.duration_since(last_flush) >= DNS_WINDOW {
                self.emit();
                last_flush = now;
            }
            if now.duration_since(last_clean) >= reverse::CLEAN_INTERVAL {
                let removed = self.flow.reverse.clean_at(now);
                debug!(removed, "reverse cache cleaned");
                last_clean = now;
            }
        }
        for captured in rx.try_iter() {
            self.flow.handle(captured);
        }
        self.emit();
    }
}

fn capture_loop(mut source: Box<dyn PacketSource>, tx: DropSender<Captured>, cancel: CancelToken) {
    let mut buf = vec![0u8; SNAPLEN];
    while !cancel.is_cancelled() {
        match source.next_frame(&mut buf) {
            Ok(Some(n)) => {
                if let Some(captured) = capture_frame(&buf[..n], Instant::now()) {
                    if !tx.push(captured) {
                        break;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("dns capture stopped: {:#}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::capture::tests::frame;
    use crate::dns::capture::Transport;
    use crate::dns::packet::{Answer, TYPE_A};
    use crate::output::{FieldValue, MemoryOutput};
    use std::collections::VecDeque;
    use std::net::IpAddr;

    fn answer_msg() -> DnsMessage {
        let mut msg = DnsMessage::query(5, "example.com", TYPE_A);
        msg.response = true;
        msg.answers.push(Answer {
            name: "example.com".to_string(),
            ttl: 300,
            addr: "93.184.216.34".parse().unwrap(),
        });
        msg
    }

    #[test]
    fn test_answer_feeds_reverse_cache_and_window() {
        let reverse = Arc::new(ReverseCache::new());
        let mut flow = DnsFlow::new(reverse.clone(), Arc::new(ListenRecorder::new()), BTreeMap::new());
        let t0 = Instant::now();
        let query = frame(
            ("10.0.0.5", 41000),
            ("10.0.0.2", 53),
            Transport::Udp,
            false,
            &DnsMessage::query(5, "example.com", TYPE_A).encode(),
        );
        let answer = frame(
            ("10.0.0.2", 53),
            ("10.0.0.5", 41000),
            Transport::Udp,
            false,
            &answer_msg().encode(),
        );
        flow.handle(capture_frame(&query, t0).unwrap());
        flow.handle(capture_frame(&answer, t0 + Duration::from_millis(2)).unwrap());
        assert!(capture_frame(b"garbage", t0).is_none());

        let addr: IpAddr = "93.184.216.34".parse().unwrap();
        assert_eq!(reverse.lookup(&addr).as_deref(), Some("example.com"));

        let points = flow.flush(99);
        assert_eq!(points.len(), 1);
        let p = &points[0];
        assert_eq!(p.tag_value("src_ip"), Some("10.0.0.5"));
        assert_eq!(p.tag_value("dst_port"), Some("53"));
        assert_eq!(p.tag_value("rcode"), Some("0"));
        assert_eq!(p.tag_value("dst_domain"), Some("example.com"));
        assert_eq!(p.field_value("count"), Some(&FieldValue::Uint(1)));
        assert_eq!(p.field_value("latency"), Some(&FieldValue::Uint(2_000_000)));
    }

    struct Frames(VecDeque<Vec<u8>>, CancelToken);

    impl PacketSource for Frames {
        fn next_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
            match self.0.pop_front() {
                Some(f) => {
                    buf[..f.len()].copy_from_slice(&f);
                    Ok(Some(f.len()))
                }
                None => {
                    thread::sleep(Duration::from_millis(300));
                    self.1.cancel();
                    Ok(None)
                }
            }
        }
    }

    #[test]
    fn test_threads_flush_on_cancel() {
        let output = Arc::new(MemoryOutput::new());
        let ctx = AgentContext::new(Default::default(), output.clone());
        let tracker = DnsTracker::new(&ctx, Arc::new(ReverseCache::new()), Arc::new(ListenRecorder::new()));
        let query = frame(
            ("10.0.0.5", 41000),
            ("10.0.0.2", 53),
            Transport::Udp,
            false,
            &DnsMessage::query(5, "example.com", TYPE_A).encode(),
        );
        let answer = frame(
            ("10.0.0.2", 53),
            ("10.0.0.5", 41000),
            Transport::Udp,
            false,
            &answer_msg().encode(),
        );
        let source = Frames(VecDeque::from(vec![query, answer]), ctx.cancel.clone());
        let handles = tracker.spawn(Box::new(source), ctx.cancel.clone()).unwrap();
        for h in handles {
            h.join().unwrap();
        }
        let records = output.records(DNS_SOURCE);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field_value("count"), Some(&FieldValue::Uint(1)));
    }
}
