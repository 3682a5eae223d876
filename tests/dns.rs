mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::ip;
use hostflow::dns::capture::Transport;
use hostflow::dns::packet::{Answer, DnsMessage, TYPE_A};
use hostflow::dns::tracker::{Captured, Endpoint};
use hostflow::dns::{DnsFlow, ReverseCache};
use hostflow::netflow::listen::ListenRecorder;
use hostflow::output::FieldValue;

const CLIENT: &str = "10.0.0.5";
const RESOLVER: &str = "10.0.0.2";

fn flow() -> (DnsFlow, Arc<ReverseCache>) {
    flow_with(Arc::new(ListenRecorder::new()))
}

fn flow_with(listen: Arc<ListenRecorder>) -> (DnsFlow, Arc<ReverseCache>) {
    let reverse = Arc::new(ReverseCache::new());
    let mut tags = BTreeMap::new();
    tags.insert("host".to_string(), "node-1".to_string());
    let flow = DnsFlow::new(reverse.clone(), listen, tags);
    (flow, reverse)
}

fn client(port: u16) -> Endpoint {
    (ip(CLIENT), port)
}

fn resolver() -> Endpoint {
    (ip(RESOLVER), 53)
}

fn query(id: u16, name: &str, port: u16, at: Instant) -> Captured {
    Captured {
        src: client(port),
        dst: resolver(),
        transport: Transport::Udp,
        msg: DnsMessage::query(id, name, TYPE_A),
        at,
    }
}

fn answer(id: u16, name: &str, addr: &str, port: u16, at: Instant) -> Captured {
    let mut msg = DnsMessage::query(id, name, TYPE_A);
    msg.response = true;
    msg.answers.push(Answer {
        name: name.to_string(),
        ttl: 120,
        addr: ip(addr),
    });
    Captured {
        src: resolver(),
        dst: client(port),
        transport: Transport::Udp,
        msg,
        at,
    }
}

#[test]
fn test_unanswered_query_times_out_once() {
    let (mut flow, _reverse) = flow();
    let t0 = Instant::now();
    flow.handle(query(1, "slow.example.com", 40000, t0));
    assert_eq!(flow.pending(), 1);

    assert_eq!(flow.expire(t0 + Duration::from_secs(3)), 0);
    assert_eq!(flow.expire(t0 + Duration::from_secs(7)), 1);
    assert_eq!(flow.expire(t0 + Duration::from_secs(8)), 0);
    assert_eq!(flow.pending(), 0);

    // The answer arrives after the query was given up on
    flow.handle(answer(1, "slow.example.com", "192.0.2.1", 40000, t0 + Duration::from_secs(9)));

    let points = flow.flush(1);
    assert_eq!(points.len(), 1);
    let p = &points[0];
    assert_eq!(p.tag_value("rcode"), Some("-1"));
    assert_eq!(p.tag_value("dst_domain"), Some("slow.example.com"));
    assert_eq!(p.tag_value("host"), Some("node-1"));
    assert_eq!(p.field_value("count"), Some(&FieldValue::Uint(1)));
    assert_eq!(p.field_value("timeout"), Some(&FieldValue::Uint(1)));
    assert!(flow.flush(2).is_empty());
}

#[test]
fn test_window_aggregates_by_client_and_server() {
    let (mut flow, reverse) = flow();
    let t0 = Instant::now();
    let latencies = [2u64, 4, 9];
    for (i, ms) in latencies.iter().enumerate() {
        let id = i as u16 + 10;
        // Each query comes from its own ephemeral port
        let port = 40000 + i as u16;
        let name = format!("svc{i}.example.com");
        flow.handle(query(id, &name, port, t0));
        flow.handle(answer(
            id,
            &name,
            &format!("192.0.2.{}", i + 1),
            port,
            t0 + Duration::from_millis(*ms),
        ));
    }
    assert_eq!(flow.pending(), 0);
    assert_eq!(
        reverse.lookup(&ip("192.0.2.3")).as_deref(),
        Some("svc2.example.com")
    );

    let points = flow.flush(1);
    assert_eq!(points.len(), 1);
    let p = &points[0];
    assert_eq!(p.tag_value("src_ip"), Some(CLIENT));
    assert_eq!(p.tag_value("dst_ip"), Some(RESOLVER));
    assert_eq!(p.tag_value("dst_port"), Some("53"));
    assert_eq!(p.tag_value("transport"), Some("udp"));
    assert_eq!(p.tag_value("rcode"), Some("0"));
    assert_eq!(
        p.tag_value("dst_domain"),
        Some("svc0.example.com,svc1.example.com,svc2.example.com")
    );
    assert_eq!(p.field_value("count"), Some(&FieldValue::Uint(3)));
    assert_eq!(p.field_value("latency"), Some(&FieldValue::Uint(5_000_000)));
    assert_eq!(p.field_value("latency_max"), Some(&FieldValue::Uint(9_000_000)));
    assert_eq!(p.field_value("timeout"), Some(&FieldValue::Uint(0)));
}

#[test]
fn test_failed_lookup_is_kept_apart_and_not_cached() {
    let (mut flow, reverse) = flow();
    let t0 = Instant::now();
    flow.handle(query(1, "ok.example.com", 40000, t0));
    flow.handle(answer(1, "ok.example.com", "192.0.2.1", 40000, t0 + Duration::from_millis(1)));

    flow.handle(query(2, "broken.example.com", 40001, t0));
    let mut failed = answer(2, "broken.example.com", "192.0.2.9", 40001, t0 + Duration::from_millis(1));
    failed.msg.rcode = 2;
    flow.handle(failed);

    assert!(reverse.lookup(&ip("192.0.2.9")).is_none());
    let points = flow.flush(1);
    let rcodes: Vec<_> = points.iter().filter_map(|p| p.tag_value("rcode")).collect();
    assert_eq!(rcodes, vec!["0", "2"]);
}

#[test]
fn test_server_seen_listening_swaps_roles() {
    let listen = Arc::new(ListenRecorder::new());
    listen.insert(ip(RESOLVER));
    let (mut flow, _reverse) = flow_with(listen);
    let t0 = Instant::now();
    flow.handle(query(5, "peer.example.com", 40000, t0));
    flow.handle(answer(5, "peer.example.com", "192.0.2.5", 40000, t0 + Duration::from_millis(3)));

    let points = flow.flush(1);
    assert_eq!(points.len(), 1);
    let p = &points[0];
    assert_eq!(p.tag_value("src_ip"), Some(RESOLVER));
    assert_eq!(p.tag_value("dst_ip"), Some(CLIENT));
    assert_eq!(p.tag_value("dst_port"), Some("40000"));
    assert_eq!(p.field_value("count"), Some(&FieldValue::Uint(1)));
}
