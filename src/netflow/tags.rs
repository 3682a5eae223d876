//! Turning an aggregated flow into a tagged record.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::conn::{family_name, ip_type, transport_name};
use crate::dns::ReverseCache;
use crate::netflow::aggregate::{FlowKey, FlowValue};
use crate::output::Point;
use crate::process_filter::ProcessFilter;

pub const NETFLOW_MEASUREMENT: &str = "netflow";
/// Filler for workload tags of the side that did not match.
pub const NO_VALUE: &str = "N/A";

/// Workload identity of one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadTags {
    pub namespace: String,
    pub pod_name: String,
    pub service_name: String,
    pub workload_name: String,
    pub workload_type: String,
}

impl WorkloadTags {
    fn values(&self) -> [(&'static str, &str); 6] {
        [
            ("namespace", self.namespace.as_str()),
            ("pod_name", self.pod_name.as_str()),
            ("service_name", self.service_name.as_str()),
            ("deployment_name", self.workload_name.as_str()),
            ("workload_name", self.workload_name.as_str()),
            ("workload_type", self.workload_type.as_str()),
        ]
    }
}

/// Read-only cluster metadata, refreshed by whoever implements it. A miss
/// never holds a record back.
pub trait ClusterMetadata: Send + Sync {
    fn lookup(&self, pid: u32, ip: IpAddr, port: u16, transport: &str) -> Option<WorkloadTags>;
}

pub struct NoClusterMetadata;

impl ClusterMetadata for NoClusterMetadata {
    fn lookup(&self, _: u32, _: IpAddr, _: u16, _: &str) -> Option<WorkloadTags> {
        None
    }
}

fn port_tag(port: u16) -> String {
    if port == 0 {
        "*".to_string()
    } else {
        port.to_string()
    }
}

pub struct Tagger {
    filter: Option<Arc<ProcessFilter>>,
    cluster: Arc<dyn ClusterMetadata>,
    domains: Option<Arc<ReverseCache>>,
    global: BTreeMap<String, String>,
}

impl Tagger {
    pub fn new(
        filter: Option<Arc<ProcessFilter>>,
        cluster: Arc<dyn ClusterMetadata>,
        domains: Option<Arc<ReverseCache>>,
        global: BTreeMap<String, String>,
    ) -> Self {
        Self {
            filter,
            cluster,
            domains,
            global,
        }
    }

    pub fn point(&self, key: &FlowKey, value: &FlowValue, time_ns: u64) -> Point {
        let mut p = Point::new(NETFLOW_MEASUREMENT, time_ns);
        for (k, v) in &self.global {
            p.tag(k, v.as_str());
        }
        let transport = transport_name(key.meta);
        let incoming = key.tuple().is_incoming();
        let (src_ip, src_port) = (key.saddr.to_string(), port_tag(key.sport));
        let (dst_ip, dst_port) = (key.daddr.to_string(), port_tag(key.dport));

        let (src_type, dst_type) = (ip_type(&key.saddr), ip_type(&key.daddr));

        p.tag("src_ip", src_ip.as_str())
            .tag("src_port", src_port.as_str())
            .tag("src_ip_type", src_type)
            .tag("dst_ip", dst_ip.as_str())
            .tag("dst_port", dst_port.as_str())
            .tag("dst_ip_type", dst_type)
            .tag("transport", transport)
            .tag("family", family_name(key.meta))
            .tag("direction", if incoming { "incoming" } else { "outgoing" })
            .tag("pid", key.pid.to_string());

        // Missing identity only loses these tags, the record still goes out
        if let Some(record) = self.filter.as_ref().and_then(|f| f.lookup(key.pid)) {
            p.tag("process_name", record.name).tag("service", record.service);
        }

        if let Some((ip, port)) = key.nat {
            p.tag("dst_nat_ip", ip.to_string())
                .tag("dst_nat_port", port.to_string());
        }

        if !incoming {
            if let Some(domain) = self.domains.as_ref().and_then(|d| d.lookup(&key.daddr)) {
                p.tag("server_domain", domain.as_str()).tag("dst_domain", domain);
            }
        }

        let (client, server) = if incoming {
            ((&dst_ip, &dst_port, dst_type), (&src_ip, &src_port, src_type))
        } else {
            ((&src_ip, &src_port, src_type), (&dst_ip, &dst_port, dst_type))
        };
        p.tag("conn_side", if incoming { "server" } else { "client" })
            .tag("client_ip", client.0.as_str())
            .tag("client_port", client.1.as_str())
            .tag("client_ip_type", client.2)
            .tag("server_ip", server.0.as_str())
            .tag("server_port", server.1.as_str())
            .tag("server_ip_type", server.2);

        self.workload_tags(&mut p, key, transport, incoming);

        // An incoming socket is the server side
        let (client_sent, server_sent) = if incoming {
            (value.bytes_read, value.bytes_written)
        } else {
            (value.bytes_written, value.bytes_read)
        };
        p.field("bytes_read", value.bytes_read)
            .field("bytes_written", value.bytes_written)
            .field("client_sent", client_sent)
            .field("server_sent", server_sent)
            .field("retransmits", value.retransmits);
        if !key.tuple().is_udp() {
            if let Some((rtt, rtt_var)) = value.rtt() {
                p.field("rtt", rtt).field("rtt_var", rtt_var);
            }
            p.field("tcp_syn_retransmit", value.syn_retransmits)
                .field("tcp_established", value.established)
                .field("tcp_closed", value.closed);
        }
        p
    }

    fn workload_tags(&self, p: &mut Point, key: &FlowKey, transport: &str, incoming: bool) {
        let src = self
            .cluster
            .lookup(key.pid, key.saddr, key.sport, transport);
        let (dst_ip, dst_port) = key.nat.unwrap_or((key.daddr, key.dport));
        let dst = self.cluster.lookup(0, dst_ip, dst_port, transport);
        if src.is_none() && dst.is_none() {
            return;
        }
        let (client, server) = if incoming { (&dst, &src) } else { (&src, &dst) };
        for (prefix, side) in [
            ("src", &src),
            ("dst", &dst),
            ("client", client),
            ("server", server),
        ] {
            let filler = WorkloadTags::default();
            let tags = side.as_ref().unwrap_or(&filler);
            for (name, value) in tags.values() {
                let value = if side.is_some() { value } else { NO_VALUE };
                p.tag(&format!("{prefix}_k8s_{name}"), value);
            }
        }
    }
}
