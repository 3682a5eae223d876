use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::cancel::CancelToken;
use crate::output::Output;
use crate::report::LastErrorReporter;

/// Default directory for persisted state (the offset table).
pub const DEFAULT_STATE_DIR: &str = "/usr/local/hostflow/state";
/// Default directory holding the compiled probe objects.
pub const DEFAULT_PROBE_DIR: &str = "/usr/local/hostflow/probes";

pub const DEFAULT_SERVICE_ENV: [&str; 4] = [
    "DKE_SERVICE",
    "DK_BPFTRACE_SERVICE",
    "DD_SERVICE",
    "OTEL_SERVICE_NAME",
];

/// Resource limits enforced by the watchdog. Zero disables a limit.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Fraction of total machine CPU capacity the agent may use (0.0 - 1.0).
    pub cpu: f64,
    /// Resident memory in bytes.
    #[serde(deserialize_with = "de_byte_size")]
    pub memory: u64,
    /// Network bandwidth (received + transmitted) in bytes per second.
    #[serde(deserialize_with = "de_byte_size")]
    pub bandwidth: u64,
}

impl ResourceLimits {
    pub fn is_unlimited(&self) -> bool {
        self.cpu <= 0.0 && self.memory == 0 && self.bandwidth == 0
    }
}

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Enable connection flow tracking
    pub netflow: bool,
    /// Enable DNS transaction tracking
    pub dnsflow: bool,
    /// Enable NAT translation through conntrack
    pub conntrack: bool,
    /// Enable the scheduling tracer and managed-runtime secondary probes
    pub trace: bool,
    /// Calibrate the TCP sequence and file table offsets used by HTTP tracing
    pub httpflow: bool,
    /// Skip the IPv6 socket experiment
    pub ipv6_disabled: bool,
    /// Report UDP flows as well as TCP
    pub netflow_udp: bool,

    pub trace_name_allow: Vec<String>,
    pub trace_env_allow: Vec<String>,
    pub trace_name_deny: Vec<String>,
    pub trace_env_deny: Vec<String>,
    /// Ordered environment variables consulted for the service name
    pub service_env: Vec<String>,

    pub limits: ResourceLimits,

    pub state_dir: PathBuf,
    pub probe_dir: PathBuf,

    /// Netflow aggregation window in seconds
    pub netflow_interval_secs: u64,
    /// Lowest ephemeral port, read from the kernel when unset
    pub ephemeral_port_min: Option<u16>,
    /// Sleep between offset discovery attempts in milliseconds
    pub discovery_backoff_ms: u64,

    /// Tags attached to every emitted record
    pub tags: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            netflow: true,
            dnsflow: true,
            conntrack: false,
            trace: false,
            httpflow: false,
            ipv6_disabled: false,
            netflow_udp: true,
            trace_name_allow: Vec::new(),
            trace_env_allow: Vec::new(),
            trace_name_deny: Vec::new(),
            trace_env_deny: Vec::new(),
            service_env: DEFAULT_SERVICE_ENV.iter().map(|s| s.to_string()).collect(),
            limits: ResourceLimits::default(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            probe_dir: PathBuf::from(DEFAULT_PROBE_DIR),
            netflow_interval_secs: 60,
            ephemeral_port_min: None,
            discovery_backoff_ms: 5000,
            tags: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&data).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let config: AgentConfig = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.netflow_interval_secs == 0 {
            bail!("netflow_interval_secs must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.limits.cpu) {
            bail!("limits.cpu must be a fraction between 0 and 1");
        }
        Ok(())
    }

    /// Path of the persisted offset table.
    pub fn offset_file(&self) -> PathBuf {
        self.state_dir.join("hostflow.offset")
    }

    /// Path of the compiled probe object named `name`.
    pub fn probe_object(&self, name: &str) -> PathBuf {
        self.probe_dir.join(format!("{name}.bpf.o"))
    }

    pub fn ephemeral_port_min(&self) -> u16 {
        self.ephemeral_port_min
            .or_else(read_ephemeral_port_min)
            .unwrap_or(32768)
    }
}

fn read_ephemeral_port_min() -> Option<u16> {
    let range = fs::read_to_string("/proc/sys/net/ipv4/ip_local_port_range").ok()?;
    range.split_whitespace().next()?.parse().ok()
}

fn size_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(\d+(?:\.\d+)?)\s*([kKmMgGtT]?)(i?)[bB]?\s*$").expect("valid size regex")
    })
}

/// Parse a byte size such as `4096`, `10MB`, `1G` or `512MiB`.
///
/// Suffixes with `i` are powers of 1024, plain suffixes powers of 1000.
pub fn parse_byte_size(s: &str) -> Result<u64> {
    let Some(caps) = size_regex().captures(s) else {
        bail!("Invalid byte size '{}'", s);
    };
    let value: f64 = caps[1]
        .parse()
        .with_context(|| format!("Invalid byte size '{}'", s))?;
    let base: f64 = if caps[3].is_empty() { 1000.0 } else { 1024.0 };
    let exp = match caps[2].to_ascii_lowercase().as_str() {
        "" => 0,
        "k" => 1,
        "m" => 2,
        "g" => 3,
        _ => 4,
    };
    Ok((value * base.powi(exp)) as u64)
}

fn de_byte_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Num(u64),
        Text(String),
    }
    match Size::deserialize(deserializer)? {
        Size::Num(n) => Ok(n),
        Size::Text(s) => parse_byte_size(&s).map_err(serde::de::Error::custom),
    }
}

/// Everything a component needs from its environment, built once at startup
/// and passed by reference into every constructor.
#[derive(Clone)]
pub struct AgentContext {
    pub config: Arc<AgentConfig>,
    pub cancel: CancelToken,
    pub output: Arc<dyn Output>,
    pub reporter: Arc<LastErrorReporter>,
}

impl AgentContext {
    pub fn new(config: AgentConfig, output: Arc<dyn Output>) -> Self {
        let reporter = Arc::new(LastErrorReporter::new("hostflow", output.clone()));
        Self {
            config: Arc::new(config),
            cancel: CancelToken::new(),
            output,
            reporter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("4096").unwrap(), 4096);
        assert_eq!(parse_byte_size("10MB").unwrap(), 10_000_000);
        assert_eq!(parse_byte_size("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_byte_size("512MiB").unwrap(), 512 << 20);
        assert_eq!(parse_byte_size("1.5Ki").unwrap(), 1536);
        assert!(parse_byte_size("lots").is_err());
        assert!(parse_byte_size("10 parsecs").is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = AgentConfig::from_json("{}").unwrap();
        assert!(config.netflow);
        assert!(!config.conntrack);
        assert_eq!(config.service_env[0], "DKE_SERVICE");
        assert_eq!(config.service_env.len(), 4);
        assert_eq!(
            config.offset_file(),
            PathBuf::from("/usr/local/hostflow/state/hostflow.offset")
        );
    }

    #[test]
    fn test_config_from_json() {
        let config = AgentConfig::from_json(
            r#"{
                "conntrack": true,
                "trace_name_deny": ["sshd"],
                "limits": {"cpu": 0.25, "memory": "512MiB", "bandwidth": 1000000},
                "tags": {"host": "node-1"}
            }"#,
        )
        .unwrap();
        assert!(config.conntrack);
        assert_eq!(config.trace_name_deny, vec!["sshd".to_string()]);
        assert_eq!(config.limits.memory, 512 << 20);
        assert_eq!(config.limits.bandwidth, 1_000_000);
        assert_eq!(config.tags["host"], "node-1");
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(AgentConfig::from_json(r#"{"netflow_interval_secs": 0}"#).is_err());
        assert!(AgentConfig::from_json(r#"{"limits": {"cpu": 2.0}}"#).is_err());
        assert!(AgentConfig::from_json(r#"{"limits": {"memory": "huge"}}"#).is_err());
    }
}
