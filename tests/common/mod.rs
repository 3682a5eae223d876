//! Common test utilities for hostflow integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hostflow::config::{AgentConfig, AgentContext};
use hostflow::output::MemoryOutput;
use hostflow::process::ProcInfo;

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// A config that keeps state under `state_dir` and never reads the
/// ephemeral port range from the running kernel.
pub fn config(state_dir: &Path) -> AgentConfig {
    AgentConfig {
        state_dir: state_dir.to_path_buf(),
        ephemeral_port_min: Some(32768),
        discovery_backoff_ms: 10,
        ..Default::default()
    }
}

pub fn context(config: AgentConfig) -> (AgentContext, Arc<MemoryOutput>) {
    let output = Arc::new(MemoryOutput::new());
    (AgentContext::new(config, output.clone()), output)
}

pub fn proc_info(pid: u32, name: &str, exe: impl Into<PathBuf>, env: &[(&str, &str)]) -> ProcInfo {
    ProcInfo {
        pid,
        ppid: 1,
        name: name.to_string(),
        exe: exe.into(),
        env: env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        start_time: 1000 + pid as u64,
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}
