//! Per-process instrumentation decisions.
//!
//! The live table is the only state shared by the scheduling event
//! consumer, the startup scan and the retry queue. Exited processes move
//! into a bounded recency cache so late events can still resolve identity.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::channel::{bounded, DropSender};
use crate::config::AgentConfig;
use crate::probe::ProbeMap;
use crate::process::{ProcInfo, ProcSource};

pub const RECENT_CAPACITY: usize = 4096;
pub const RETRY_CAPACITY: usize = 4096;
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const RETRY_ATTEMPTS: u32 = 5;
/// Most pids taken off the queue between two retry passes.
const RETRY_DRAIN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub ppid: u32,
    pub start_time: u64,
    pub name: String,
    pub exe: PathBuf,
    pub env: BTreeMap<String, String>,
    pub service: String,
    /// Instrument this process at all.
    pub keep: bool,
    /// Attach the secondary, symbol-level probe.
    pub trace: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Drop,
    NoMatch,
}

/// Allow and deny rules plus service name candidates.
#[derive(Debug, Clone, Default)]
pub struct FilterPolicy {
    pub name_allow: HashSet<String>,
    pub env_allow: Vec<String>,
    pub name_deny: HashSet<String>,
    pub env_deny: Vec<String>,
    pub service_env: Vec<String>,
}

impl FilterPolicy {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            name_allow: config.trace_name_allow.iter().cloned().collect(),
            env_allow: config.trace_env_allow.clone(),
            name_deny: config.trace_name_deny.iter().cloned().collect(),
            env_deny: config.trace_env_deny.clone(),
            service_env: config.service_env.clone(),
        }
    }

    fn has_allow_rules(&self) -> bool {
        !self.name_allow.is_empty() || !self.env_allow.is_empty()
    }

    /// The first configured rule kind decides; later kinds are not consulted.
    pub fn verdict(&self, info: &ProcInfo) -> Verdict {
        let has_env = |names: &[String]| names.iter().any(|n| info.env.contains_key(n));
        if !self.name_allow.is_empty() {
            if self.name_allow.contains(&info.name) {
                return Verdict::Keep;
            }
        } else if !self.env_allow.is_empty() {
            if has_env(&self.env_allow) {
                return Verdict::Keep;
            }
        } else if !self.name_deny.is_empty() {
            if self.name_deny.contains(&info.name) {
                return Verdict::Drop;
            }
        } else if !self.env_deny.is_empty() && has_env(&self.env_deny) {
            return Verdict::Drop;
        }
        Verdict::NoMatch
    }

    pub fn service_name(&self, info: &ProcInfo) -> String {
        self.service_env
            .iter()
            .filter_map(|k| info.env.get(k))
            .find(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| info.name.clone())
    }
}

/// Kernel side per-pid early exit.
pub trait PidSuppressor: Send + Sync {
    fn suppress(&self, pid: u32) -> Result<()>;
    fn release(&self, pid: u32) -> Result<()>;
}

pub struct NoopSuppressor;

impl PidSuppressor for NoopSuppressor {
    fn suppress(&self, _pid: u32) -> Result<()> {
        Ok(())
    }

    fn release(&self, _pid: u32) -> Result<()> {
        Ok(())
    }
}

/// Writes `pid -> 1` into the probe host's process filter map.
pub struct MapSuppressor {
    map: Arc<dyn ProbeMap>,
}

impl MapSuppressor {
    pub fn new(map: Arc<dyn ProbeMap>) -> Self {
        Self { map }
    }
}

impl PidSuppressor for MapSuppressor {
    fn suppress(&self, pid: u32) -> Result<()> {
        self.map
            .update(&pid.to_ne_bytes(), &1u32.to_ne_bytes())
            .with_context(|| format!("Failed to suppress pid {}", pid))
    }

    fn release(&self, pid: u32) -> Result<()> {
        // Absent keys are fine, most pids were never suppressed.
        let key = pid.to_ne_bytes();
        if self.map.lookup(&key)?.is_some() {
            self.map.delete(&key)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Recent {
    order: VecDeque<u32>,
    records: HashMap<u32, ProcessRecord>,
}

impl Recent {
    fn insert(&mut self, record: ProcessRecord) {
        let pid = record.pid;
        if self.records.insert(pid, record).is_some() {
            self.order.retain(|p| *p != pid);
        }
        self.order.push_back(pid);
        while self.order.len() > RECENT_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.records.remove(&old);
            }
        }
    }
}

pub struct ProcessFilter {
    policy: FilterPolicy,
    procs: Arc<dyn ProcSource>,
    suppressor: Arc<dyn PidSuppressor>,
    agent_pids: [u32; 2],
    live: RwLock<HashMap<u32, ProcessRecord>>,
    recent: Mutex<Recent>,
    retry_tx: DropSender<u32>,
    retry_rx: Mutex<Option<Receiver<u32>>>,
}

impl ProcessFilter {
    pub fn new(
        policy: FilterPolicy,
        procs: Arc<dyn ProcSource>,
        suppressor: Arc<dyn PidSuppressor>,
    ) -> Self {
        let me = std::process::id();
        let parent = nix::unistd::getppid().as_raw() as u32;
        let (retry_tx, retry_rx) = bounded("process-retry", RETRY_CAPACITY);
        Self {
            policy,
            procs,
            suppressor,
            agent_pids: [me, parent],
            live: RwLock::new(HashMap::new()),
            recent: Mutex::new(Recent::default()),
            retry_tx,
            retry_rx: Mutex::new(Some(retry_rx)),
        }
    }

    /// Treat `pids` as the agent and its parent instead of the real ones.
    pub fn with_agent_pids(mut self, pid: u32, parent: u32) -> Self {
        self.agent_pids = [pid, parent];
        self
    }

    /// Introspect `pid`, decide, and store the record. A process that
    /// cannot be read yet is queued for retry.
    pub fn try_add(&self, pid: u32) -> Result<ProcessRecord> {
        match self.add_once(pid) {
            Ok(record) => Ok(record),
            Err(e) => {
                debug!(pid, "queueing process for retry: {:#}", e);
                self.retry_tx.push(pid);
                Err(e)
            }
        }
    }

    fn add_once(&self, pid: u32) -> Result<ProcessRecord> {
        let info = self.procs.read(pid)?;
        let record = self.decide(info);
        if !record.keep {
            if let Err(e) = self.suppressor.suppress(pid) {
                warn!(pid, "{:#}", e);
            }
        }
        debug!(
            pid,
            name = %record.name,
            keep = record.keep,
            trace = record.trace,
            "process added"
        );
        self.live
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, record.clone());
        Ok(record)
    }

    fn decide(&self, info: ProcInfo) -> ProcessRecord {
        let service = self.policy.service_name(&info);
        let (keep, trace) = if self.agent_pids.contains(&info.pid) {
            (false, false)
        } else {
            match self.policy.verdict(&info) {
                Verdict::Keep => (true, true),
                Verdict::Drop => (false, false),
                Verdict::NoMatch => match self.lookup(info.ppid) {
                    Some(parent) if parent.name == info.name => (parent.keep, parent.trace),
                    _ => {
                        let keep = !self.policy.has_allow_rules();
                        (keep, keep)
                    }
                },
            }
        };
        ProcessRecord {
            pid: info.pid,
            ppid: info.ppid,
            start_time: info.start_time,
            trace: trace && keep && !info.exe.as_os_str().is_empty(),
            keep,
            service,
            name: info.name,
            exe: info.exe,
            env: info.env,
        }
    }

    /// Live table first, then recently exited processes.
    pub fn lookup(&self, pid: u32) -> Option<ProcessRecord> {
        if let Some(record) = self
            .live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pid)
        {
            return Some(record.clone());
        }
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .get(&pid)
            .cloned()
    }

    pub fn delete(&self, pid: u32) {
        let removed = self
            .live
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid);
        if let Some(record) = removed {
            self.recent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(record);
        }
        if let Err(e) = self.suppressor.release(pid) {
            debug!(pid, "{:#}", e);
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Start the retry thread. Each queued pid is retried once per
    /// `interval` until it succeeds or used up its attempts.
    pub fn start_retry(
        self: &Arc<Self>,
        cancel: CancelToken,
        interval: Duration,
    ) -> Result<Option<JoinHandle<()>>> {
        let Some(rx) = self
            .retry_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return Ok(None);
        };
        let filter = self.clone();
        let handle = thread::Builder::new()
            .name("process-retry".to_string())
            .spawn(move || filter.retry_loop(rx, cancel, interval))?;
        Ok(Some(handle))
    }

    fn retry_loop(&self, rx: Receiver<u32>, cancel: CancelToken, interval: Duration) {
        let mut pending: BTreeMap<u32, u32> = BTreeMap::new();
        let mut next_tick = Instant::now() + interval;
        let mut drained = 0;
        while !cancel.is_cancelled() {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(pid) => {
                    pending.entry(pid).or_insert(0);
                    drained += 1;
                    if drained < RETRY_DRAIN && Instant::now() < next_tick {
                        continue;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            drained = 0;
            next_tick = Instant::now() + interval;
            pending.retain(|pid, attempts| {
                *attempts += 1;
                match self.add_once(*pid) {
                    Ok(_) => false,
                    Err(e) => {
                        if *attempts >= RETRY_ATTEMPTS {
                            debug!(pid, attempts = *attempts, "giving up on process: {:#}", e);
                            false
                        } else {
                            true
                        }
                    }
                }
            });
        }
    }
}
