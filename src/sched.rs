//! Scheduling tracer.
//!
//! Drains fork/exec/exit events from the `sched` program, keeps the process
//! filter current and places the Go scheduler uprobe into every trace
//! eligible binary. Attach state is kept per binary path so an unchanged
//! binary is instrumented once, and a replaced binary (new mtime) has its
//! stale probe detached before the fresh one goes in.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::AgentContext;
use crate::layout::{DecodeError, Reader, Writer};
use crate::offset::OffsetTable;
use crate::probe::{CleanupPolicy, HookSpec, ProbeHost, ProgramHandle, ProgramOptions, RawEvent};
use crate::process::ProcSource;
use crate::process_filter::ProcessFilter;
use crate::report::{FailureClass, LastErrorReporter};
use crate::symbols::{self, Resolution, GO_SCHED_SYMBOL};

pub const SCHED_PROGRAM: &str = "sched";
pub const SCHED_EVENT_MAP: &str = "bpfmap_sched_event";
/// Program inside the `sched` object attached at `runtime.execute`.
pub const GO_EXECUTE_PROGRAM: &str = "uprobe_go_execute";

const EVENT_QUEUE: usize = 4096;
const POLL: Duration = Duration::from_millis(200);

const KIND_FORK: u32 = 1;
const KIND_EXEC: u32 = 2;
const KIND_EXIT: u32 = 3;
const EVENT_SIZE: usize = 24;

/// Event layout: kind u32, pid u32, ppid u32, pad u32, ktime u64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedEvent {
    Fork { pid: u32, ppid: u32 },
    Exec { pid: u32 },
    Exit { pid: u32 },
}

impl SchedEvent {
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let r = Reader::new(buf);
        r.require(EVENT_SIZE)?;
        let pid = r.u32(4)?;
        match r.u32(0)? {
            KIND_FORK => Ok(SchedEvent::Fork {
                pid,
                ppid: r.u32(8)?,
            }),
            KIND_EXEC => Ok(SchedEvent::Exec { pid }),
            KIND_EXIT => Ok(SchedEvent::Exit { pid }),
            kind => Err(DecodeError::Invalid {
                field: "sched event kind",
                value: kind as u64,
            }),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(EVENT_SIZE);
        match *self {
            SchedEvent::Fork { pid, ppid } => w.put_u32(0, KIND_FORK).put_u32(4, pid).put_u32(8, ppid),
            SchedEvent::Exec { pid } => w.put_u32(0, KIND_EXEC).put_u32(4, pid),
            SchedEvent::Exit { pid } => w.put_u32(0, KIND_EXIT).put_u32(4, pid),
        };
        w.into_inner()
    }
}

/// What we know about one binary path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRecord {
    pub mtime: SystemTime,
    /// The uprobe currently placed in this binary, if any.
    pub attached: Option<HookSpec>,
    /// Attachment was attempted for this mtime and did not succeed.
    pub failed: bool,
}

/// First 16 hex digits of the SHA-256 of `data`.
pub fn short_id(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

pub struct SchedTracer {
    host: Arc<dyn ProbeHost>,
    handle: ProgramHandle,
    filter: Arc<ProcessFilter>,
    procs: Arc<dyn ProcSource>,
    reporter: Arc<LastErrorReporter>,
    binaries: HashMap<PathBuf, AttachRecord>,
    /// (content id, mtime) pairs whose attachment failed.
    failures: HashSet<(String, SystemTime)>,
    uprobes: bool,
}

/// Load and start the `sched` program configured with the discovered
/// offsets. Its process filter map must exist before the filter does.
pub fn load_program(
    ctx: &AgentContext,
    host: &dyn ProbeHost,
    offsets: &OffsetTable,
) -> Result<ProgramHandle> {
    let options = ProgramOptions::new(SCHED_PROGRAM).with_constants(offsets.as_constants());
    let handle = host
        .load_object(&ctx.config.probe_object(SCHED_PROGRAM), &options)
        .context("Failed to load sched program")?;
    if let Err(e) = host.start(handle) {
        let _ = host.stop(handle, CleanupPolicy::All);
        return Err(e.context("Failed to start sched program"));
    }
    Ok(handle)
}

impl SchedTracer {
    pub fn load(
        ctx: &AgentContext,
        host: Arc<dyn ProbeHost>,
        filter: Arc<ProcessFilter>,
        procs: Arc<dyn ProcSource>,
        offsets: &OffsetTable,
    ) -> Result<Self> {
        let handle = load_program(ctx, host.as_ref(), offsets)?;
        Ok(Self::with_handle(
            host,
            handle,
            filter,
            procs,
            ctx.reporter.clone(),
        ))
    }

    pub fn with_handle(
        host: Arc<dyn ProbeHost>,
        handle: ProgramHandle,
        filter: Arc<ProcessFilter>,
        procs: Arc<dyn ProcSource>,
        reporter: Arc<LastErrorReporter>,
    ) -> Self {
        Self {
            host,
            handle,
            filter,
            procs,
            reporter,
            binaries: HashMap::new(),
            failures: HashSet::new(),
            uprobes: true,
        }
    }

    /// Keep the process filter current without placing any uprobe.
    pub fn without_uprobes(mut self) -> Self {
        self.uprobes = false;
        self
    }

    pub fn attach_record(&self, binary: &Path) -> Option<&AttachRecord> {
        self.binaries.get(binary)
    }

    /// Run the exec logic for every process already running.
    pub fn startup_scan(&mut self) -> Result<usize> {
        let pids = self.procs.pids().context("Failed to list processes")?;
        for pid in &pids {
            self.on_exec(*pid);
        }
        info!(processes = pids.len(), "startup scan done");
        Ok(pids.len())
    }

    pub fn handle_event(&mut self, event: SchedEvent) {
        match event {
            SchedEvent::Fork { pid, ppid } => debug!(pid, ppid, "fork"),
            SchedEvent::Exec { pid } => self.on_exec(pid),
            SchedEvent::Exit { pid } => self.filter.delete(pid),
        }
    }

    fn on_exec(&mut self, pid: u32) {
        let record = match self.filter.try_add(pid) {
            Ok(record) => record,
            Err(e) => {
                debug!(pid, "{:#}", e);
                return;
            }
        };
        if !record.trace || !self.uprobes {
            return;
        }
        if let Err(e) = self.ensure_attached(&record.exe) {
            self.reporter
                .report(FailureClass::Attachment, &e.context(format!("pid {pid}")));
        }
    }

    fn ensure_attached(&mut self, binary: &Path) -> Result<()> {
        let mtime = fs::metadata(binary)
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to stat {}", binary.display()))?;

        if let Some(known) = self.binaries.get(binary) {
            if known.mtime == mtime {
                return Ok(());
            }
            info!(binary = %binary.display(), "binary changed, re-attaching");
            if let Some(stale) = known.attached.clone() {
                if let Err(e) = self.host.detach_hook(self.handle, &stale) {
                    warn!(binary = %binary.display(), "Failed to detach stale probe: {:#}", e);
                }
            }
            self.binaries.remove(binary);
        }

        let mut record = AttachRecord {
            mtime,
            attached: None,
            failed: false,
        };
        let result = self.attach(binary, mtime);
        match &result {
            Ok(spec) => record.attached = spec.clone(),
            Err(_) => record.failed = true,
        }
        self.binaries.insert(binary.to_path_buf(), record);
        result.map(|_| ())
    }

    /// Returns the placed hook, or None when the binary is not a Go program.
    fn attach(&mut self, binary: &Path, mtime: SystemTime) -> Result<Option<HookSpec>> {
        let data =
            fs::read(binary).with_context(|| format!("Failed to read {}", binary.display()))?;
        let id = short_id(&data);
        if self.failures.contains(&(id.clone(), mtime)) {
            debug!(binary = %binary.display(), id = %id, "skipping binary that failed before");
            return Ok(None);
        }
        let result = self.place_probe(binary, &data);
        if result.is_err() {
            self.failures.insert((id, mtime));
        }
        result
    }

    fn place_probe(&self, binary: &Path, data: &[u8]) -> Result<Option<HookSpec>> {
        let resolution = symbols::resolve(data, GO_SCHED_SYMBOL)
            .with_context(|| format!("Failed to inspect {}", binary.display()))?;
        let symbol = match resolution {
            Resolution::Resolved(symbol) => symbol,
            Resolution::NotFound => return Ok(None),
            Resolution::Ambiguous(addrs) => {
                return Err(anyhow!(
                    "{} has {} candidates for {}",
                    binary.display(),
                    addrs.len(),
                    GO_SCHED_SYMBOL
                ))
            }
        };
        let spec = HookSpec::uprobe(GO_EXECUTE_PROGRAM, binary.to_path_buf(), symbol.file_offset);
        self.host
            .attach_hook(self.handle, &spec)
            .with_context(|| format!("Failed to attach {}", spec))?;
        info!(
            binary = %binary.display(),
            offset = symbol.file_offset,
            strategy = %symbol.strategy,
            "attached Go scheduler probe"
        );
        Ok(Some(spec))
    }

    /// Drain `events` until cancelled or the stream closes, then release the
    /// program and every uprobe placed through it.
    pub fn run(mut self, events: Receiver<RawEvent>, cancel: CancelToken) {
        while !cancel.is_cancelled() {
            match events.recv_timeout(POLL) {
                Ok(raw) => match SchedEvent::decode(&raw.data) {
                    Ok(event) => self.handle_event(event),
                    Err(e) => debug!("skipping sched event: {}", e),
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if let Err(e) = self.host.stop(self.handle, CleanupPolicy::All) {
            warn!("Failed to stop sched program: {:#}", e);
        }
    }

    /// Scan running processes, then consume live events on a new thread.
    pub fn spawn(mut self, cancel: CancelToken) -> Result<JoinHandle<()>> {
        let events = self
            .host
            .subscribe(self.handle, SCHED_EVENT_MAP, EVENT_QUEUE)
            .context("Failed to subscribe to sched events")?;
        if let Err(e) = self.startup_scan() {
            warn!("{:#}", e);
        }
        let handle = thread::Builder::new()
            .name("sched".to_string())
            .spawn(move || self.run(events, cancel))?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemoryOutput;
    use crate::probe::{HookPoint, InMemoryHost};
    use crate::process::{ProcInfo, StaticProcs};
    use crate::process_filter::{FilterPolicy, NoopSuppressor};
    use crate::symbols::tests::{go_table, stripped_go_elf};
    use std::fs::File;

    struct Fixture {
        host: Arc<InMemoryHost>,
        procs: Arc<StaticProcs>,
        output: Arc<MemoryOutput>,
        tracer: SchedTracer,
        dir: tempfile::TempDir,
    }

    fn fixture(policy: FilterPolicy) -> Fixture {
        let host = Arc::new(InMemoryHost::new());
        let handle = host
            .load_program(&[], &ProgramOptions::new(SCHED_PROGRAM))
            .unwrap();
        let procs = Arc::new(StaticProcs::new());
        let filter = Arc::new(
            ProcessFilter::new(policy, procs.clone(), Arc::new(NoopSuppressor))
                .with_agent_pids(1_000_000, 1_000_001),
        );
        let output = Arc::new(MemoryOutput::new());
        let reporter = Arc::new(LastErrorReporter::new("hostflow", output.clone()));
        let tracer = SchedTracer::with_handle(host.clone(), handle, filter, procs.clone(), reporter);
        Fixture {
            host,
            procs,
            output,
            tracer,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    impl Fixture {
        fn binary(&self, name: &str, data: &[u8]) -> PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, data).unwrap();
            path
        }

        fn spawn_proc(&self, pid: u32, name: &str, exe: &Path) {
            self.procs.insert(ProcInfo {
                pid,
                ppid: 1,
                name: name.to_string(),
                exe: exe.to_path_buf(),
                ..Default::default()
            });
        }
    }

    fn bump_mtime(path: &Path) {
        let later = fs::metadata(path).unwrap().modified().unwrap() + Duration::from_secs(60);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(later)
            .unwrap();
    }

    #[test]
    fn test_event_decode() {
        let fork = SchedEvent::Fork { pid: 10, ppid: 1 };
        assert_eq!(SchedEvent::decode(&fork.encode()).unwrap(), fork);
        assert!(SchedEvent::decode(&[0; 8]).is_err());
        let mut bad = SchedEvent::Exit { pid: 3 }.encode();
        bad[0] = 9;
        assert!(matches!(
            SchedEvent::decode(&bad),
            Err(DecodeError::Invalid { .. })
        ));
    }

    #[test]
    fn test_short_id() {
        let id = short_id(b"hello");
        assert_eq!(id, "2cf24dba5fb0a30e");
    }

    #[test]
    fn test_go_binary_attached_once() {
        let mut f = fixture(FilterPolicy::default());
        let exe = f.binary("server", &stripped_go_elf(".gopclntab", &go_table()));
        f.spawn_proc(10, "server", &exe);
        f.spawn_proc(11, "server", &exe);

        f.tracer.handle_event(SchedEvent::Exec { pid: 10 });
        f.tracer.handle_event(SchedEvent::Exec { pid: 11 });

        let attempts = f.host.attach_attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(
            attempts[0].point,
            HookPoint::Uprobe {
                binary: exe.clone(),
                offset: 0x1200,
                ret: false
            }
        );
        let record = f.tracer.attach_record(&exe).unwrap();
        assert!(record.attached.is_some());
        assert!(!record.failed);
    }

    #[test]
    fn test_replaced_binary_is_reattached() {
        let mut f = fixture(FilterPolicy::default());
        let exe = f.binary("server", &stripped_go_elf(".gopclntab", &go_table()));
        f.spawn_proc(10, "server", &exe);
        f.tracer.handle_event(SchedEvent::Exec { pid: 10 });

        bump_mtime(&exe);
        f.spawn_proc(12, "server", &exe);
        f.tracer.handle_event(SchedEvent::Exec { pid: 12 });

        let calls = f.host.calls();
        let detach = calls
            .iter()
            .position(|c| matches!(c, crate::probe::memory::HostCall::Detach(..)))
            .expect("stale probe detached");
        let last_attach = calls
            .iter()
            .rposition(|c| matches!(c, crate::probe::memory::HostCall::Attach(..)))
            .unwrap();
        assert!(detach < last_attach);
        assert_eq!(f.host.attached().len(), 1);
    }

    #[test]
    fn test_non_go_binary_is_not_probed() {
        let mut f = fixture(FilterPolicy::default());
        let exe = std::env::current_exe().unwrap();
        f.spawn_proc(10, "tests", &exe);
        f.tracer.handle_event(SchedEvent::Exec { pid: 10 });
        assert!(f.host.attach_attempts().is_empty());
        let record = f.tracer.attach_record(&exe).unwrap();
        assert!(record.attached.is_none());
        assert!(!record.failed);
    }

    #[test]
    fn test_attach_failure_is_cached_by_content() {
        let mut f = fixture(FilterPolicy::default());
        let data = stripped_go_elf(".gopclntab", &go_table());
        let exe = f.binary("server", &data);
        f.host.fail_attach(exe.clone());
        f.spawn_proc(10, "server", &exe);
        f.tracer.handle_event(SchedEvent::Exec { pid: 10 });
        f.spawn_proc(11, "server", &exe);
        f.tracer.handle_event(SchedEvent::Exec { pid: 11 });

        assert_eq!(f.host.attach_attempts().len(), 1);
        assert!(f.tracer.attach_record(&exe).unwrap().failed);
        let errors = f.output.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].1.starts_with("attachment"));
    }

    #[test]
    fn test_denied_process_never_attached() {
        let policy = FilterPolicy {
            name_deny: ["server".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let mut f = fixture(policy);
        let exe = f.binary("server", &stripped_go_elf(".gopclntab", &go_table()));
        f.spawn_proc(10, "server", &exe);
        f.tracer.handle_event(SchedEvent::Fork { pid: 10, ppid: 1 });
        f.tracer.handle_event(SchedEvent::Exec { pid: 10 });
        assert!(f.host.attach_attempts().is_empty());
        assert!(f.tracer.attach_record(&exe).is_none());
    }

    #[test]
    fn test_uprobes_disabled() {
        let mut f = fixture(FilterPolicy::default());
        f.tracer = f.tracer.without_uprobes();
        let exe = f.binary("server", &stripped_go_elf(".gopclntab", &go_table()));
        f.spawn_proc(10, "server", &exe);
        f.tracer.handle_event(SchedEvent::Exec { pid: 10 });
        assert!(f.host.attach_attempts().is_empty());
        assert!(f.tracer.filter.lookup(10).unwrap().trace);
    }

    #[test]
    fn test_startup_scan_and_exit() {
        let mut f = fixture(FilterPolicy::default());
        let exe = f.binary("server", &stripped_go_elf(".gopclntab", &go_table()));
        f.spawn_proc(20, "server", &exe);
        f.spawn_proc(21, "server", &exe);
        assert_eq!(f.tracer.startup_scan().unwrap(), 2);
        assert_eq!(f.tracer.filter.live_count(), 2);

        f.tracer.handle_event(SchedEvent::Exit { pid: 20 });
        assert_eq!(f.tracer.filter.live_count(), 1);
        assert!(f.tracer.filter.lookup(20).is_some());
    }

    #[test]
    fn test_run_stops_program_on_cancel() {
        let f = fixture(FilterPolicy::default());
        let cancel = CancelToken::new();
        let handle = f.tracer.handle;
        let events = f.host.subscribe(handle, SCHED_EVENT_MAP, 16).unwrap();
        f.host.inject(SCHED_PROGRAM, SCHED_EVENT_MAP, vec![1, 2, 3]);
        cancel.cancel();
        f.tracer.run(events, cancel);
        assert!(f.host.handle_of(SCHED_PROGRAM).is_none());
    }
}
