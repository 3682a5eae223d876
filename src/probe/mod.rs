//! Probe host boundary.
//!
//! Loading kernel programs, attaching them and draining their buffers is
//! delegated to a [`ProbeHost`]. Event buffers are not delivered through
//! callbacks: each subscription is a bounded channel of [`RawEvent`]s that a
//! subsystem drains on its own thread.

pub mod libbpf;
pub mod memory;

use std::fmt;
use std::fs;
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use anyhow::{Context, Result};

pub use libbpf::LibbpfHost;
pub use memory::InMemoryHost;

/// Array map every program reads its configured constants from. Slot `i`
/// holds `ProgramOptions::constants[i]`.
pub const CONSTANTS_MAP: &str = "bpfmap_constants";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub u64);

impl fmt::Display for ProgramHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prog#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Drop every attachment but keep the program and its maps loaded.
    DetachOnly,
    /// Detach and unload, releasing all maps.
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    Kprobe(String),
    Kretprobe(String),
    Tracepoint { category: String, name: String },
    /// Userspace instrumentation point at a byte offset inside a binary.
    Uprobe {
        binary: PathBuf,
        offset: u64,
        ret: bool,
    },
}

/// Which program of a loaded object to attach, and where.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HookSpec {
    pub program: String,
    pub point: HookPoint,
}

impl HookSpec {
    pub fn uprobe(program: &str, binary: PathBuf, offset: u64) -> Self {
        Self {
            program: program.to_string(),
            point: HookPoint::Uprobe {
                binary,
                offset,
                ret: false,
            },
        }
    }

    pub fn kprobe(program: &str, func: &str) -> Self {
        Self {
            program: program.to_string(),
            point: HookPoint::Kprobe(func.to_string()),
        }
    }
}

impl fmt::Display for HookSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.point {
            HookPoint::Kprobe(func) => write!(f, "{} kprobe:{}", self.program, func),
            HookPoint::Kretprobe(func) => write!(f, "{} kretprobe:{}", self.program, func),
            HookPoint::Tracepoint { category, name } => {
                write!(f, "{} tracepoint:{}:{}", self.program, category, name)
            }
            HookPoint::Uprobe {
                binary,
                offset,
                ret,
            } => write!(
                f,
                "{} {}:{}+{:#x}",
                self.program,
                if *ret { "uretprobe" } else { "uprobe" },
                binary.display(),
                offset
            ),
        }
    }
}

/// Options applied when a program object is loaded.
#[derive(Clone, Default)]
pub struct ProgramOptions {
    pub name: String,
    /// Written into [`CONSTANTS_MAP`] right after load.
    pub constants: Vec<u64>,
    /// Maps owned by another program that this object should reuse by name.
    pub shared_maps: Vec<(String, Arc<dyn ProbeMap>)>,
}

impl ProgramOptions {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_constants(mut self, constants: Vec<u64>) -> Self {
        self.constants = constants;
        self
    }

    pub fn share_map(mut self, name: &str, map: Arc<dyn ProbeMap>) -> Self {
        self.shared_maps.push((name.to_string(), map));
        self
    }
}

/// One event drained from a perf or ring buffer. `cpu` is -1 for ring buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub cpu: i32,
    pub data: Vec<u8>,
}

/// Typed key/value map exposed by a loaded program.
pub trait ProbeMap: Send + Sync {
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn update(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    /// Snapshot of all keys currently in the map.
    fn keys(&self) -> Result<Vec<Vec<u8>>>;
    /// File descriptor for sharing the map with another program, if any.
    fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

pub trait ProbeHost: Send + Sync {
    fn load_program(&self, object: &[u8], options: &ProgramOptions) -> Result<ProgramHandle>;
    /// Load a compiled object from disk.
    fn load_object(&self, path: &Path, options: &ProgramOptions) -> Result<ProgramHandle> {
        let object =
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        self.load_program(&object, options)
    }
    /// Attach every program whose hook point is fully described by the object.
    fn start(&self, handle: ProgramHandle) -> Result<()>;
    fn stop(&self, handle: ProgramHandle, policy: CleanupPolicy) -> Result<()>;
    fn get_map(&self, handle: ProgramHandle, name: &str) -> Option<Arc<dyn ProbeMap>>;
    fn attach_hook(&self, handle: ProgramHandle, spec: &HookSpec) -> Result<()>;
    fn detach_hook(&self, handle: ProgramHandle, spec: &HookSpec) -> Result<()>;
    /// Drain the perf or ring buffer map `map` into a bounded channel.
    fn subscribe(
        &self,
        handle: ProgramHandle,
        map: &str,
        capacity: usize,
    ) -> Result<Receiver<RawEvent>>;
}

/// Key used by single-slot maps.
pub fn slot_key(index: u32) -> [u8; 4] {
    index.to_ne_bytes()
}

/// Suppression map shared with kernel-side programs: pids present in the map
/// are skipped early.
pub const PROC_FILTER_MAP: &str = "bpfmap_proc_filter";
