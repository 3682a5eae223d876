//! In-memory probe host.
//!
//! Records every call, keeps maps in process memory and lets callers inject
//! raw events into subscriptions. Backs the unit and integration tests and
//! the `--dry-run` mode of the binary.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

use super::{
    CleanupPolicy, HookPoint, HookSpec, ProbeHost, ProbeMap, ProgramHandle, ProgramOptions,
    RawEvent,
};
use crate::channel::{bounded, DropSender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Load(String),
    Start(ProgramHandle),
    Stop(ProgramHandle, CleanupPolicy),
    Attach(ProgramHandle, HookSpec),
    Detach(ProgramHandle, HookSpec),
}

#[derive(Default)]
pub struct MemoryMap {
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProbeMap for MemoryMap {
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect())
    }
}

struct MemProgram {
    name: String,
    constants: Vec<u64>,
    maps: HashMap<String, Arc<dyn ProbeMap>>,
    hooks: Vec<HookSpec>,
    subscribers: HashMap<String, DropSender<RawEvent>>,
}

#[derive(Default)]
pub struct InMemoryHost {
    next: AtomicU64,
    programs: Mutex<HashMap<ProgramHandle, MemProgram>>,
    calls: Mutex<Vec<HostCall>>,
    fail_load: Mutex<HashSet<String>>,
    fail_attach: Mutex<HashSet<PathBuf>>,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: HostCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Every attach attempt made so far, successful or not.
    pub fn attach_attempts(&self) -> Vec<HookSpec> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                HostCall::Attach(_, spec) => Some(spec),
                _ => None,
            })
            .collect()
    }

    /// Hooks currently attached across all programs.
    pub fn attached(&self) -> Vec<HookSpec> {
        self.programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flat_map(|p| p.hooks.iter().cloned())
            .collect()
    }

    pub fn handle_of(&self, name: &str) -> Option<ProgramHandle> {
        self.programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(_, p)| p.name == name)
            .map(|(h, _)| *h)
    }

    pub fn constants_of(&self, name: &str) -> Option<Vec<u64>> {
        self.programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|p| p.name == name)
            .map(|p| p.constants.clone())
    }

    /// Make loading the program called `name` fail.
    pub fn fail_load(&self, name: &str) {
        self.fail_load
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
    }

    /// Make uprobe attachment into `binary` fail.
    pub fn fail_attach(&self, binary: PathBuf) {
        self.fail_attach
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(binary);
    }

    /// Deliver `data` to the subscriber of `map` in program `program`.
    /// Returns false if nobody subscribed.
    pub fn inject(&self, program: &str, map: &str, data: Vec<u8>) -> bool {
        let programs = self.programs.lock().unwrap_or_else(|e| e.into_inner());
        programs
            .values()
            .filter(|p| p.name == program)
            .find_map(|p| p.subscribers.get(map))
            .map(|tx| tx.push(RawEvent { cpu: 0, data }))
            .unwrap_or(false)
    }

    /// Close every subscription of `program` so its consumers see end of stream.
    pub fn close_streams(&self, program: &str) {
        let mut programs = self.programs.lock().unwrap_or_else(|e| e.into_inner());
        for p in programs.values_mut().filter(|p| p.name == program) {
            p.subscribers.clear();
        }
    }
}

impl ProbeHost for InMemoryHost {
    /// Object files are never read, so dry runs work without compiled probes.
    fn load_object(&self, _path: &Path, options: &ProgramOptions) -> Result<ProgramHandle> {
        self.load_program(&[], options)
    }

    fn load_program(&self, _object: &[u8], options: &ProgramOptions) -> Result<ProgramHandle> {
        self.record(HostCall::Load(options.name.clone()));
        if self
            .fail_load
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&options.name)
        {
            bail!("Failed to load program {}", options.name);
        }
        let handle = ProgramHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        let maps = options
            .shared_maps
            .iter()
            .map(|(name, map)| (name.clone(), map.clone()))
            .collect();
        self.programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                handle,
                MemProgram {
                    name: options.name.clone(),
                    constants: options.constants.clone(),
                    maps,
                    hooks: Vec::new(),
                    subscribers: HashMap::new(),
                },
            );
        Ok(handle)
    }

    fn start(&self, handle: ProgramHandle) -> Result<()> {
        self.record(HostCall::Start(handle));
        if !self
            .programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&handle)
        {
            bail!("Unknown program {}", handle);
        }
        Ok(())
    }

    fn stop(&self, handle: ProgramHandle, policy: CleanupPolicy) -> Result<()> {
        self.record(HostCall::Stop(handle, policy));
        let mut programs = self.programs.lock().unwrap_or_else(|e| e.into_inner());
        match policy {
            CleanupPolicy::All => {
                programs.remove(&handle);
            }
            CleanupPolicy::DetachOnly => {
                if let Some(p) = programs.get_mut(&handle) {
                    p.hooks.clear();
                    p.subscribers.clear();
                }
            }
        }
        Ok(())
    }

    fn get_map(&self, handle: ProgramHandle, name: &str) -> Option<Arc<dyn ProbeMap>> {
        let mut programs = self.programs.lock().unwrap_or_else(|e| e.into_inner());
        let program = programs.get_mut(&handle)?;
        Some(
            program
                .maps
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryMap::new()))
                .clone(),
        )
    }

    fn attach_hook(&self, handle: ProgramHandle, spec: &HookSpec) -> Result<()> {
        self.record(HostCall::Attach(handle, spec.clone()));
        if let HookPoint::Uprobe { binary, .. } = &spec.point {
            if self
                .fail_attach
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(binary)
            {
                bail!("Failed to attach {}", spec);
            }
        }
        let mut programs = self.programs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(program) = programs.get_mut(&handle) else {
            bail!("Unknown program {}", handle);
        };
        if program.hooks.contains(spec) {
            bail!("{} is already attached", spec);
        }
        program.hooks.push(spec.clone());
        Ok(())
    }

    fn detach_hook(&self, handle: ProgramHandle, spec: &HookSpec) -> Result<()> {
        self.record(HostCall::Detach(handle, spec.clone()));
        let mut programs = self.programs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(program) = programs.get_mut(&handle) else {
            bail!("Unknown program {}", handle);
        };
        let before = program.hooks.len();
        program.hooks.retain(|h| h != spec);
        if program.hooks.len() == before {
            bail!("{} is not attached", spec);
        }
        Ok(())
    }

    fn subscribe(
        &self,
        handle: ProgramHandle,
        map: &str,
        capacity: usize,
    ) -> Result<Receiver<RawEvent>> {
        let mut programs = self.programs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(program) = programs.get_mut(&handle) else {
            bail!("Unknown program {}", handle);
        };
        let (tx, rx) = bounded(map, capacity);
        program.subscribers.insert(map.to_string(), tx);
        Ok(rx)
    }
}
