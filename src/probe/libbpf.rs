//! Probe host backed by libbpf-rs.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use libbpf_rs::{
    KprobeOpts, Link, MapCore, MapFlags, MapHandle, MapType, Object, ObjectBuilder,
    PerfBufferBuilder, RingBufferBuilder, TracepointCategory, TracepointOpts, UprobeOpts,
};
use tracing::{debug, info, warn};

use super::{
    slot_key, CleanupPolicy, HookPoint, HookSpec, ProbeHost, ProbeMap, ProgramHandle,
    ProgramOptions, RawEvent, CONSTANTS_MAP,
};
use crate::channel::{bounded, DropSender};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct LibbpfMap(MapHandle);

impl ProbeMap for LibbpfMap {
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.0.lookup(key, MapFlags::ANY)?)
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.0.update(key, value, MapFlags::ANY)?)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        Ok(self.0.delete(key)?)
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.0.keys().collect())
    }

    fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.0.as_fd())
    }
}

struct Loaded {
    name: String,
    object: Object,
    auto_links: Vec<Link>,
    hooks: Vec<(HookSpec, Link)>,
    pollers: Vec<thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

// libbpf objects and links are only touched while holding the host lock.
unsafe impl Send for Loaded {}

impl Loaded {
    fn map_handle(&self, name: &str) -> Option<MapHandle> {
        let map = self.object.maps().find(|m| m.name() == OsStr::new(name))?;
        MapHandle::try_from(&map).ok()
    }

    fn detach_all(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for poller in self.pollers.drain(..) {
            let _ = poller.join();
        }
        self.hooks.clear();
        self.auto_links.clear();
    }
}

#[derive(Default)]
pub struct LibbpfHost {
    next: AtomicU64,
    programs: Mutex<HashMap<ProgramHandle, Loaded>>,
}

impl LibbpfHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_program<T>(
        &self,
        handle: ProgramHandle,
        f: impl FnOnce(&mut Loaded) -> Result<T>,
    ) -> Result<T> {
        let mut programs = self.programs.lock().unwrap_or_else(|e| e.into_inner());
        let loaded = programs
            .get_mut(&handle)
            .ok_or_else(|| anyhow!("Unknown program {}", handle))?;
        f(loaded)
    }
}

fn is_manual_section(section: &OsStr) -> bool {
    let section = section.to_string_lossy();
    section.starts_with("uprobe") || section.starts_with("uretprobe")
}

impl ProbeHost for LibbpfHost {
    fn load_program(&self, object: &[u8], options: &ProgramOptions) -> Result<ProgramHandle> {
        let mut builder = ObjectBuilder::default();
        let mut open = builder
            .open_memory(object)
            .with_context(|| format!("Failed to open BPF object {}", options.name))?;

        for (name, shared) in &options.shared_maps {
            let Some(fd) = shared.as_fd() else {
                warn!(map = %name, "shared map has no file descriptor, not reusing it");
                continue;
            };
            for mut map in open.maps_mut() {
                if map.name() == OsStr::new(name) {
                    map.reuse_fd(fd)
                        .with_context(|| format!("Failed to reuse map {}", name))?;
                }
            }
        }

        let object = open
            .load()
            .with_context(|| format!("Failed to load BPF object {}", options.name))?;

        if !options.constants.is_empty() {
            let map = object
                .maps()
                .find(|m| m.name() == OsStr::new(CONSTANTS_MAP))
                .ok_or_else(|| anyhow!("{} has no {} map", options.name, CONSTANTS_MAP))?;
            for (i, value) in options.constants.iter().enumerate() {
                map.update(&slot_key(i as u32), &value.to_ne_bytes(), MapFlags::ANY)
                    .with_context(|| format!("Failed to set constant slot {}", i))?;
            }
        }

        let handle = ProgramHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        info!(program = %options.name, %handle, "loaded BPF object");
        self.programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                handle,
                Loaded {
                    name: options.name.clone(),
                    object,
                    auto_links: Vec::new(),
                    hooks: Vec::new(),
                    pollers: Vec::new(),
                    stop: Arc::new(AtomicBool::new(false)),
                },
            );
        Ok(handle)
    }

    fn start(&self, handle: ProgramHandle) -> Result<()> {
        self.with_program(handle, |loaded| {
            let mut links = Vec::new();
            for prog in loaded.object.progs_mut() {
                if is_manual_section(prog.section()) {
                    continue;
                }
                let link = prog.attach().with_context(|| {
                    format!(
                        "Failed to attach {} in {}",
                        prog.name().to_string_lossy(),
                        loaded.name
                    )
                })?;
                links.push(link);
            }
            debug!(program = %loaded.name, links = links.len(), "started");
            loaded.auto_links.extend(links);
            Ok(())
        })
    }

    fn stop(&self, handle: ProgramHandle, policy: CleanupPolicy) -> Result<()> {
        let mut programs = self.programs.lock().unwrap_or_else(|e| e.into_inner());
        match policy {
            CleanupPolicy::DetachOnly => {
                if let Some(loaded) = programs.get_mut(&handle) {
                    loaded.detach_all();
                }
            }
            CleanupPolicy::All => {
                if let Some(mut loaded) = programs.remove(&handle) {
                    loaded.detach_all();
                    info!(program = %loaded.name, "unloaded BPF object");
                }
            }
        }
        Ok(())
    }

    fn get_map(&self, handle: ProgramHandle, name: &str) -> Option<Arc<dyn ProbeMap>> {
        let programs = self.programs.lock().unwrap_or_else(|e| e.into_inner());
        let handle = programs.get(&handle)?.map_handle(name)?;
        Some(Arc::new(LibbpfMap(handle)))
    }

    fn attach_hook(&self, handle: ProgramHandle, spec: &HookSpec) -> Result<()> {
        self.with_program(handle, |loaded| {
            if loaded.hooks.iter().any(|(h, _)| h == spec) {
                bail!("{} is already attached", spec);
            }
            let prog = loaded
                .object
                .progs_mut()
                .find(|p| p.name() == OsStr::new(&spec.program))
                .ok_or_else(|| anyhow!("{} has no program {}", loaded.name, spec.program))?;
            let link = match &spec.point {
                HookPoint::Kprobe(func) => {
                    prog.attach_kprobe_with_opts(false, func, KprobeOpts::default())
                }
                HookPoint::Kretprobe(func) => {
                    prog.attach_kprobe_with_opts(true, func, KprobeOpts::default())
                }
                HookPoint::Tracepoint { category, name } => prog.attach_tracepoint_with_opts(
                    TracepointCategory::Custom(category.clone()),
                    name,
                    TracepointOpts::default(),
                ),
                HookPoint::Uprobe {
                    binary,
                    offset,
                    ret,
                } => prog.attach_uprobe_with_opts(
                    -1,
                    binary,
                    *offset as usize,
                    UprobeOpts {
                        retprobe: *ret,
                        ..Default::default()
                    },
                ),
            }
            .with_context(|| format!("Failed to attach {}", spec))?;
            loaded.hooks.push((spec.clone(), link));
            Ok(())
        })
    }

    fn detach_hook(&self, handle: ProgramHandle, spec: &HookSpec) -> Result<()> {
        self.with_program(handle, |loaded| {
            let Some(pos) = loaded.hooks.iter().position(|(h, _)| h == spec) else {
                bail!("{} is not attached", spec);
            };
            // Dropping the link detaches it.
            loaded.hooks.swap_remove(pos);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        handle: ProgramHandle,
        map: &str,
        capacity: usize,
    ) -> Result<Receiver<RawEvent>> {
        self.with_program(handle, |loaded| {
            let map_handle = loaded
                .map_handle(map)
                .ok_or_else(|| anyhow!("{} has no map {}", loaded.name, map))?;
            let (tx, rx) = bounded(map, capacity);
            let stop = loaded.stop.clone();
            let name = map.to_string();
            let poller = thread::Builder::new()
                .name(format!("poll-{}", map))
                .spawn(move || {
                    if let Err(e) = poll_events(&map_handle, tx, &stop) {
                        warn!(map = %name, "event polling stopped: {:#}", e);
                    }
                })?;
            loaded.pollers.push(poller);
            Ok(rx)
        })
    }
}

fn poll_events(map: &MapHandle, tx: DropSender<RawEvent>, stop: &AtomicBool) -> Result<()> {
    if map.map_type() == MapType::RingBuf {
        let mut builder = RingBufferBuilder::new();
        builder.add(map, move |data: &[u8]| {
            if tx.push(RawEvent {
                cpu: -1,
                data: data.to_vec(),
            }) {
                0
            } else {
                -1
            }
        })?;
        let ring = builder.build()?;
        while !stop.load(Ordering::Relaxed) {
            ring.poll(POLL_INTERVAL)?;
        }
    } else {
        let perf = PerfBufferBuilder::new(map)
            .sample_cb(move |cpu: i32, data: &[u8]| {
                tx.push(RawEvent {
                    cpu,
                    data: data.to_vec(),
                });
            })
            .lost_cb(|cpu: i32, count: u64| {
                warn!(cpu, count, "lost perf events");
            })
            .build()?;
        while !stop.load(Ordering::Relaxed) {
            perf.poll(POLL_INTERVAL)?;
        }
    }
    Ok(())
}
