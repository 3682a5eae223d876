//! Process introspection via /proc.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{anyhow, Context, Result};

/// What /proc tells us about one process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    /// Executable as reachable from the agent's mount namespace. Empty for
    /// kernel threads and processes whose exe link cannot be read.
    pub exe: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Start time in clock ticks since boot.
    pub start_time: u64,
}

pub trait ProcSource: Send + Sync {
    fn read(&self, pid: u32) -> Result<ProcInfo>;

    /// Every pid currently running.
    fn pids(&self) -> Result<Vec<u32>>;
}

/// Parse the fields of /proc/pid/stat that follow the parenthesised comm,
/// returning (ppid, starttime).
fn parse_stat(stat: &str) -> Option<(u32, u64)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state (field 3 of the stat line)
    let ppid = fields.get(1)?.parse().ok()?;
    let start_time = fields.get(19)?.parse().ok()?;
    Some((ppid, start_time))
}

fn parse_environ(raw: &[u8]) -> BTreeMap<String, String> {
    raw.split(|b| *b == 0)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            let (k, v) = entry.split_once('=')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

/// Resolve a path as seen by `pid` through its root, so binaries inside
/// other mount namespaces stay reachable.
pub fn resolve_proc_path(proc_root: &Path, pid: u32, path: &Path) -> PathBuf {
    let relative = path.strip_prefix("/").unwrap_or(path);
    proc_root.join(pid.to_string()).join("root").join(relative)
}

/// Read the exe link for a process.
pub fn read_exe_path(proc_root: &Path, pid: u32) -> Option<PathBuf> {
    let exe = fs::read_link(proc_root.join(pid.to_string()).join("exe")).ok()?;
    let text = exe.to_string_lossy();
    // Replaced binaries keep running from the unlinked inode
    match text.strip_suffix(" (deleted)") {
        Some(stripped) => Some(PathBuf::from(stripped)),
        None => Some(exe),
    }
}

/// /proc backed source.
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ProcSource for ProcFs {
    fn read(&self, pid: u32) -> Result<ProcInfo> {
        let dir = self.root.join(pid.to_string());
        let name = fs::read_to_string(dir.join("comm"))
            .with_context(|| format!("Failed to read comm of pid {}", pid))?
            .trim_end()
            .to_string();
        let stat = fs::read_to_string(dir.join("stat"))
            .with_context(|| format!("Failed to read stat of pid {}", pid))?;
        let (ppid, start_time) =
            parse_stat(&stat).ok_or_else(|| anyhow!("Malformed stat for pid {}", pid))?;
        let exe = read_exe_path(&self.root, pid)
            .map(|exe| resolve_proc_path(&self.root, pid, &exe))
            .unwrap_or_default();
        let env = fs::read(dir.join("environ"))
            .map(|raw| parse_environ(&raw))
            .unwrap_or_default();
        Ok(ProcInfo {
            pid,
            ppid,
            name,
            exe,
            env,
            start_time,
        })
    }

    fn pids(&self) -> Result<Vec<u32>> {
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list {}", self.root.display()))?
        {
            let entry = entry?;
            if let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }
}

/// Fixed process table for tests and dry runs.
#[derive(Default)]
pub struct StaticProcs {
    procs: RwLock<HashMap<u32, ProcInfo>>,
}

impl StaticProcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: ProcInfo) {
        self.procs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(info.pid, info);
    }

    pub fn remove(&self, pid: u32) {
        self.procs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid);
    }
}

impl ProcSource for StaticProcs {
    fn read(&self, pid: u32) -> Result<ProcInfo> {
        self.procs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pid)
            .cloned()
            .ok_or_else(|| anyhow!("no such process {}", pid))
    }

    fn pids(&self) -> Result<Vec<u32>> {
        let mut pids: Vec<u32> = self
            .procs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_with_spaces_in_comm() {
        let stat = "1234 (my (weird) app) S 1 1234 1234 0 -1 4194560 100 0 0 0 \
                    5 3 0 0 20 0 1 0 987654 1000000 200 18446744073709551615";
        assert_eq!(parse_stat(stat), Some((1, 987654)));
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn test_parse_environ() {
        let env = parse_environ(b"DD_SERVICE=web\0PATH=/bin:/usr/bin\0BROKEN\0EMPTY=\0");
        assert_eq!(env.get("DD_SERVICE").map(String::as_str), Some("web"));
        assert_eq!(env.get("EMPTY").map(String::as_str), Some(""));
        assert!(!env.contains_key("BROKEN"));
    }

    #[test]
    fn test_resolve_proc_path() {
        assert_eq!(
            resolve_proc_path(Path::new("/proc"), 42, Path::new("/usr/bin/app")),
            PathBuf::from("/proc/42/root/usr/bin/app")
        );
    }

    #[test]
    fn test_read_self() {
        let procs = ProcFs::new();
        let me = procs.read(std::process::id()).unwrap();
        assert!(!me.name.is_empty());
        assert!(me.ppid > 0);
        assert!(procs.pids().unwrap().contains(&std::process::id()));
    }

    #[test]
    fn test_static_procs() {
        let procs = StaticProcs::new();
        procs.insert(ProcInfo {
            pid: 7,
            name: "app".into(),
            ..Default::default()
        });
        assert_eq!(procs.read(7).unwrap().name, "app");
        procs.remove(7);
        assert!(procs.read(7).is_err());
    }
}
