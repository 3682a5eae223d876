//! Watchdog over the agent's own resource usage.

use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use sysinfo::{
    CpuRefreshKind, Networks, Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System,
};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::{AgentContext, ResourceLimits};
use crate::report::{FailureClass, LastErrorReporter};

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// Consecutive samples over a limit before the agent shuts down.
pub const BREACH_SAMPLES: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    /// Share of total machine CPU capacity, 0.0 - 1.0.
    pub cpu: f64,
    pub memory: u64,
    /// Bytes per second received and transmitted over all interfaces.
    pub bandwidth: u64,
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu {:.1}% memory {} bytes bandwidth {} bytes/s",
            self.cpu * 100.0,
            self.memory,
            self.bandwidth
        )
    }
}

pub trait UsageSampler: Send {
    fn sample(&mut self) -> Result<Usage>;
}

/// Samples this process and the host network counters through sysinfo.
pub struct SysinfoSampler {
    sys: System,
    networks: Networks,
    pid: Pid,
    cpus: usize,
    last: Instant,
}

impl SysinfoSampler {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("Failed to get own pid: {}", e))?;
        let sys = System::new_with_specifics(
            RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing()),
        );
        let cpus = sys.cpus().len().max(1);
        Ok(Self {
            sys,
            networks: Networks::new_with_refreshed_list(),
            pid,
            cpus,
            last: Instant::now(),
        })
    }
}

impl UsageSampler for SysinfoSampler {
    fn sample(&mut self) -> Result<Usage> {
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
        let process = self
            .sys
            .process(self.pid)
            .ok_or_else(|| anyhow!("Own process {} not visible", self.pid))?;

        self.networks.refresh(true);
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64().max(0.001);
        self.last = now;
        let bytes: u64 = self
            .networks
            .iter()
            .map(|(_, data)| data.received() + data.transmitted())
            .sum();

        Ok(Usage {
            cpu: process.cpu_usage() as f64 / 100.0 / self.cpus as f64,
            memory: process.memory(),
            bandwidth: (bytes as f64 / elapsed) as u64,
        })
    }
}

/// Which limits a sample exceeds, if any.
pub fn breached(limits: &ResourceLimits, usage: &Usage) -> Vec<&'static str> {
    let mut over = Vec::new();
    if limits.cpu > 0.0 && usage.cpu > limits.cpu {
        over.push("cpu");
    }
    if limits.memory > 0 && usage.memory > limits.memory {
        over.push("memory");
    }
    if limits.bandwidth > 0 && usage.bandwidth > limits.bandwidth {
        over.push("bandwidth");
    }
    over
}

pub struct ResourceLimiter {
    limits: ResourceLimits,
    sampler: Box<dyn UsageSampler>,
    interval: Duration,
    streak: u32,
}

impl ResourceLimiter {
    pub fn new(limits: ResourceLimits, sampler: Box<dyn UsageSampler>) -> Self {
        Self {
            limits,
            sampler,
            interval: SAMPLE_INTERVAL,
            streak: 0,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Take one sample. Returns an error once a breach has lasted
    /// [`BREACH_SAMPLES`] samples in a row.
    pub fn check(&mut self) -> Result<()> {
        let usage = match self.sampler.sample() {
            Ok(usage) => usage,
            Err(e) => {
                debug!("resource sample failed: {:#}", e);
                return Ok(());
            }
        };
        let over = breached(&self.limits, &usage);
        if over.is_empty() {
            self.streak = 0;
            return Ok(());
        }
        self.streak += 1;
        debug!(streak = self.streak, limits = ?over, "{}", usage);
        if self.streak >= BREACH_SAMPLES {
            return Err(anyhow!(
                "{} limit exceeded for {} samples: {}",
                over.join(", "),
                self.streak,
                usage
            ));
        }
        Ok(())
    }

    pub fn run(mut self, reporter: &LastErrorReporter, cancel: &CancelToken) {
        while !cancel.wait_timeout(self.interval) {
            if let Err(e) = self.check() {
                reporter.report(FailureClass::ResourceLimit, &e);
                cancel.cancel();
                break;
            }
        }
    }

    /// Start sampling on the `reslimit` thread. Nothing is started when no
    /// limit is configured.
    pub fn spawn(ctx: &AgentContext, sampler: Box<dyn UsageSampler>) -> Result<Option<JoinHandle<()>>> {
        let limits = ctx.config.limits.clone();
        if limits.is_unlimited() {
            info!("no resource limits configured");
            return Ok(None);
        }
        let limiter = ResourceLimiter::new(limits, sampler);
        let reporter = ctx.reporter.clone();
        let cancel = ctx.cancel.clone();
        let handle = thread::Builder::new()
            .name("reslimit".to_string())
            .spawn(move || limiter.run(&reporter, &cancel))?;
        Ok(Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemoryOutput;
    use std::collections::VecDeque;
    use std::sync::Arc;

    struct Scripted(VecDeque<Usage>);

    impl UsageSampler for Scripted {
        fn sample(&mut self) -> Result<Usage> {
            Ok(self.0.pop_front().unwrap_or_default())
        }
    }

    fn mem(bytes: u64) -> Usage {
        Usage {
            memory: bytes,
            ..Default::default()
        }
    }

    fn limits() -> ResourceLimits {
        ResourceLimits {
            memory: 1000,
            ..Default::default()
        }
    }

    #[test]
    fn test_breach_must_persist() {
        let samples = vec![mem(2000), mem(2000), mem(10), mem(2000), mem(2000), mem(2000)];
        let mut limiter = ResourceLimiter::new(limits(), Box::new(Scripted(samples.into())));
        for _ in 0..5 {
            limiter.check().unwrap();
        }
        let err = limiter.check().unwrap_err();
        assert!(err.to_string().contains("memory"));
    }

    #[test]
    fn test_breached_limits() {
        let limits = ResourceLimits {
            cpu: 0.5,
            memory: 0,
            bandwidth: 100,
        };
        let usage = Usage {
            cpu: 0.7,
            memory: u64::MAX,
            bandwidth: 50,
        };
        assert_eq!(breached(&limits, &usage), vec!["cpu"]);
    }

    #[test]
    fn test_run_cancels_and_reports() {
        let output = Arc::new(MemoryOutput::new());
        let reporter = LastErrorReporter::new("hostflow", output.clone());
        let cancel = CancelToken::new();
        let samples = vec![mem(2000); 3];
        ResourceLimiter::new(limits(), Box::new(Scripted(samples.into())))
            .with_interval(Duration::from_millis(1))
            .run(&reporter, &cancel);
        assert!(cancel.is_cancelled());
        let errors = output.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].1.starts_with("resource_limit"));
    }

    #[test]
    #[ignore = "samples the live system"]
    fn test_sysinfo_sampler() {
        let mut sampler = SysinfoSampler::new().unwrap();
        let usage = sampler.sample().unwrap();
        assert!(usage.memory > 0);
    }
}
