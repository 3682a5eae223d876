//! Startup and shutdown of every subsystem.
//!
//! Subsystems start in dependency order. A subsystem whose calibration or
//! probe program fails is left out and reported; the rest keep running.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

use crate::config::AgentContext;
use crate::conntrack::ConntrackTracker;
use crate::dns::capture::{AfPacketSource, PacketSource};
use crate::dns::{DnsTracker, ReverseCache};
use crate::netflow::listen::ListenRecorder;
use crate::netflow::tags::{ClusterMetadata, NoClusterMetadata};
use crate::netflow::{Enrichment, NetflowTracker};
use crate::offset::{
    kernel_version, Discoverer, DiscoveryError, DiscoveryOptions, FieldGroup, GuessEnv,
    GuessIdentity, OffsetTable,
};
use crate::probe::{CleanupPolicy, ProbeHost, PROC_FILTER_MAP};
use crate::process::ProcSource;
use crate::process_filter::{
    FilterPolicy, MapSuppressor, NoopSuppressor, PidSuppressor, ProcessFilter, RETRY_INTERVAL,
};
use crate::report::FailureClass;
use crate::reslimit::{ResourceLimiter, UsageSampler};
use crate::sched::{self, SchedTracer};

const CAPTURE_POLL: Duration = Duration::from_millis(200);

/// Collaborators the agent runs against.
pub struct AgentParts {
    pub host: Arc<dyn ProbeHost>,
    pub procs: Arc<dyn ProcSource>,
    /// Kernel side of offset calibration.
    pub guess: Box<dyn GuessEnv>,
    /// None disables the resource limiter.
    pub sampler: Option<Box<dyn UsageSampler>>,
    /// None opens an AF_PACKET socket when DNS tracking is enabled.
    pub packets: Option<Box<dyn PacketSource>>,
    pub cluster: Arc<dyn ClusterMetadata>,
    /// Write the calibrated table back to the state directory.
    pub persist_offsets: bool,
}

impl AgentParts {
    pub fn new(host: Arc<dyn ProbeHost>, procs: Arc<dyn ProcSource>, guess: Box<dyn GuessEnv>) -> Self {
        Self {
            host,
            procs,
            guess,
            sampler: None,
            packets: None,
            cluster: Arc::new(NoClusterMetadata),
            persist_offsets: true,
        }
    }
}

/// Which subsystems came up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subsystems {
    pub limiter: bool,
    pub sched: bool,
    pub uprobes: bool,
    pub conntrack: bool,
    pub netflow: bool,
    pub dns: bool,
}

pub struct Agent {
    ctx: AgentContext,
    offsets: Option<OffsetTable>,
    filter: Option<Arc<ProcessFilter>>,
    running: Subsystems,
    threads: Vec<JoinHandle<()>>,
}

/// Field groups to calibrate for the enabled features.
pub fn required_groups(ctx: &AgentContext) -> Vec<FieldGroup> {
    let config = &ctx.config;
    let mut groups = vec![FieldGroup::Socket];
    if config.trace || config.httpflow {
        groups.extend([FieldGroup::TcpSeq, FieldGroup::HttpFd]);
    }
    if config.conntrack {
        groups.push(FieldGroup::Conntrack);
    }
    groups
}

/// The persisted table is only a starting point, every group is verified
/// again before use.
fn load_hint(ctx: &AgentContext, kernel: u64) -> Option<OffsetTable> {
    let path = ctx.config.offset_file();
    match OffsetTable::load_file(&path) {
        Ok(table) => {
            if table.kernel_version != kernel {
                info!(
                    saved = table.kernel_version,
                    running = kernel,
                    "kernel changed since offsets were saved"
                );
            }
            Some(table)
        }
        Err(e) => {
            debug!("no usable offset hint: {:#}", e);
            None
        }
    }
}

/// Calibrate offsets, starting from the persisted table when it belongs to
/// the running kernel. Returns None when the socket group could not be
/// calibrated.
pub fn discover_offsets(
    ctx: &AgentContext,
    env: &mut dyn GuessEnv,
    persist: bool,
) -> Option<OffsetTable> {
    let kernel = kernel_version().unwrap_or_else(|e| {
        warn!("{:#}", e);
        0
    });
    let hint = load_hint(ctx, kernel);
    let groups = required_groups(ctx);
    let discoverer = Discoverer::new(
        DiscoveryOptions::from_config(&ctx.config, kernel),
        GuessIdentity::current(),
        ctx.cancel.clone(),
    );
    let report = match discoverer.discover(env, hint.as_ref(), &groups) {
        Ok(report) => report,
        Err(DiscoveryError::Cancelled) => return None,
        Err(e) => {
            ctx.reporter
                .report(FailureClass::Calibration, &anyhow!(e).context("offset discovery failed"));
            return None;
        }
    };
    for failure in &report.failures {
        ctx.reporter
            .report(FailureClass::Calibration, &anyhow!(failure.clone()));
    }
    info!(
        advances = report.advances,
        rounds = report.rounds,
        lost = report.lost_rounds,
        "offsets calibrated"
    );
    if persist {
        if let Err(e) = report.table.save(&ctx.config.offset_file()) {
            warn!("{:#}", e);
        }
    }
    Some(report.table)
}

impl Agent {
    /// Bring every enabled subsystem up. Only thread spawn failures are
    /// returned as errors.
    pub fn start(ctx: AgentContext, parts: AgentParts) -> Result<Self> {
        let AgentParts {
            host,
            procs,
            mut guess,
            sampler,
            packets,
            cluster,
            persist_offsets,
        } = parts;
        let config = ctx.config.clone();
        let mut agent = Agent {
            ctx: ctx.clone(),
            offsets: None,
            filter: None,
            running: Subsystems::default(),
            threads: Vec::new(),
        };

        if let Some(sampler) = sampler {
            if let Some(handle) = ResourceLimiter::spawn(&ctx, sampler)? {
                agent.threads.push(handle);
                agent.running.limiter = true;
            }
        }

        agent.offsets = discover_offsets(&ctx, guess.as_mut(), persist_offsets);
        drop(guess);
        if ctx.cancel.is_cancelled() {
            return Ok(agent);
        }
        let offsets = agent.offsets.clone().unwrap_or_default();

        agent.start_sched(host.clone(), procs, &offsets)?;

        let mut enrichment = Enrichment {
            filter: agent.filter.clone(),
            cluster,
            listen: Arc::new(ListenRecorder::new()),
            ..Default::default()
        };
        if config.dnsflow {
            enrichment.domains = Some(Arc::new(ReverseCache::new()));
        }

        if config.conntrack && offsets.is_calibrated(FieldGroup::Conntrack) {
            match ConntrackTracker::load(&ctx, host.clone(), &offsets) {
                Ok(tracker) => {
                    enrichment.nat = Some(tracker.table());
                    enrichment.tuple_map = tracker.tuple_map();
                    agent.threads.push(tracker.spawn(ctx.cancel.clone())?);
                    agent.running.conntrack = true;
                }
                Err(e) => {
                    ctx.reporter.report(FailureClass::ProbeHost, &e);
                }
            }
        }

        if config.netflow && agent.offsets.is_some() {
            match NetflowTracker::load(&ctx, host.clone(), &offsets, enrichment.clone()) {
                Ok(tracker) => {
                    agent.threads.extend(tracker.spawn(ctx.cancel.clone())?);
                    agent.running.netflow = true;
                }
                Err(e) => {
                    ctx.reporter.report(FailureClass::ProbeHost, &e);
                }
            }
        }

        if let Some(domains) = enrichment.domains {
            let source = match packets {
                Some(source) => Ok(source),
                None => AfPacketSource::open(CAPTURE_POLL).map(|s| Box::new(s) as Box<dyn PacketSource>),
            };
            match source {
                Ok(source) => {
                    let tracker = DnsTracker::new(&ctx, domains, enrichment.listen.clone());
                    agent.threads.extend(tracker.spawn(source, ctx.cancel.clone())?);
                    agent.running.dns = true;
                }
                Err(e) => {
                    ctx.reporter.report(FailureClass::ProbeHost, &e);
                }
            }
        }

        info!(running = ?agent.running, "agent started");
        Ok(agent)
    }

    fn start_sched(
        &mut self,
        host: Arc<dyn ProbeHost>,
        procs: Arc<dyn ProcSource>,
        offsets: &OffsetTable,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let handle = match sched::load_program(ctx, host.as_ref(), offsets) {
            Ok(handle) => handle,
            Err(e) => {
                ctx.reporter.report(FailureClass::ProbeHost, &e);
                return Ok(());
            }
        };
        let suppressor: Arc<dyn PidSuppressor> = match host.get_map(handle, PROC_FILTER_MAP) {
            Some(map) => Arc::new(MapSuppressor::new(map)),
            None => Arc::new(NoopSuppressor),
        };
        let filter = Arc::new(ProcessFilter::new(
            FilterPolicy::from_config(&ctx.config),
            procs.clone(),
            suppressor,
        ));
        let mut tracer =
            SchedTracer::with_handle(host.clone(), handle, filter.clone(), procs, ctx.reporter.clone());
        let uprobes = ctx.config.trace && offsets.is_calibrated(FieldGroup::HttpFd);
        if !uprobes {
            tracer = tracer.without_uprobes();
        }
        match tracer.spawn(ctx.cancel.clone()) {
            Ok(thread) => self.threads.push(thread),
            Err(e) => {
                ctx.reporter.report(FailureClass::ProbeHost, &e);
                if let Err(e) = host.stop(handle, CleanupPolicy::All) {
                    warn!("Failed to stop sched program: {:#}", e);
                }
                return Ok(());
            }
        }
        if let Some(thread) = filter.start_retry(ctx.cancel.clone(), RETRY_INTERVAL)? {
            self.threads.push(thread);
        }
        self.filter = Some(filter);
        self.running.sched = true;
        self.running.uprobes = uprobes;
        Ok(())
    }

    pub fn running(&self) -> &Subsystems {
        &self.running
    }

    pub fn offsets(&self) -> Option<&OffsetTable> {
        self.offsets.as_ref()
    }

    pub fn filter(&self) -> Option<&Arc<ProcessFilter>> {
        self.filter.as_ref()
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    /// Block until something cancels the agent, then join every thread.
    pub fn wait(self) {
        self.ctx.cancel.wait();
        self.join();
    }

    pub fn shutdown(self) {
        self.ctx.cancel.cancel();
        self.join();
    }

    fn join(self) {
        for handle in self.threads {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                warn!(thread = %name, "thread panicked");
            }
        }
        info!("agent stopped");
    }
}
