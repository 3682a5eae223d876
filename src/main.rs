use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use hostflow::agent::{Agent, AgentParts};
use hostflow::config::{AgentConfig, AgentContext};
use hostflow::dns::capture::NoPackets;
use hostflow::offset::sim::{sample_layout, SimulatedKernel};
use hostflow::offset::HostGuessEnv;
use hostflow::output::{LogOutput, Output};
use hostflow::probe::{InMemoryHost, LibbpfHost, ProbeHost};
use hostflow::process::ProcFs;
use hostflow::reslimit::{SysinfoSampler, UsageSampler};

#[derive(Debug, Parser)]
#[command(version, about = "Host network flow and process instrumentation agent")]
struct Command {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Increase log verbosity, repeat for more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Directory holding persisted state such as calibrated offsets
    #[arg(long)]
    state_dir: Option<PathBuf>,
    /// Directory holding the compiled probe objects
    #[arg(long)]
    probe_dir: Option<PathBuf>,
    /// Enable NAT translation through conntrack
    #[arg(long)]
    conntrack: bool,
    /// Enable Go scheduler probes in traced processes
    #[arg(long)]
    trace: bool,
    #[arg(long)]
    no_netflow: bool,
    #[arg(long)]
    no_dnsflow: bool,
    /// Run against an in-memory probe host and a simulated kernel. Needs no
    /// privileges and loads nothing into the kernel.
    #[arg(long)]
    dry_run: bool,
    /// Stop after this many seconds, 0 runs until interrupted
    #[arg(short, long, default_value = "0")]
    duration: u64,
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: 128 << 20,
        rlim_max: 128 << 20,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        bail!("Failed to increase rlimit");
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "hostflow=warn",
        1 => "hostflow=info",
        2 => "hostflow=debug",
        _ => "hostflow=trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn apply_overrides(opts: &Command, config: &mut AgentConfig) {
    if let Some(dir) = &opts.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(dir) = &opts.probe_dir {
        config.probe_dir = dir.clone();
    }
    config.conntrack |= opts.conntrack;
    config.trace |= opts.trace;
    if opts.no_netflow {
        config.netflow = false;
    }
    if opts.no_dnsflow {
        config.dnsflow = false;
    }
}

fn sampler() -> Option<Box<dyn UsageSampler>> {
    match SysinfoSampler::new() {
        Ok(s) => Some(Box::new(s)),
        Err(e) => {
            warn!("resource limiter disabled: {:#}", e);
            None
        }
    }
}

fn parts(opts: &Command, ctx: &AgentContext) -> Result<AgentParts> {
    let procs = Arc::new(ProcFs::new());
    if opts.dry_run {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(1);
        let host: Arc<dyn ProbeHost> = Arc::new(InMemoryHost::new());
        let mut parts = AgentParts::new(
            host,
            procs,
            Box::new(SimulatedKernel::new(sample_layout(), seed)),
        );
        parts.packets = Some(Box::new(NoPackets::new(Duration::from_millis(200))));
        parts.persist_offsets = false;
        parts.sampler = sampler();
        return Ok(parts);
    }

    bump_memlock_rlimit()?;
    let host: Arc<dyn ProbeHost> = Arc::new(LibbpfHost::new());
    let guess = HostGuessEnv::new(host.clone(), ctx.config.clone())
        .context("Failed to set up offset calibration")?;
    let mut parts = AgentParts::new(host, procs, Box::new(guess));
    parts.sampler = sampler();
    Ok(parts)
}

fn main() -> Result<()> {
    let opts = Command::parse();
    init_tracing(opts.verbose);

    let mut config = match &opts.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };
    apply_overrides(&opts, &mut config);
    config.validate()?;

    let output: Arc<dyn Output> = Arc::new(LogOutput::stdout());
    let ctx = AgentContext::new(config, output);
    let parts = parts(&opts, &ctx)?;

    let cancel = ctx.cancel.clone();
    ctrlc::set_handler(move || cancel.cancel()).context("Error setting Ctrl-C handler")?;
    if opts.duration > 0 {
        let cancel = ctx.cancel.clone();
        let duration = Duration::from_secs(opts.duration);
        std::thread::Builder::new()
            .name("duration".to_string())
            .spawn(move || {
                if !cancel.wait_timeout(duration) {
                    info!("duration elapsed, stopping");
                    cancel.cancel();
                }
            })?;
    }

    let agent = Agent::start(ctx, parts)?;
    agent.wait();
    Ok(())
}
