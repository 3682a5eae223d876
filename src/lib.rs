//! hostflow - host network flow and process instrumentation agent.
//!
//! - [`offset`] - calibrating kernel struct field offsets for the running kernel
//! - [`process_filter`] - per-process instrumentation decisions and identity
//! - [`sched`] - fork/exec/exit tracking and Go scheduler uprobe placement
//! - [`symbols`] - symbol resolution, including stripped Go binaries
//! - [`netflow`], [`conntrack`], [`dns`] - flow correlation and aggregation
//! - [`reslimit`] - watchdog over the agent's own resource usage
//! - [`agent`] - startup order and shutdown
//!
//! Kernel programs are driven through the [`probe::ProbeHost`] boundary and
//! records leave through [`output::Output`].

pub mod agent;
pub mod cancel;
pub mod channel;
pub mod config;
pub mod conn;
pub mod conntrack;
pub mod dns;
pub mod layout;
pub mod netflow;
pub mod offset;
pub mod output;
pub mod probe;
pub mod process;
pub mod process_filter;
pub mod report;
pub mod reslimit;
pub mod sched;
pub mod symbols;
