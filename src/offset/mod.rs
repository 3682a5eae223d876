//! Kernel struct offset discovery.
//!
//! Every field of interest is found by running a controlled operation
//! whose values are known in userspace, letting the kernel side record
//! whatever lives at a candidate offset, and comparing. A mismatch advances
//! the candidate; a field is confirmed once it matched more than
//! [`MIN_SUCCESS`] times in a row and is never touched again.

pub mod engine;
pub mod loopback;
pub mod sim;
pub mod status;
pub mod table;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::layout::DecodeError;
use crate::probe::ProbeMap;

pub use engine::{Discoverer, DiscoveryOptions, DiscoveryReport, GuessIdentity};
pub use loopback::HostGuessEnv;
pub use sim::SimulatedKernel;
pub use table::{kernel_version, FieldGroup, OffsetField, OffsetTable};

/// Map each calibration program exposes for the guess status.
pub const GUESS_MAP: &str = "bpfmap_offset_guess";

/// Consecutive matches needed before a candidate is trusted.
pub const MIN_SUCCESS: u32 = 5;
/// Candidate ceiling for socket, flowi and conntrack fields.
pub const MAX_OFFSET: u64 = 2048;
pub const TASK_STRUCT_MAX_OFFSET: u64 = 8192;
pub const FILES_STRUCT_MAX_OFFSET: u64 = 256;
/// Namespace inode search window inside `struct net`.
pub const NET_INUM_MAX_OFFSET: u64 = 512;
/// Pointer fields are searched at pointer alignment.
pub const POINTER_STRIDE: u64 = 8;

/// Highest candidate tried for a field before the attempt fails.
pub fn ceiling(field: OffsetField) -> u64 {
    match field {
        OffsetField::TaskStructFiles => TASK_STRUCT_MAX_OFFSET,
        OffsetField::FilesStructFdt => FILES_STRUCT_MAX_OFFSET,
        OffsetField::NsCommonInum => NET_INUM_MAX_OFFSET,
        _ => MAX_OFFSET,
    }
}

/// Controlled operations a guess round can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Loopback TCP4 connect with linger 0.
    Tcp4,
    /// TCP6 connect attempt to a random address under a fixed prefix.
    Tcp6,
    /// UDP4 datagram to a loopback listener.
    Udp4,
    /// Loopback TCP transfer of a random number of bytes.
    TcpTransfer,
    /// Write on a connected socket whose fd is passed to the kernel side.
    SocketWrite,
    /// New loopback connection, which inserts a conntrack entry.
    ConntrackInsert,
}

/// What the kernel side should have seen during an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expected {
    pub meta: u32,
    pub saddr: [u8; 16],
    pub daddr: [u8; 16],
    pub sport: u16,
    pub dport: u16,
    pub netns: u32,
    pub rtt: u32,
    pub rtt_var: u32,
    /// Payload length of a transfer.
    pub bytes: u32,
}

/// The kernel side and the controlled operations of a calibration run.
pub trait GuessEnv {
    /// Load and start the calibration program of `group`, configured with
    /// the offsets confirmed so far, and return its guess map.
    fn open(&mut self, group: FieldGroup, table: &OffsetTable) -> Result<Arc<dyn ProbeMap>>;

    fn close(&mut self, group: FieldGroup);

    /// Set up `op` and return the argument the kernel side needs for it.
    fn prepare(&mut self, op: Operation) -> Result<u64>;

    /// Run `op` and report what the kernel side should have recorded.
    fn fire(&mut self, op: Operation) -> Result<Expected>;
}

/// Calibration failure of one field group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// A candidate passed its ceiling without matching.
    Exhausted {
        group: FieldGroup,
        field: OffsetField,
        offset: u64,
    },
    /// The attempt ran out of rounds, usually because every round was lost.
    RoundBudget { group: FieldGroup, rounds: u64 },
    /// Loading the program, touching its map or running the operation failed.
    Probe { group: FieldGroup, message: String },
    Decode { group: FieldGroup, error: DecodeError },
    Cancelled,
}

impl DiscoveryError {
    pub fn group(&self) -> Option<FieldGroup> {
        match self {
            DiscoveryError::Exhausted { group, .. }
            | DiscoveryError::RoundBudget { group, .. }
            | DiscoveryError::Probe { group, .. }
            | DiscoveryError::Decode { group, .. } => Some(*group),
            DiscoveryError::Cancelled => None,
        }
    }
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::Exhausted {
                group,
                field,
                offset,
            } => write!(
                f,
                "{group}: no match for {field} below offset {offset} (ceiling {})",
                ceiling(*field)
            ),
            DiscoveryError::RoundBudget { group, rounds } => {
                write!(f, "{group}: gave up after {rounds} rounds")
            }
            DiscoveryError::Probe { group, message } => write!(f, "{group}: {message}"),
            DiscoveryError::Decode { group, error } => {
                write!(f, "{group}: bad guess status: {error}")
            }
            DiscoveryError::Cancelled => f.write_str("offset discovery cancelled"),
        }
    }
}

impl std::error::Error for DiscoveryError {}
