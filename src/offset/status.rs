//! Layout of the guess status shared with the kernel side of each
//! calibration program.
//!
//! ```text
//! 0   u64       state         0 = waiting, 1 = recorded
//! 8   u64       pid_tgid      controlling thread
//! 16  [u8; 16]  process_name
//! 32  u32       conn_type     connection meta of the expected operation
//! 36  u32       err           kernel side read error, see ERR_*
//! 40  u64       arg           operation argument (fd number for http_fd)
//! 48  u64 * n   offsets       candidates, in `FieldGroup::fields` order
//! ..            observation   group specific
//! ```
//!
//! The kernel side only records events whose tgid matches `pid_tgid >> 32`.

use crate::layout::{DecodeError, Reader, Writer};
use crate::offset::table::FieldGroup;

pub const STATE_WAITING: u64 = 0;
pub const STATE_RECORDED: u64 = 1;

/// Reading the namespace pointer at the candidate faulted.
pub const ERR_SK_NET: u32 = 19;
/// Reading `task_struct->files` at the candidate faulted.
pub const ERR_TASK_FILES: u32 = 20;
/// Reading `files_struct->fdt` at the candidate faulted.
pub const ERR_FILES_FDT: u32 = 21;

pub const PROC_NAME_LEN: usize = 16;
const HEADER_LEN: usize = 48;

pub trait Observation: Sized + Default + Clone {
    const SIZE: usize;
    fn decode(r: &Reader<'_>, base: usize) -> Result<Self, DecodeError>;
    fn encode(&self, w: &mut Writer, base: usize);
}

/// Socket group: values read from a `sock`, a `flowi4` and a connect
/// sockaddr at the candidate offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SockObservation {
    pub meta: u32,
    pub sport: u16,
    pub dport: u16,
    /// Ports read through `socket->sk` at the candidate.
    pub sport_via_socket: u16,
    pub dport_via_socket: u16,
    pub netns: u32,
    pub saddr: [u8; 16],
    pub daddr: [u8; 16],
    pub rtt: u32,
    pub rtt_var: u32,
    pub skaddr_port: u16,
    pub skaddr6_port: u16,
}

impl Observation for SockObservation {
    const SIZE: usize = 64;

    fn decode(r: &Reader<'_>, base: usize) -> Result<Self, DecodeError> {
        let mut saddr = [0u8; 16];
        saddr.copy_from_slice(r.bytes(base + 16, 16)?);
        let mut daddr = [0u8; 16];
        daddr.copy_from_slice(r.bytes(base + 32, 16)?);
        Ok(Self {
            meta: r.u32(base)?,
            sport: r.u16(base + 4)?,
            dport: r.u16(base + 6)?,
            sport_via_socket: r.u16(base + 8)?,
            dport_via_socket: r.u16(base + 10)?,
            netns: r.u32(base + 12)?,
            saddr,
            daddr,
            rtt: r.u32(base + 48)?,
            rtt_var: r.u32(base + 52)?,
            skaddr_port: r.u16(base + 56)?,
            skaddr6_port: r.u16(base + 58)?,
        })
    }

    fn encode(&self, w: &mut Writer, base: usize) {
        w.put_u32(base, self.meta)
            .put_u16(base + 4, self.sport)
            .put_u16(base + 6, self.dport)
            .put_u16(base + 8, self.sport_via_socket)
            .put_u16(base + 10, self.dport_via_socket)
            .put_u32(base + 12, self.netns)
            .put_bytes(base + 16, &self.saddr)
            .put_bytes(base + 32, &self.daddr)
            .put_u32(base + 48, self.rtt)
            .put_u32(base + 52, self.rtt_var)
            .put_u16(base + 56, self.skaddr_port)
            .put_u16(base + 58, self.skaddr6_port)
            .put_u32(base + 60, 0);
    }
}

/// TCP sequence group: counters read before and after one transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeqObservation {
    pub copied_before: u32,
    pub copied_after: u32,
    pub write_before: u32,
    pub write_after: u32,
}

impl Observation for SeqObservation {
    const SIZE: usize = 16;

    fn decode(r: &Reader<'_>, base: usize) -> Result<Self, DecodeError> {
        Ok(Self {
            copied_before: r.u32(base)?,
            copied_after: r.u32(base + 4)?,
            write_before: r.u32(base + 8)?,
            write_after: r.u32(base + 12)?,
        })
    }

    fn encode(&self, w: &mut Writer, base: usize) {
        w.put_u32(base, self.copied_before)
            .put_u32(base + 4, self.copied_after)
            .put_u32(base + 8, self.write_before)
            .put_u32(base + 12, self.write_after);
    }
}

/// HTTP fd group: pointers collected while a socket write runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdObservation {
    /// Ports reached through `file->private_data->sk`.
    pub sport: u16,
    pub dport: u16,
    /// The `struct file` being written.
    pub file_ptr: u64,
    /// `socket->file` read at the candidate.
    pub socket_file_ptr: u64,
    /// `current->files->fdt->fd[arg]` read at the candidates.
    pub task_file_ptr: u64,
}

impl Observation for FdObservation {
    const SIZE: usize = 32;

    fn decode(r: &Reader<'_>, base: usize) -> Result<Self, DecodeError> {
        Ok(Self {
            sport: r.u16(base)?,
            dport: r.u16(base + 2)?,
            file_ptr: r.u64(base + 8)?,
            socket_file_ptr: r.u64(base + 16)?,
            task_file_ptr: r.u64(base + 24)?,
        })
    }

    fn encode(&self, w: &mut Writer, base: usize) {
        w.put_u16(base, self.sport)
            .put_u16(base + 2, self.dport)
            .put_u32(base + 4, 0)
            .put_u64(base + 8, self.file_ptr)
            .put_u64(base + 16, self.socket_file_ptr)
            .put_u64(base + 24, self.task_file_ptr);
    }
}

/// One conntrack tuple as reported by the kernel side, ports in host order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TupleObservation {
    pub src: [u8; 16],
    pub dst: [u8; 16],
    pub sport: u16,
    pub dport: u16,
}

impl TupleObservation {
    const SIZE: usize = 36;

    fn decode(r: &Reader<'_>, base: usize) -> Result<Self, DecodeError> {
        let mut src = [0u8; 16];
        src.copy_from_slice(r.bytes(base, 16)?);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(r.bytes(base + 16, 16)?);
        Ok(Self {
            src,
            dst,
            sport: r.u16(base + 32)?,
            dport: r.u16(base + 34)?,
        })
    }

    fn encode(&self, w: &mut Writer, base: usize) {
        w.put_bytes(base, &self.src)
            .put_bytes(base + 16, &self.dst)
            .put_u16(base + 32, self.sport)
            .put_u16(base + 34, self.dport);
    }
}

/// Conntrack group: both tuples of the inserted entry and its namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CtObservation {
    pub origin: TupleObservation,
    pub reply: TupleObservation,
    pub netns: u32,
}

impl Observation for CtObservation {
    const SIZE: usize = 2 * TupleObservation::SIZE + 4;

    fn decode(r: &Reader<'_>, base: usize) -> Result<Self, DecodeError> {
        Ok(Self {
            origin: TupleObservation::decode(r, base)?,
            reply: TupleObservation::decode(r, base + TupleObservation::SIZE)?,
            netns: r.u32(base + 2 * TupleObservation::SIZE)?,
        })
    }

    fn encode(&self, w: &mut Writer, base: usize) {
        self.origin.encode(w, base);
        self.reply.encode(w, base + TupleObservation::SIZE);
        w.put_u32(base + 2 * TupleObservation::SIZE, self.netns);
    }
}

/// One guess round as exchanged through the guess map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuessStatus<O> {
    pub state: u64,
    pub pid_tgid: u64,
    pub process_name: String,
    pub conn_type: u32,
    pub err: u32,
    pub arg: u64,
    pub offsets: Vec<u64>,
    pub observed: O,
}

impl<O: Observation> GuessStatus<O> {
    pub fn size(group: FieldGroup) -> usize {
        HEADER_LEN + group.fields().len() * 8 + O::SIZE
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(HEADER_LEN + self.offsets.len() * 8 + O::SIZE);
        w.put_u64(0, self.state)
            .put_u64(8, self.pid_tgid)
            .put_cstr(16, PROC_NAME_LEN, &self.process_name)
            .put_u32(32, self.conn_type)
            .put_u32(36, self.err)
            .put_u64(40, self.arg);
        for (i, offset) in self.offsets.iter().enumerate() {
            w.put_u64(HEADER_LEN + i * 8, *offset);
        }
        self.observed
            .encode(&mut w, HEADER_LEN + self.offsets.len() * 8);
        w.into_inner()
    }

    pub fn decode(buf: &[u8], group: FieldGroup) -> Result<Self, DecodeError> {
        let r = Reader::new(buf);
        r.require(Self::size(group))?;
        let count = group.fields().len();
        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            offsets.push(r.u64(HEADER_LEN + i * 8)?);
        }
        Ok(Self {
            state: r.u64(0)?,
            pid_tgid: r.u64(8)?,
            process_name: r.cstr(16, PROC_NAME_LEN)?,
            conn_type: r.u32(32)?,
            err: r.u32(36)?,
            arg: r.u64(40)?,
            offsets,
            observed: O::decode(&r, HEADER_LEN + count * 8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_match_layout() {
        assert_eq!(GuessStatus::<SockObservation>::size(FieldGroup::Socket), 48 + 23 * 8 + 64);
        assert_eq!(GuessStatus::<SeqObservation>::size(FieldGroup::TcpSeq), 48 + 16 + 16);
        assert_eq!(GuessStatus::<FdObservation>::size(FieldGroup::HttpFd), 48 + 32 + 32);
        assert_eq!(GuessStatus::<CtObservation>::size(FieldGroup::Conntrack), 48 + 24 + 76);
    }

    #[test]
    fn test_header_positions() {
        let status = GuessStatus::<SeqObservation> {
            state: STATE_RECORDED,
            pid_tgid: 42 << 32 | 43,
            process_name: "hostflow".into(),
            conn_type: 0x100,
            err: ERR_SK_NET,
            arg: 7,
            offsets: vec![0x5a0, 0x6b8],
            observed: SeqObservation {
                copied_after: 1200,
                ..Default::default()
            },
        };
        let buf = status.encode();
        let r = Reader::new(&buf);
        assert_eq!(r.u64(8).unwrap() >> 32, 42);
        assert_eq!(r.cstr(16, PROC_NAME_LEN).unwrap(), "hostflow");
        assert_eq!(r.u32(36).unwrap(), ERR_SK_NET);
        assert_eq!(r.u64(48).unwrap(), 0x5a0);
        assert_eq!(r.u32(64 + 4).unwrap(), 1200);
        assert_eq!(GuessStatus::decode(&buf, FieldGroup::TcpSeq).unwrap(), status);
    }

    #[test]
    fn test_short_status_is_rejected() {
        let buf = vec![0u8; 40];
        assert!(GuessStatus::<SockObservation>::decode(&buf, FieldGroup::Socket).is_err());
    }

    #[test]
    fn test_long_process_name_is_truncated() {
        let status = GuessStatus::<SeqObservation> {
            process_name: "a-very-long-process-name".into(),
            offsets: vec![0, 0],
            ..Default::default()
        };
        let decoded =
            GuessStatus::<SeqObservation>::decode(&status.encode(), FieldGroup::TcpSeq).unwrap();
        assert!(decoded.process_name.len() < PROC_NAME_LEN);
    }
}
