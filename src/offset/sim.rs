//! Simulated kernel side of the guess protocol.
//!
//! Kernel structs are modelled as regions of random bytes with the fields
//! of interest written at known offsets. Each fired operation builds fresh
//! regions, reads them at the candidate offsets found in the guess map the
//! way the calibration programs do, and records the result. Used by the
//! discovery tests and by `--dry-run`.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::conn::{CONN_L3_IPV4, CONN_L3_IPV6, CONN_L4_TCP, CONN_L4_UDP};
use crate::layout::addr_to_slot;
use crate::offset::status::{
    CtObservation, FdObservation, GuessStatus, Observation, SeqObservation, SockObservation,
    TupleObservation, ERR_FILES_FDT, ERR_SK_NET, ERR_TASK_FILES, STATE_RECORDED,
};
use crate::offset::table::{FieldGroup, OffsetField, OffsetTable};
use crate::offset::{
    Expected, GuessEnv, Operation, FILES_STRUCT_MAX_OFFSET, MAX_OFFSET, TASK_STRUCT_MAX_OFFSET,
};
use crate::probe::memory::MemoryMap;
use crate::probe::{slot_key, ProbeMap};

use OffsetField::*;

const REGION_BASE: u64 = 0xffff_8880_0000_0000;
const REGION_STRIDE: u64 = 0x10_0000;
const AF_INET: u16 = 2;
const AF_INET6: u16 = 10;
const TCP6_PORT: u16 = 57391;

/// Synthetic kernel memory for one round.
#[derive(Default)]
struct Memory {
    regions: Vec<Vec<u8>>,
}

impl Memory {
    fn alloc(&mut self, rng: &mut StdRng, size: usize) -> u64 {
        let mut bytes = vec![0u8; size];
        rng.fill_bytes(&mut bytes);
        self.regions.push(bytes);
        REGION_BASE + (self.regions.len() as u64 - 1) * REGION_STRIDE
    }

    fn locate(&self, addr: u64) -> Option<(usize, usize)> {
        let rel = addr.checked_sub(REGION_BASE)?;
        let index = (rel / REGION_STRIDE) as usize;
        let offset = (rel % REGION_STRIDE) as usize;
        let region = self.regions.get(index)?;
        (offset < region.len()).then_some((index, offset))
    }

    /// Whether `ptr` points at the start of an object.
    fn is_object(&self, ptr: u64) -> bool {
        matches!(self.locate(ptr), Some((_, 0)))
    }

    fn read(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let (index, offset) = self.locate(addr)?;
        self.regions[index].get(offset..offset + len)
    }

    fn write(&mut self, addr: u64, bytes: &[u8]) {
        if let Some((index, offset)) = self.locate(addr) {
            let region = &mut self.regions[index];
            if offset + bytes.len() <= region.len() {
                region[offset..offset + bytes.len()].copy_from_slice(bytes);
            }
        }
    }

    fn put_u64(&mut self, addr: u64, v: u64) {
        self.write(addr, &v.to_le_bytes());
    }

    fn put_u32(&mut self, addr: u64, v: u32) {
        self.write(addr, &v.to_le_bytes());
    }

    fn put_u16(&mut self, addr: u64, v: u16) {
        self.write(addr, &v.to_le_bytes());
    }

    fn put_be16(&mut self, addr: u64, v: u16) {
        self.write(addr, &v.to_be_bytes());
    }

    // Reads past the end of a region yield zero, like a failed probe read.
    fn u64(&self, addr: u64) -> u64 {
        self.read(addr, 8)
            .map_or(0, |b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn u32(&self, addr: u64) -> u32 {
        self.read(addr, 4)
            .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u16(&self, addr: u64) -> u16 {
        self.read(addr, 2).map_or(0, |b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn be16(&self, addr: u64) -> u16 {
        self.read(addr, 2).map_or(0, |b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn v4_slot(&self, addr: u64) -> [u8; 16] {
        let mut slot = [0u8; 16];
        if let Some(b) = self.read(addr, 4) {
            slot[12..].copy_from_slice(b);
        }
        slot
    }

    fn v6_slot(&self, addr: u64) -> [u8; 16] {
        let mut slot = [0u8; 16];
        if let Some(b) = self.read(addr, 16) {
            slot.copy_from_slice(b);
        }
        slot
    }
}

fn family_meta(family: u16) -> u32 {
    match family {
        AF_INET => CONN_L3_IPV4,
        AF_INET6 => CONN_L3_IPV6,
        _ => 0xFF,
    }
}

/// A layout resembling a recent x86_64 kernel.
pub fn sample_layout() -> OffsetTable {
    let mut t = OffsetTable::new();
    let values = [
        (SkDaddr, 0),
        (SkRcvSaddr, 4),
        (SkDport, 12),
        (SkNum, 14),
        (SkFamily, 16),
        (SkNet, 48),
        (SkV6Daddr, 56),
        (SkV6RcvSaddr, 72),
        (InetSport, 796),
        (TcpSkSrttUs, 1760),
        (TcpSkMdevUs, 1764),
        (Flowi4Saddr, 40),
        (Flowi4Daddr, 44),
        (Flowi4Dport, 48),
        (Flowi4Sport, 50),
        (Flowi6Daddr, 40),
        (Flowi6Saddr, 56),
        (Flowi6Dport, 76),
        (Flowi6Sport, 78),
        (SkaddrSinPort, 2),
        (Skaddr6Sin6Port, 2),
        (NsCommonInum, 136),
        (SocketSk, 24),
        (CopiedSeq, 1496),
        (WriteSeq, 1712),
        (TaskStructFiles, 2888),
        (FilesStructFdt, 32),
        (SocketFile, 16),
        (FilePrivateData, 200),
        (CtOriginTuple, 16),
        (CtReplyTuple, 72),
        (CtNet, 144),
    ];
    for (field, value) in values {
        t.set(field, value);
    }
    for group in FieldGroup::ALL {
        t.mark_calibrated(group);
    }
    t
}

/// In-process stand-in for the calibration programs and the controlled
/// operations they observe.
pub struct SimulatedKernel {
    truth: OffsetTable,
    rng: StdRng,
    netns: u32,
    map: Arc<MemoryMap>,
    group: Option<FieldGroup>,
    constants: OffsetTable,
    pending_write: Option<(u64, u16, u16)>,
    lose: u32,
    fail_open: BTreeSet<FieldGroup>,
    opened: Vec<FieldGroup>,
    fired: u64,
}

impl SimulatedKernel {
    pub fn new(truth: OffsetTable, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let netns = 0xf000_0000 | rng.random::<u32>() >> 4;
        Self {
            truth,
            rng,
            netns,
            map: Arc::new(MemoryMap::new()),
            group: None,
            constants: OffsetTable::new(),
            pending_write: None,
            lose: 0,
            fail_open: BTreeSet::new(),
            opened: Vec::new(),
            fired: 0,
        }
    }

    pub fn truth(&self) -> &OffsetTable {
        &self.truth
    }

    /// Drop the next `rounds` recordings, as if the events were missed.
    pub fn lose_rounds(&mut self, rounds: u32) {
        self.lose += rounds;
    }

    /// Make loading the program of `group` fail.
    pub fn fail_open(&mut self, group: FieldGroup) {
        self.fail_open.insert(group);
    }

    pub fn opened(&self) -> &[FieldGroup] {
        &self.opened
    }

    pub fn fired(&self) -> u64 {
        self.fired
    }

    fn port(&mut self) -> u16 {
        self.rng.random_range(1024..u16::MAX)
    }

    fn status<O: Observation>(&self, group: FieldGroup) -> Result<GuessStatus<O>> {
        let raw = self
            .map
            .lookup(&slot_key(0))?
            .ok_or_else(|| anyhow!("guess status not written"))?;
        Ok(GuessStatus::<O>::decode(&raw, group)?)
    }

    fn record<O: Observation>(&mut self, mut status: GuessStatus<O>) -> Result<()> {
        if self.lose > 0 {
            self.lose -= 1;
            return Ok(());
        }
        status.state = STATE_RECORDED;
        self.map.update(&slot_key(0), &status.encode())
    }

    fn candidate(&self, group: FieldGroup, offsets: &[u64], field: OffsetField) -> u64 {
        group
            .fields()
            .iter()
            .position(|f| *f == field)
            .and_then(|i| offsets.get(i).copied())
            .unwrap_or(0)
    }

    fn sock_region(&mut self, mem: &mut Memory) -> u64 {
        mem.alloc(&mut self.rng, MAX_OFFSET as usize + 64)
    }

    fn fire_tcp4(&mut self) -> Result<Expected> {
        let group = FieldGroup::Socket;
        let mut st = self.status::<SockObservation>(group)?;
        let c = |f| self.candidate(group, &st.offsets, f);
        let (sk_c, dport_c, sport_c) = (c(SocketSk), c(SkDport), c(InetSport));
        let (srtt_c, mdev_c, daddr_c) = (c(TcpSkSrttUs), c(TcpSkMdevUs), c(SkDaddr));
        let (family_c, skaddr_c, net_c, inum_c) =
            (c(SkFamily), c(SkaddrSinPort), c(SkNet), c(NsCommonInum));

        let exp = Expected {
            meta: CONN_L3_IPV4 | CONN_L4_TCP,
            saddr: addr_to_slot(&Ipv4Addr::new(127, 0, 0, 1).into()),
            daddr: addr_to_slot(&Ipv4Addr::new(127, 0, 0, 2).into()),
            sport: self.port(),
            dport: self.port(),
            netns: self.netns,
            rtt: self.rng.random_range(20..2000),
            rtt_var: self.rng.random_range(10..1000),
            bytes: 0,
        };

        let t = self.truth.clone();
        let mut mem = Memory::default();
        let sk = self.sock_region(&mut mem);
        let net = mem.alloc(&mut self.rng, 1024);
        let socket = mem.alloc(&mut self.rng, MAX_OFFSET as usize + 64);
        let uaddr = mem.alloc(&mut self.rng, 16);
        mem.write(sk + t.get(SkDaddr), &exp.daddr[12..]);
        mem.write(sk + t.get(SkRcvSaddr), &exp.saddr[12..]);
        mem.put_be16(sk + t.get(SkDport), exp.dport);
        mem.put_u16(sk + t.get(SkNum), exp.sport);
        mem.put_u16(sk + t.get(SkFamily), AF_INET);
        mem.put_u64(sk + t.get(SkNet), net);
        mem.put_be16(sk + t.get(InetSport), exp.sport);
        mem.put_u32(sk + t.get(TcpSkSrttUs), exp.rtt << 3);
        mem.put_u32(sk + t.get(TcpSkMdevUs), exp.rtt_var << 2);
        mem.put_u32(net + t.get(NsCommonInum), self.netns);
        mem.put_u64(socket + t.get(SocketSk), sk);
        mem.write(uaddr, &[0u8; 16]);
        mem.put_u16(uaddr, AF_INET);
        mem.put_be16(uaddr + 2, exp.dport);
        mem.write(uaddr + 4, &exp.daddr[12..]);

        let o = &mut st.observed;
        o.meta = family_meta(mem.u16(sk + family_c)) | CONN_L4_TCP;
        o.sport = mem.be16(sk + sport_c);
        o.dport = mem.be16(sk + dport_c);
        o.daddr = mem.v4_slot(sk + daddr_c);
        o.rtt = mem.u32(sk + srtt_c) >> 3;
        o.rtt_var = mem.u32(sk + mdev_c) >> 2;
        o.skaddr_port = mem.be16(uaddr + skaddr_c);
        let net_ptr = mem.u64(sk + net_c);
        if mem.is_object(net_ptr) {
            st.err = 0;
            o.netns = mem.u32(net_ptr + inum_c);
        } else {
            st.err = ERR_SK_NET;
            o.netns = 0;
        }
        let sk_ptr = mem.u64(socket + sk_c);
        if mem.is_object(sk_ptr) {
            o.sport_via_socket = mem.be16(sk_ptr + sport_c);
            o.dport_via_socket = mem.be16(sk_ptr + dport_c);
        }
        self.record(st)?;
        Ok(exp)
    }

    fn fire_tcp6(&mut self) -> Result<Expected> {
        let group = FieldGroup::Socket;
        let mut st = self.status::<SockObservation>(group)?;
        let c = |f| self.candidate(group, &st.offsets, f);
        let (v6_c, family_c, skaddr6_c) = (c(SkV6Daddr), c(SkFamily), c(Skaddr6Sin6Port));

        let mut daddr = [0u8; 16];
        daddr[..4].copy_from_slice(&0x8758_6031u32.to_be_bytes());
        self.rng.fill_bytes(&mut daddr[4..]);
        let exp = Expected {
            meta: CONN_L3_IPV6 | CONN_L4_TCP,
            daddr,
            dport: TCP6_PORT,
            netns: self.netns,
            ..Default::default()
        };

        let t = self.truth.clone();
        let mut mem = Memory::default();
        let sk = self.sock_region(&mut mem);
        let uaddr = mem.alloc(&mut self.rng, 28);
        mem.write(sk + t.get(SkV6Daddr), &daddr);
        mem.write(sk + t.get(SkV6RcvSaddr), &Ipv6Addr::LOCALHOST.octets());
        mem.put_u16(sk + t.get(SkFamily), AF_INET6);
        mem.write(uaddr, &[0u8; 28]);
        mem.put_u16(uaddr, AF_INET6);
        mem.put_be16(uaddr + 2, TCP6_PORT);
        mem.write(uaddr + 8, &daddr);

        let o = &mut st.observed;
        o.meta = family_meta(mem.u16(sk + family_c)) | CONN_L4_TCP;
        o.daddr = mem.v6_slot(sk + v6_c);
        o.skaddr6_port = mem.be16(uaddr + skaddr6_c);
        st.err = 0;
        self.record(st)?;
        Ok(exp)
    }

    fn fire_udp4(&mut self) -> Result<Expected> {
        let group = FieldGroup::Socket;
        let mut st = self.status::<SockObservation>(group)?;
        let c = |f| self.candidate(group, &st.offsets, f);
        let (saddr_c, daddr_c, dport_c) = (c(Flowi4Saddr), c(Flowi4Daddr), c(Flowi4Dport));

        let exp = Expected {
            meta: CONN_L3_IPV4 | CONN_L4_UDP,
            saddr: addr_to_slot(&Ipv4Addr::new(127, 0, 0, 1).into()),
            daddr: addr_to_slot(&Ipv4Addr::new(127, 0, 0, 2).into()),
            sport: self.port(),
            dport: self.port(),
            netns: self.netns,
            ..Default::default()
        };

        let t = self.truth.clone();
        let mut mem = Memory::default();
        let fl4 = mem.alloc(&mut self.rng, MAX_OFFSET as usize + 64);
        mem.write(fl4 + t.get(Flowi4Saddr), &exp.saddr[12..]);
        mem.write(fl4 + t.get(Flowi4Daddr), &exp.daddr[12..]);
        mem.put_be16(fl4 + t.get(Flowi4Dport), exp.dport);
        mem.put_be16(fl4 + t.get(Flowi4Sport), exp.sport);

        let o = &mut st.observed;
        o.meta = CONN_L3_IPV4 | CONN_L4_UDP;
        o.saddr = mem.v4_slot(fl4 + saddr_c);
        o.daddr = mem.v4_slot(fl4 + daddr_c);
        o.dport = mem.be16(fl4 + dport_c);
        st.err = 0;
        self.record(st)?;
        Ok(exp)
    }

    fn fire_transfer(&mut self) -> Result<Expected> {
        let group = FieldGroup::TcpSeq;
        let mut st = self.status::<SeqObservation>(group)?;
        let copied_c = self.candidate(group, &st.offsets, CopiedSeq);
        let write_c = self.candidate(group, &st.offsets, WriteSeq);
        let bytes: u32 = self.rng.random_range(1000..1400);
        let exp = Expected {
            meta: CONN_L3_IPV4 | CONN_L4_TCP,
            sport: self.port(),
            dport: self.port(),
            bytes,
            ..Default::default()
        };

        let t = self.truth.clone();
        let mut before = Memory::default();
        let sender = self.sock_region(&mut before);
        let receiver = self.sock_region(&mut before);
        let write_seq: u32 = self.rng.random();
        let copied_seq: u32 = self.rng.random();
        before.put_u32(sender + t.get(WriteSeq), write_seq);
        before.put_u32(receiver + t.get(CopiedSeq), copied_seq);
        let mut after = Memory {
            regions: before.regions.clone(),
        };
        after.put_u32(sender + t.get(WriteSeq), write_seq.wrapping_add(bytes));
        after.put_u32(receiver + t.get(CopiedSeq), copied_seq.wrapping_add(bytes));

        st.observed = SeqObservation {
            write_before: before.u32(sender + write_c),
            write_after: after.u32(sender + write_c),
            copied_before: before.u32(receiver + copied_c),
            copied_after: after.u32(receiver + copied_c),
        };
        st.err = 0;
        self.record(st)?;
        Ok(exp)
    }

    fn prepare_write(&mut self) -> u64 {
        let fd = self.rng.random_range(3..64u64);
        let (sport, dport) = (self.port(), self.port());
        self.pending_write = Some((fd, sport, dport));
        fd
    }

    fn fire_write(&mut self) -> Result<Expected> {
        let group = FieldGroup::HttpFd;
        let Some((fd, sport, dport)) = self.pending_write.take() else {
            bail!("socket write fired without prepare");
        };
        let mut st = self.status::<FdObservation>(group)?;
        let c = |f| self.candidate(group, &st.offsets, f);
        let (private_c, socket_file_c, task_c, fdt_c) = (
            c(FilePrivateData),
            c(SocketFile),
            c(TaskStructFiles),
            c(FilesStructFdt),
        );
        // Offsets confirmed by the socket group
        let k = self.constants.clone();
        let t = self.truth.clone();

        let mut mem = Memory::default();
        let file = mem.alloc(&mut self.rng, 512);
        let socket = mem.alloc(&mut self.rng, 512);
        let sk = self.sock_region(&mut mem);
        let task = mem.alloc(&mut self.rng, TASK_STRUCT_MAX_OFFSET as usize + 64);
        let files = mem.alloc(&mut self.rng, FILES_STRUCT_MAX_OFFSET as usize + 64);
        let fdt = mem.alloc(&mut self.rng, 64);
        let fd_array = mem.alloc(&mut self.rng, 64 * 8 + 8);
        mem.put_u64(file + t.get(FilePrivateData), socket);
        mem.put_u64(socket + t.get(SocketFile), file);
        mem.put_u64(socket + k.get(SocketSk), sk);
        mem.put_be16(sk + k.get(InetSport), sport);
        mem.put_be16(sk + k.get(SkDport), dport);
        mem.put_u64(task + t.get(TaskStructFiles), files);
        mem.put_u64(files + t.get(FilesStructFdt), fdt);
        mem.put_u64(fdt + 8, fd_array);
        mem.put_u64(fd_array + fd * 8, file);

        let mut o = FdObservation {
            file_ptr: file,
            ..Default::default()
        };
        let private = mem.u64(file + private_c);
        if mem.is_object(private) {
            let sk_ptr = mem.u64(private + k.get(SocketSk));
            if mem.is_object(sk_ptr) {
                o.sport = mem.be16(sk_ptr + k.get(InetSport));
                o.dport = mem.be16(sk_ptr + k.get(SkDport));
            }
            o.socket_file_ptr = mem.u64(private + socket_file_c);
        }
        st.err = 0;
        let files_ptr = mem.u64(task + task_c);
        if !mem.is_object(files_ptr) {
            st.err = ERR_TASK_FILES;
        } else {
            let fdt_ptr = mem.u64(files_ptr + fdt_c);
            if !mem.is_object(fdt_ptr) {
                st.err = ERR_FILES_FDT;
            } else {
                let array = mem.u64(fdt_ptr + 8);
                if mem.is_object(array) {
                    o.task_file_ptr = mem.u64(array + st.arg * 8);
                }
            }
        }
        st.observed = o;
        self.record(st)?;
        Ok(Expected {
            meta: CONN_L3_IPV4 | CONN_L4_TCP,
            sport,
            dport,
            ..Default::default()
        })
    }

    fn fire_conntrack(&mut self) -> Result<Expected> {
        let group = FieldGroup::Conntrack;
        let mut st = self.status::<CtObservation>(group)?;
        let c = |f| self.candidate(group, &st.offsets, f);
        let (origin_c, reply_c, net_c) = (c(CtOriginTuple), c(CtReplyTuple), c(CtNet));
        let exp = Expected {
            meta: CONN_L3_IPV4 | CONN_L4_TCP,
            saddr: addr_to_slot(&Ipv4Addr::new(127, 0, 0, 1).into()),
            daddr: addr_to_slot(&Ipv4Addr::new(127, 0, 0, 2).into()),
            sport: self.port(),
            dport: self.port(),
            netns: self.netns,
            ..Default::default()
        };

        let k = self.constants.clone();
        let t = self.truth.clone();
        let mut mem = Memory::default();
        let ct = mem.alloc(&mut self.rng, MAX_OFFSET as usize + 64);
        let net = mem.alloc(&mut self.rng, 1024);
        let put_tuple = |mem: &mut Memory, at: u64, src: &[u8], sport, dst: &[u8], dport| {
            mem.write(at, &[0u8; 40]);
            mem.write(at, src);
            mem.put_be16(at + 16, sport);
            mem.put_u16(at + 18, AF_INET);
            mem.write(at + 20, dst);
            mem.put_be16(at + 36, dport);
            mem.write(at + 38, &[6, 0]);
        };
        put_tuple(
            &mut mem,
            ct + t.get(CtOriginTuple),
            &exp.saddr[12..],
            exp.sport,
            &exp.daddr[12..],
            exp.dport,
        );
        put_tuple(
            &mut mem,
            ct + t.get(CtReplyTuple),
            &exp.daddr[12..],
            exp.dport,
            &exp.saddr[12..],
            exp.sport,
        );
        mem.put_u64(ct + t.get(CtNet), net);
        mem.put_u32(net + k.get(NsCommonInum), self.netns);

        let read_tuple = |mem: &Memory, at: u64| TupleObservation {
            src: mem.v4_slot(at),
            sport: mem.be16(at + 16),
            dst: mem.v4_slot(at + 20),
            dport: mem.be16(at + 36),
        };
        st.observed.origin = read_tuple(&mem, ct + origin_c);
        st.observed.reply = read_tuple(&mem, ct + reply_c);
        let net_ptr = mem.u64(ct + net_c);
        if mem.is_object(net_ptr) {
            st.err = 0;
            st.observed.netns = mem.u32(net_ptr + k.get(NsCommonInum));
        } else {
            st.err = ERR_SK_NET;
            st.observed.netns = 0;
        }
        self.record(st)?;
        Ok(exp)
    }
}

impl GuessEnv for SimulatedKernel {
    fn open(&mut self, group: FieldGroup, table: &OffsetTable) -> Result<Arc<dyn ProbeMap>> {
        self.opened.push(group);
        if self.fail_open.contains(&group) {
            bail!("failed to load offset_{} program", group);
        }
        self.map = Arc::new(MemoryMap::new());
        self.group = Some(group);
        self.constants = table.clone();
        Ok(self.map.clone())
    }

    fn close(&mut self, _group: FieldGroup) {
        self.group = None;
    }

    fn prepare(&mut self, op: Operation) -> Result<u64> {
        match op {
            Operation::SocketWrite => Ok(self.prepare_write()),
            _ => Ok(0),
        }
    }

    fn fire(&mut self, op: Operation) -> Result<Expected> {
        let Some(group) = self.group else {
            bail!("no calibration program loaded");
        };
        self.fired += 1;
        let expected_group = match op {
            Operation::Tcp4 | Operation::Tcp6 | Operation::Udp4 => FieldGroup::Socket,
            Operation::TcpTransfer => FieldGroup::TcpSeq,
            Operation::SocketWrite => FieldGroup::HttpFd,
            Operation::ConntrackInsert => FieldGroup::Conntrack,
        };
        if group != expected_group {
            bail!("{:?} is not observed by the {} program", op, group);
        }
        match op {
            Operation::Tcp4 => self.fire_tcp4(),
            Operation::Tcp6 => self.fire_tcp6(),
            Operation::Udp4 => self.fire_udp4(),
            Operation::TcpTransfer => self.fire_transfer(),
            Operation::SocketWrite => self.fire_write(),
            Operation::ConntrackInsert => self.fire_conntrack(),
        }
    }
}
