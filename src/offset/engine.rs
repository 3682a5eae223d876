use std::fs;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::AgentConfig;
use crate::conn::{CONN_L3_IPV4, CONN_L3_IPV6, CONN_L3_MASK, CONN_L4_TCP, CONN_L4_UDP};
use crate::offset::status::{
    CtObservation, FdObservation, GuessStatus, Observation, SeqObservation, SockObservation,
    ERR_FILES_FDT, ERR_SK_NET, ERR_TASK_FILES, STATE_RECORDED, STATE_WAITING,
};
use crate::offset::table::{FieldGroup, OffsetField, OffsetTable, FIELD_COUNT};
use crate::offset::{
    ceiling, DiscoveryError, Expected, GuessEnv, Operation, FILES_STRUCT_MAX_OFFSET,
    MIN_SUCCESS, NET_INUM_MAX_OFFSET, POINTER_STRIDE,
};
use crate::probe::{slot_key, ProbeMap};

use OffsetField::*;

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub socket_attempts: u32,
    pub tcp_seq_attempts: u32,
    pub http_attempts: u32,
    pub conntrack_attempts: u32,
    /// Sleep between attempts of the same group.
    pub backoff: Duration,
    /// Sleep after a round the kernel side did not record.
    pub lost_sleep: Duration,
    /// Rounds allowed per attempt, lost rounds included.
    pub max_rounds: u64,
    /// Skip the TCP6 round and leave the IPv6 socket fields at zero.
    pub ipv6_disabled: bool,
    pub kernel_version: u64,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            socket_attempts: 5,
            tcp_seq_attempts: 5,
            http_attempts: 5,
            conntrack_attempts: 8,
            backoff: Duration::from_secs(5),
            lost_sleep: Duration::from_millis(20),
            max_rounds: 40_000,
            ipv6_disabled: false,
            kernel_version: 0,
        }
    }
}

impl DiscoveryOptions {
    pub fn from_config(config: &AgentConfig, kernel_version: u64) -> Self {
        Self {
            backoff: Duration::from_millis(config.discovery_backoff_ms),
            ipv6_disabled: config.ipv6_disabled,
            kernel_version,
            ..Default::default()
        }
    }

    fn attempts(&self, group: FieldGroup) -> u32 {
        match group {
            FieldGroup::Socket => self.socket_attempts,
            FieldGroup::TcpSeq => self.tcp_seq_attempts,
            FieldGroup::HttpFd => self.http_attempts,
            FieldGroup::Conntrack => self.conntrack_attempts,
        }
    }
}

/// Who the kernel side should record for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuessIdentity {
    pub pid_tgid: u64,
    pub process_name: String,
}

impl GuessIdentity {
    /// The calling thread.
    pub fn current() -> Self {
        let pid = nix::unistd::getpid().as_raw() as u64;
        let tid = nix::unistd::gettid().as_raw() as u64;
        let process_name = fs::read_to_string("/proc/self/comm")
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|_| "hostflow".to_string());
        Self {
            pid_tgid: pid << 32 | tid,
            process_name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryReport {
    pub table: OffsetTable,
    /// Groups other than the socket group that could not be calibrated.
    pub failures: Vec<DiscoveryError>,
    /// Candidate advances across all groups and attempts.
    pub advances: u64,
    pub rounds: u64,
    pub lost_rounds: u64,
}

impl DiscoveryReport {
    pub fn failed(&self, group: FieldGroup) -> bool {
        self.failures.iter().any(|e| e.group() == Some(group))
    }
}

/// Candidate state of one attempt.
struct Search {
    table: OffsetTable,
    ok: [u32; FIELD_COUNT],
    advances: u64,
    rounds: u64,
    lost: u64,
}

impl Search {
    fn new(table: OffsetTable) -> Self {
        Self {
            table,
            ok: [0; FIELD_COUNT],
            advances: 0,
            rounds: 0,
            lost: 0,
        }
    }

    fn get(&self, field: OffsetField) -> u64 {
        self.table.get(field)
    }

    fn confirmed(&self, field: OffsetField) -> bool {
        self.ok[field.index()] > MIN_SUCCESS
    }

    fn advance(&mut self, field: OffsetField, step: u64) {
        let next = self.get(field) + step;
        self.table.set(field, next);
        self.ok[field.index()] = 0;
        self.advances += 1;
    }

    fn check(&mut self, field: OffsetField, matched: bool) {
        if self.confirmed(field) {
            return;
        }
        if matched {
            self.ok[field.index()] += 1;
        } else {
            self.advance(field, 1);
        }
    }

    /// `sk_net` and `ns_common_inum` are searched together: a faulting
    /// pointer moves the pointer candidate and restarts the inode search.
    fn check_netns(&mut self, err: u32, matched: bool) {
        if self.confirmed(SkNet) && self.confirmed(NsCommonInum) {
            return;
        }
        if err == ERR_SK_NET {
            self.advance(SkNet, 1);
            self.table.set(NsCommonInum, 0);
            self.ok[NsCommonInum.index()] = 0;
        } else if matched {
            self.ok[SkNet.index()] += 1;
            self.ok[NsCommonInum.index()] += 1;
        } else {
            self.ok[SkNet.index()] = 0;
            self.advance(NsCommonInum, 1);
            if self.get(NsCommonInum) > NET_INUM_MAX_OFFSET {
                self.advance(SkNet, 1);
                self.table.set(NsCommonInum, 0);
            }
        }
    }

    /// `task_struct->files` and `files_struct->fdt`, walked at pointer stride.
    fn check_fd_walk(&mut self, err: u32, matched: bool) {
        if self.confirmed(TaskStructFiles) && self.confirmed(FilesStructFdt) {
            return;
        }
        if err == ERR_TASK_FILES {
            self.advance(TaskStructFiles, POINTER_STRIDE);
            self.table.set(FilesStructFdt, 0);
            self.ok[FilesStructFdt.index()] = 0;
        } else if err == ERR_FILES_FDT || !matched {
            self.ok[TaskStructFiles.index()] = 0;
            self.advance(FilesStructFdt, POINTER_STRIDE);
            if self.get(FilesStructFdt) > FILES_STRUCT_MAX_OFFSET {
                self.advance(TaskStructFiles, POINTER_STRIDE);
                self.table.set(FilesStructFdt, 0);
            }
        } else {
            self.ok[TaskStructFiles.index()] += 1;
            self.ok[FilesStructFdt.index()] += 1;
        }
    }

    fn check_ct_net(&mut self, err: u32, matched: bool) {
        if self.confirmed(CtNet) {
            return;
        }
        if err == ERR_SK_NET || !matched {
            self.advance(CtNet, 1);
        } else {
            self.ok[CtNet.index()] += 1;
        }
    }

    fn all_confirmed(&self, fields: &[OffsetField]) -> bool {
        fields.iter().all(|f| self.confirmed(*f))
    }

    fn check_ceilings(&self, group: FieldGroup, fields: &[OffsetField]) -> Result<(), DiscoveryError> {
        for field in fields {
            if !self.confirmed(*field) && self.get(*field) > ceiling(*field) {
                return Err(DiscoveryError::Exhausted {
                    group,
                    field: *field,
                    offset: self.get(*field),
                });
            }
        }
        Ok(())
    }
}

/// Runs the guess protocol of each field group against a [`GuessEnv`].
pub struct Discoverer {
    opts: DiscoveryOptions,
    identity: GuessIdentity,
    cancel: CancelToken,
}

impl Discoverer {
    pub fn new(opts: DiscoveryOptions, identity: GuessIdentity, cancel: CancelToken) -> Self {
        Self {
            opts,
            identity,
            cancel,
        }
    }

    /// Calibrate the socket group and then every other requested group.
    ///
    /// A socket group failure is returned as the error since every other
    /// group reads through socket offsets. Failures of the other groups are
    /// collected in the report and their fields are left at zero.
    pub fn discover(
        &self,
        env: &mut dyn GuessEnv,
        hint: Option<&OffsetTable>,
        groups: &[FieldGroup],
    ) -> Result<DiscoveryReport, DiscoveryError> {
        let mut report = DiscoveryReport {
            table: OffsetTable::new(),
            failures: Vec::new(),
            advances: 0,
            rounds: 0,
            lost_rounds: 0,
        };
        report.table.kernel_version = self.opts.kernel_version;

        self.calibrate(env, FieldGroup::Socket, hint, &mut report)?;
        for group in groups.iter().filter(|g| **g != FieldGroup::Socket) {
            match self.calibrate(env, *group, hint, &mut report) {
                Ok(()) => {}
                Err(DiscoveryError::Cancelled) => return Err(DiscoveryError::Cancelled),
                Err(e) => {
                    report.table.clear_group(*group);
                    report.failures.push(e);
                }
            }
        }
        Ok(report)
    }

    fn calibrate(
        &self,
        env: &mut dyn GuessEnv,
        group: FieldGroup,
        hint: Option<&OffsetTable>,
        report: &mut DiscoveryReport,
    ) -> Result<(), DiscoveryError> {
        let mut hint = hint.filter(|h| h.is_calibrated(group));
        let attempts = self.opts.attempts(group);
        let mut last = DiscoveryError::RoundBudget { group, rounds: 0 };

        for attempt in 1..=attempts {
            if attempt > 1 && self.cancel.wait_timeout(self.opts.backoff) {
                return Err(DiscoveryError::Cancelled);
            }
            let mut search = Search::new(report.table.clone());
            for field in group.fields() {
                search
                    .table
                    .set(*field, hint.map_or(0, |h| h.get(*field)));
            }

            let result = match env.open(group, &report.table) {
                Ok(map) => {
                    let result = self.attempt(env, map.as_ref(), group, &mut search);
                    env.close(group);
                    result
                }
                Err(e) => Err(DiscoveryError::Probe {
                    group,
                    message: format!("{e:#}"),
                }),
            };
            report.advances += search.advances;
            report.rounds += search.rounds;
            report.lost_rounds += search.lost;

            match result {
                Ok(()) => {
                    info!(
                        group = %group,
                        attempt,
                        rounds = search.rounds,
                        advances = search.advances,
                        "offsets confirmed"
                    );
                    for field in group.fields() {
                        debug!(field = %field, offset = search.get(*field), "offset");
                    }
                    report.table = search.table;
                    report.table.mark_calibrated(group);
                    return Ok(());
                }
                Err(DiscoveryError::Cancelled) => return Err(DiscoveryError::Cancelled),
                Err(e) => {
                    warn!(group = %group, attempt, attempts, error = %e, "offset guess attempt failed");
                    if hint.take().is_some() {
                        info!(group = %group, "dropping stale offset hint");
                    }
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn attempt(
        &self,
        env: &mut dyn GuessEnv,
        map: &dyn ProbeMap,
        group: FieldGroup,
        search: &mut Search,
    ) -> Result<(), DiscoveryError> {
        match group {
            FieldGroup::Socket => self.guess_socket(env, map, search),
            FieldGroup::TcpSeq => self.guess_tcp_seq(env, map, search),
            FieldGroup::HttpFd => self.guess_http_fd(env, map, search),
            FieldGroup::Conntrack => self.guess_conntrack(env, map, search),
        }
    }

    /// Run one controlled operation and collect what the kernel recorded.
    /// `None` means the round was lost.
    fn round<O: Observation>(
        &self,
        env: &mut dyn GuessEnv,
        map: &dyn ProbeMap,
        group: FieldGroup,
        search: &mut Search,
        op: Operation,
        conn_type: u32,
    ) -> Result<Option<(GuessStatus<O>, Expected)>, DiscoveryError> {
        if self.cancel.is_cancelled() {
            return Err(DiscoveryError::Cancelled);
        }
        if search.rounds >= self.opts.max_rounds {
            return Err(DiscoveryError::RoundBudget {
                group,
                rounds: search.rounds,
            });
        }
        search.rounds += 1;

        let probe_err = |e: anyhow::Error| DiscoveryError::Probe {
            group,
            message: format!("{e:#}"),
        };
        let arg = env.prepare(op).map_err(probe_err)?;
        let status = GuessStatus::<O> {
            state: STATE_WAITING,
            pid_tgid: self.identity.pid_tgid,
            process_name: self.identity.process_name.clone(),
            conn_type,
            err: 0,
            arg,
            offsets: group.fields().iter().map(|f| search.get(*f)).collect(),
            observed: O::default(),
        };
        let key = slot_key(0);
        map.update(&key, &status.encode()).map_err(probe_err)?;
        let expected = env.fire(op).map_err(probe_err)?;

        let recorded = match map.lookup(&key).map_err(probe_err)? {
            Some(raw) => GuessStatus::<O>::decode(&raw, group)
                .map_err(|error| DiscoveryError::Decode { group, error })?,
            None => return self.lost(search),
        };
        if recorded.state != STATE_RECORDED {
            return self.lost(search);
        }
        Ok(Some((recorded, expected)))
    }

    fn lost<T>(&self, search: &mut Search) -> Result<Option<T>, DiscoveryError> {
        search.lost += 1;
        if self.cancel.wait_timeout(self.opts.lost_sleep) {
            return Err(DiscoveryError::Cancelled);
        }
        Ok(None)
    }

    fn guess_socket(
        &self,
        env: &mut dyn GuessEnv,
        map: &dyn ProbeMap,
        s: &mut Search,
    ) -> Result<(), DiscoveryError> {
        let group = FieldGroup::Socket;
        let mut required = vec![
            InetSport,
            SkDport,
            SkFamily,
            SkDaddr,
            TcpSkSrttUs,
            TcpSkMdevUs,
            Flowi4Saddr,
            Flowi4Daddr,
            Flowi4Dport,
            SkaddrSinPort,
            SkNet,
            NsCommonInum,
            SocketSk,
        ];
        if !self.opts.ipv6_disabled {
            required.extend([SkV6Daddr, Skaddr6Sin6Port]);
        }

        while !s.all_confirmed(&required) {
            let tcp4 = CONN_L3_IPV4 | CONN_L4_TCP;
            if let Some((st, exp)) =
                self.round::<SockObservation>(env, map, group, s, Operation::Tcp4, tcp4)?
            {
                let o = &st.observed;
                s.check(InetSport, o.sport == exp.sport);
                s.check(SkDport, o.dport == exp.dport);
                s.check(TcpSkSrttUs, o.rtt == exp.rtt);
                s.check(TcpSkMdevUs, o.rtt_var == exp.rtt_var);
                s.check(SkDaddr, o.daddr == exp.daddr);
                s.check(SkFamily, o.meta & CONN_L3_MASK == exp.meta & CONN_L3_MASK);
                s.check(SkaddrSinPort, o.skaddr_port == exp.dport);
                s.check_netns(st.err, o.netns == exp.netns);
                // socket->sk is verified through the port fields
                if s.confirmed(InetSport) && s.confirmed(SkDport) {
                    s.check(
                        SocketSk,
                        o.sport_via_socket == exp.sport && o.dport_via_socket == exp.dport,
                    );
                }
            }

            if !self.opts.ipv6_disabled && !s.all_confirmed(&[SkV6Daddr, Skaddr6Sin6Port]) {
                let tcp6 = CONN_L3_IPV6 | CONN_L4_TCP;
                if let Some((st, exp)) =
                    self.round::<SockObservation>(env, map, group, s, Operation::Tcp6, tcp6)?
                {
                    let o = &st.observed;
                    s.check(SkV6Daddr, o.daddr == exp.daddr);
                    s.check(SkFamily, o.meta & CONN_L3_MASK == exp.meta & CONN_L3_MASK);
                    s.check(Skaddr6Sin6Port, o.skaddr6_port == exp.dport);
                }
            }

            if !s.all_confirmed(&[Flowi4Saddr, Flowi4Daddr, Flowi4Dport]) {
                let udp4 = CONN_L3_IPV4 | CONN_L4_UDP;
                if let Some((st, exp)) =
                    self.round::<SockObservation>(env, map, group, s, Operation::Udp4, udp4)?
                {
                    let o = &st.observed;
                    s.check(Flowi4Saddr, o.saddr == exp.saddr);
                    s.check(Flowi4Daddr, o.daddr == exp.daddr);
                    s.check(Flowi4Dport, o.dport == exp.dport);
                }
            }

            s.check_ceilings(group, &required)?;
        }

        let t = &mut s.table;
        t.set(SkNum, t.get(SkDport) + 2);
        t.set(SkRcvSaddr, t.get(SkDaddr) + 4);
        if !self.opts.ipv6_disabled {
            t.set(SkV6RcvSaddr, t.get(SkV6Daddr) + 16);
        }
        t.set(Flowi4Sport, t.get(Flowi4Dport) + 2);
        let flowi6_daddr = t.get(Flowi4Saddr).min(t.get(Flowi4Daddr));
        t.set(Flowi6Daddr, flowi6_daddr);
        t.set(Flowi6Saddr, flowi6_daddr + 16);
        t.set(Flowi6Dport, flowi6_daddr + 36);
        t.set(Flowi6Sport, flowi6_daddr + 38);
        Ok(())
    }

    fn guess_tcp_seq(
        &self,
        env: &mut dyn GuessEnv,
        map: &dyn ProbeMap,
        s: &mut Search,
    ) -> Result<(), DiscoveryError> {
        let group = FieldGroup::TcpSeq;
        let required = [CopiedSeq, WriteSeq];
        while !s.all_confirmed(&required) {
            let tcp4 = CONN_L3_IPV4 | CONN_L4_TCP;
            if let Some((st, exp)) = self.round::<SeqObservation>(
                env,
                map,
                group,
                s,
                Operation::TcpTransfer,
                tcp4,
            )? {
                let o = &st.observed;
                s.check(
                    CopiedSeq,
                    o.copied_after.wrapping_sub(o.copied_before) == exp.bytes,
                );
                s.check(
                    WriteSeq,
                    o.write_after.wrapping_sub(o.write_before) == exp.bytes,
                );
            }
            s.check_ceilings(group, &required)?;
        }
        Ok(())
    }

    fn guess_http_fd(
        &self,
        env: &mut dyn GuessEnv,
        map: &dyn ProbeMap,
        s: &mut Search,
    ) -> Result<(), DiscoveryError> {
        let group = FieldGroup::HttpFd;
        let required = [FilePrivateData, SocketFile, TaskStructFiles, FilesStructFdt];
        while !s.all_confirmed(&required) {
            let tcp4 = CONN_L3_IPV4 | CONN_L4_TCP;
            if let Some((st, exp)) = self.round::<FdObservation>(
                env,
                map,
                group,
                s,
                Operation::SocketWrite,
                tcp4,
            )? {
                let o = &st.observed;
                s.check(
                    FilePrivateData,
                    o.sport == exp.sport && o.dport == exp.dport,
                );
                if s.confirmed(FilePrivateData) {
                    s.check(SocketFile, o.file_ptr != 0 && o.socket_file_ptr == o.file_ptr);
                }
                s.check_fd_walk(st.err, o.file_ptr != 0 && o.task_file_ptr == o.file_ptr);
            }
            s.check_ceilings(group, &[FilePrivateData, SocketFile, TaskStructFiles])?;
        }
        Ok(())
    }

    fn guess_conntrack(
        &self,
        env: &mut dyn GuessEnv,
        map: &dyn ProbeMap,
        s: &mut Search,
    ) -> Result<(), DiscoveryError> {
        let group = FieldGroup::Conntrack;
        let required = [CtNet, CtOriginTuple, CtReplyTuple];
        while !s.all_confirmed(&required) {
            let tcp4 = CONN_L3_IPV4 | CONN_L4_TCP;
            if let Some((st, exp)) = self.round::<CtObservation>(
                env,
                map,
                group,
                s,
                Operation::ConntrackInsert,
                tcp4,
            )? {
                let o = &st.observed;
                let origin = o.origin.src == exp.saddr
                    && o.origin.dst == exp.daddr
                    && o.origin.sport == exp.sport
                    && o.origin.dport == exp.dport;
                let reply = o.reply.src == exp.daddr
                    && o.reply.dst == exp.saddr
                    && o.reply.sport == exp.dport
                    && o.reply.dport == exp.sport;
                s.check(CtOriginTuple, origin);
                s.check(CtReplyTuple, reply);
                s.check_ct_net(st.err, o.netns == exp.netns);
            }
            s.check_ceilings(group, &required)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::sim::{sample_layout, SimulatedKernel};

    fn discoverer(cancel: CancelToken) -> Discoverer {
        let opts = DiscoveryOptions {
            backoff: Duration::ZERO,
            lost_sleep: Duration::ZERO,
            ..Default::default()
        };
        let identity = GuessIdentity {
            pid_tgid: 4242 << 32 | 4242,
            process_name: "hostflow".into(),
        };
        Discoverer::new(opts, identity, cancel)
    }

    fn assert_groups_match(found: &OffsetTable, truth: &OffsetTable, groups: &[FieldGroup]) {
        for group in groups {
            for field in group.fields() {
                assert_eq!(found.get(*field), truth.get(*field), "{}", field);
            }
            assert!(found.is_calibrated(*group), "{} not calibrated", group);
        }
    }

    #[test]
    fn test_discovers_every_group_from_scratch() {
        let mut sim = SimulatedKernel::new(sample_layout(), 1);
        let report = discoverer(CancelToken::new())
            .discover(&mut sim, None, &FieldGroup::ALL)
            .unwrap();
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_groups_match(&report.table, &sample_layout(), &FieldGroup::ALL);
        assert!(report.advances > 0);
    }

    #[test]
    fn test_confirmed_hint_needs_no_advances() {
        let d = discoverer(CancelToken::new());
        let mut sim = SimulatedKernel::new(sample_layout(), 2);
        let first = d.discover(&mut sim, None, &FieldGroup::ALL).unwrap();

        let mut sim = SimulatedKernel::new(sample_layout(), 3);
        let second = d
            .discover(&mut sim, Some(&first.table), &FieldGroup::ALL)
            .unwrap();
        assert_eq!(second.advances, 0);
        assert_eq!(second.table, first.table);
    }

    #[test]
    fn test_stale_hint_is_dropped_after_a_failed_attempt() {
        let mut hint = sample_layout();
        // Past the real offset, the search can only run into the ceiling.
        hint.set(InetSport, hint.get(InetSport) + 4);
        let mut sim = SimulatedKernel::new(sample_layout(), 4);
        let report = discoverer(CancelToken::new())
            .discover(&mut sim, Some(&hint), &[FieldGroup::Socket])
            .unwrap();
        assert_eq!(report.table.get(InetSport), sample_layout().get(InetSport));
        assert_eq!(
            sim.opened()
                .iter()
                .filter(|g| **g == FieldGroup::Socket)
                .count(),
            2
        );
    }

    #[test]
    fn test_lost_rounds_are_retried() {
        let mut sim = SimulatedKernel::new(sample_layout(), 5);
        sim.lose_rounds(3);
        let report = discoverer(CancelToken::new())
            .discover(&mut sim, Some(&sample_layout()), &[FieldGroup::Socket])
            .unwrap();
        assert_eq!(report.lost_rounds, 3);
        assert_eq!(report.advances, 0);
        assert_groups_match(&report.table, &sample_layout(), &[FieldGroup::Socket]);
    }

    #[test]
    fn test_sk_net_faults_restart_the_inode_search() {
        let mut hint = sample_layout();
        // Wrong namespace pointer with the right inode offset
        hint.set(SkNet, hint.get(SkNet) - 8);
        let mut sim = SimulatedKernel::new(sample_layout(), 6);
        let report = discoverer(CancelToken::new())
            .discover(&mut sim, Some(&hint), &[FieldGroup::Socket])
            .unwrap();
        assert_eq!(report.table.get(SkNet), sample_layout().get(SkNet));
        assert_eq!(
            report.table.get(NsCommonInum),
            sample_layout().get(NsCommonInum)
        );
        // 8 pointer advances, then the inode search from zero
        assert_eq!(report.advances, 8 + sample_layout().get(NsCommonInum));
    }

    #[test]
    fn test_derived_offsets() {
        let mut sim = SimulatedKernel::new(sample_layout(), 7);
        let report = discoverer(CancelToken::new())
            .discover(&mut sim, Some(&sample_layout()), &[FieldGroup::Socket])
            .unwrap();
        let t = &report.table;
        assert_eq!(t.get(SkNum), t.get(SkDport) + 2);
        assert_eq!(t.get(SkRcvSaddr), t.get(SkDaddr) + 4);
        assert_eq!(t.get(SkV6RcvSaddr), t.get(SkV6Daddr) + 16);
        assert_eq!(t.get(Flowi4Sport), t.get(Flowi4Dport) + 2);
        assert_eq!(t.get(Flowi6Daddr), 40);
        assert_eq!(t.get(Flowi6Saddr), 56);
        assert_eq!(t.get(Flowi6Dport), 76);
        assert_eq!(t.get(Flowi6Sport), 78);
    }

    #[test]
    fn test_failed_group_is_reported_and_cleared() {
        let mut sim = SimulatedKernel::new(sample_layout(), 8);
        sim.fail_open(FieldGroup::HttpFd);
        let report = discoverer(CancelToken::new())
            .discover(&mut sim, Some(&sample_layout()), &FieldGroup::ALL)
            .unwrap();
        assert!(report.failed(FieldGroup::HttpFd));
        assert!(!report.failed(FieldGroup::Conntrack));
        assert!(!report.table.is_calibrated(FieldGroup::HttpFd));
        assert_eq!(report.table.get(TaskStructFiles), 0);
        assert_groups_match(
            &report.table,
            &sample_layout(),
            &[FieldGroup::Socket, FieldGroup::TcpSeq, FieldGroup::Conntrack],
        );
        let http_opens = sim
            .opened()
            .iter()
            .filter(|g| **g == FieldGroup::HttpFd)
            .count();
        assert_eq!(http_opens, 5);
    }

    #[test]
    fn test_socket_group_failure_is_an_error() {
        let mut sim = SimulatedKernel::new(sample_layout(), 9);
        sim.fail_open(FieldGroup::Socket);
        let err = discoverer(CancelToken::new())
            .discover(&mut sim, None, &FieldGroup::ALL)
            .unwrap_err();
        assert_eq!(err.group(), Some(FieldGroup::Socket));
        assert!(err.to_string().contains("offset_socket"));
    }

    #[test]
    fn test_cancelled_discovery_stops() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut sim = SimulatedKernel::new(sample_layout(), 10);
        let err = discoverer(cancel)
            .discover(&mut sim, None, &[FieldGroup::Socket])
            .unwrap_err();
        assert_eq!(err, DiscoveryError::Cancelled);
        assert_eq!(sim.fired(), 0);
    }

    #[test]
    fn test_ipv6_disabled_skips_v6_fields() {
        let d = Discoverer::new(
            DiscoveryOptions {
                backoff: Duration::ZERO,
                lost_sleep: Duration::ZERO,
                ipv6_disabled: true,
                ..Default::default()
            },
            GuessIdentity {
                pid_tgid: 1 << 32 | 1,
                process_name: "hostflow".into(),
            },
            CancelToken::new(),
        );
        let mut sim = SimulatedKernel::new(sample_layout(), 11);
        let report = d.discover(&mut sim, None, &[FieldGroup::Socket]).unwrap();
        assert_eq!(report.table.get(SkV6Daddr), 0);
        assert_eq!(report.table.get(InetSport), sample_layout().get(InetSport));
    }
}
