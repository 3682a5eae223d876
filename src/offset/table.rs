use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;

/// Format version written to the persisted table.
pub const TABLE_VERSION: u32 = 1;

/// Calibration experiments, each confirming a group of fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldGroup {
    /// Socket addressing, RTT, routing key and namespace fields.
    Socket,
    /// TCP sequence counters.
    TcpSeq,
    /// Task file table walk used by managed-runtime HTTP tracing.
    HttpFd,
    /// Conntrack tuple and namespace fields.
    Conntrack,
}

impl FieldGroup {
    pub const ALL: [FieldGroup; 4] = [
        FieldGroup::Socket,
        FieldGroup::TcpSeq,
        FieldGroup::HttpFd,
        FieldGroup::Conntrack,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FieldGroup::Socket => "socket",
            FieldGroup::TcpSeq => "tcp_seq",
            FieldGroup::HttpFd => "http_fd",
            FieldGroup::Conntrack => "conntrack",
        }
    }

    /// Fields the kernel side of this group reads at candidate offsets, in
    /// the order they appear in the guess status.
    pub fn fields(&self) -> &'static [OffsetField] {
        use OffsetField::*;
        match self {
            FieldGroup::Socket => &[
                SkNum,
                InetSport,
                SkFamily,
                SkRcvSaddr,
                SkDaddr,
                SkV6RcvSaddr,
                SkV6Daddr,
                SkDport,
                TcpSkSrttUs,
                TcpSkMdevUs,
                Flowi4Saddr,
                Flowi4Daddr,
                Flowi4Sport,
                Flowi4Dport,
                Flowi6Saddr,
                Flowi6Daddr,
                Flowi6Sport,
                Flowi6Dport,
                SkaddrSinPort,
                Skaddr6Sin6Port,
                SkNet,
                NsCommonInum,
                SocketSk,
            ],
            FieldGroup::TcpSeq => &[CopiedSeq, WriteSeq],
            FieldGroup::HttpFd => &[FilePrivateData, SocketFile, TaskStructFiles, FilesStructFdt],
            FieldGroup::Conntrack => &[CtNet, CtOriginTuple, CtReplyTuple],
        }
    }
}

impl fmt::Display for FieldGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FieldGroup {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        FieldGroup::ALL
            .into_iter()
            .find(|g| g.name() == s)
            .ok_or_else(|| anyhow!("unknown field group '{}'", s))
    }
}

macro_rules! offset_fields {
    ($($variant:ident => $name:literal,)*) => {
        /// A kernel struct field whose byte offset is discovered at runtime.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum OffsetField {
            $($variant,)*
        }

        impl OffsetField {
            pub const ALL: &'static [OffsetField] = &[$(OffsetField::$variant,)*];

            pub fn name(&self) -> &'static str {
                match self {
                    $(OffsetField::$variant => $name,)*
                }
            }
        }
    };
}

offset_fields! {
    SkNum => "sk_num",
    InetSport => "inet_sport",
    SkFamily => "sk_family",
    SkRcvSaddr => "sk_rcv_saddr",
    SkDaddr => "sk_daddr",
    SkV6RcvSaddr => "sk_v6_rcv_saddr",
    SkV6Daddr => "sk_v6_daddr",
    SkDport => "sk_dport",
    TcpSkSrttUs => "tcp_sk_srtt_us",
    TcpSkMdevUs => "tcp_sk_mdev_us",
    Flowi4Saddr => "flowi4_saddr",
    Flowi4Daddr => "flowi4_daddr",
    Flowi4Sport => "flowi4_sport",
    Flowi4Dport => "flowi4_dport",
    Flowi6Saddr => "flowi6_saddr",
    Flowi6Daddr => "flowi6_daddr",
    Flowi6Sport => "flowi6_sport",
    Flowi6Dport => "flowi6_dport",
    SkaddrSinPort => "skaddr_sin_port",
    Skaddr6Sin6Port => "skaddr6_sin6_port",
    SkNet => "sk_net",
    NsCommonInum => "ns_common_inum",
    SocketSk => "socket_sk",
    CopiedSeq => "copied_seq",
    WriteSeq => "write_seq",
    TaskStructFiles => "task_struct_files",
    FilesStructFdt => "files_struct_fdt",
    SocketFile => "socket_file",
    FilePrivateData => "file_private_data",
    CtNet => "ct_net",
    CtOriginTuple => "ct_origin_tuple",
    CtReplyTuple => "ct_reply_tuple",
}

pub const FIELD_COUNT: usize = OffsetField::ALL.len();

impl OffsetField {
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Key under which the field is persisted.
    pub fn key(&self) -> String {
        format!("offset_{}", self.name())
    }

    /// Field that is computed from another one instead of being searched.
    pub fn is_derived(&self) -> bool {
        use OffsetField::*;
        matches!(
            self,
            SkNum
                | SkRcvSaddr
                | SkV6RcvSaddr
                | Flowi4Sport
                | Flowi6Saddr
                | Flowi6Daddr
                | Flowi6Sport
                | Flowi6Dport
        )
    }
}

impl fmt::Display for OffsetField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Byte offsets of every kernel field of interest for the running kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetTable {
    values: [u64; FIELD_COUNT],
    /// major << 48 | minor << 32 | patch << 16
    pub kernel_version: u64,
    calibrated: BTreeSet<FieldGroup>,
}

impl Default for OffsetTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetTable {
    pub fn new() -> Self {
        Self {
            values: [0; FIELD_COUNT],
            kernel_version: 0,
            calibrated: BTreeSet::new(),
        }
    }

    pub fn get(&self, field: OffsetField) -> u64 {
        self.values[field.index()]
    }

    pub fn set(&mut self, field: OffsetField, value: u64) {
        self.values[field.index()] = value;
    }

    pub fn is_calibrated(&self, group: FieldGroup) -> bool {
        self.calibrated.contains(&group)
    }

    pub fn mark_calibrated(&mut self, group: FieldGroup) {
        self.calibrated.insert(group);
    }

    pub fn calibrated(&self) -> impl Iterator<Item = FieldGroup> + '_ {
        self.calibrated.iter().copied()
    }

    /// Reset a group's fields to zero and forget that it was calibrated.
    pub fn clear_group(&mut self, group: FieldGroup) {
        for field in group.fields() {
            self.set(*field, 0);
        }
        self.calibrated.remove(&group);
    }

    /// Constant slots handed to probe programs: one per field in
    /// declaration order followed by the kernel version.
    pub fn as_constants(&self) -> Vec<u64> {
        let mut slots = self.values.to_vec();
        slots.push(self.kernel_version);
        slots
    }

    /// Serialize as newline-delimited `key=value` pairs.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("version={}\n", TABLE_VERSION));
        out.push_str(&format!("kernel_version={}\n", self.kernel_version));
        let groups: Vec<&str> = self.calibrated.iter().map(|g| g.name()).collect();
        out.push_str(&format!("groups={}\n", groups.join(",")));
        for field in OffsetField::ALL {
            out.push_str(&format!("{}={}\n", field.key(), self.get(*field)));
        }
        out
    }

    /// Parse a table written by [`OffsetTable::dump`]. Unknown keys are
    /// ignored, a missing offset is an error.
    pub fn load(text: &str) -> Result<Self> {
        let mut table = OffsetTable::new();
        let mut seen = [false; FIELD_COUNT];
        let mut version = None;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!("line {}: expected key=value", lineno + 1);
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "version" => version = Some(value.parse::<u32>()?),
                "kernel_version" => {
                    table.kernel_version = value
                        .parse()
                        .with_context(|| format!("line {}: bad kernel_version", lineno + 1))?
                }
                "groups" => {
                    for name in value.split(',').filter(|s| !s.is_empty()) {
                        table.calibrated.insert(name.parse()?);
                    }
                }
                _ => {
                    if let Some(field) = OffsetField::ALL.iter().find(|f| f.key() == key) {
                        let v = value.parse().with_context(|| {
                            format!("line {}: bad value for {}", lineno + 1, key)
                        })?;
                        table.set(*field, v);
                        seen[field.index()] = true;
                    }
                }
            }
        }
        match version {
            Some(TABLE_VERSION) => {}
            Some(v) => bail!("unsupported offset table version {}", v),
            None => bail!("offset table has no version"),
        }
        if let Some(missing) = OffsetField::ALL.iter().find(|f| !seen[f.index()]) {
            bail!("offset table is missing {}", missing.key());
        }
        Ok(table)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::load(&text).with_context(|| format!("Corrupt offset table {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.dump()).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to rename {}", tmp.display()))?;
        Ok(())
    }
}

/// Pack a `major.minor.patch` release string into 16-bit lanes.
pub fn parse_kernel_version(release: &str) -> Result<u64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^(\d+)\.(\d+)(?:\.(\d+))?").expect("valid kernel version regex")
    });
    let caps = re
        .captures(release.trim())
        .ok_or_else(|| anyhow!("unrecognized kernel release '{}'", release.trim()))?;
    let lane = |i: usize| -> Result<u64> {
        match caps.get(i) {
            Some(m) => Ok(m.as_str().parse::<u64>()? & 0xffff),
            None => Ok(0),
        }
    };
    Ok(lane(1)? << 48 | lane(2)? << 32 | lane(3)? << 16)
}

/// Version of the running kernel.
pub fn kernel_version() -> Result<u64> {
    let release = fs::read_to_string("/proc/sys/kernel/osrelease")
        .context("Failed to read kernel release")?;
    parse_kernel_version(&release)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OffsetTable {
        let mut t = OffsetTable::new();
        for (i, field) in OffsetField::ALL.iter().enumerate() {
            t.set(*field, 100 + i as u64 * 3);
        }
        t.kernel_version = parse_kernel_version("6.8.12-generic").unwrap();
        t.mark_calibrated(FieldGroup::Socket);
        t.mark_calibrated(FieldGroup::Conntrack);
        t
    }

    #[test]
    fn test_dump_then_load_is_identity() {
        let t = sample();
        let loaded = OffsetTable::load(&t.dump()).unwrap();
        assert_eq!(loaded, t);
        for field in OffsetField::ALL {
            assert_eq!(loaded.get(*field), t.get(*field), "{}", field);
        }
    }

    #[test]
    fn test_persisted_keys() {
        let text = sample().dump();
        assert!(text.contains("offset_sk_num="));
        assert!(text.contains("offset_task_struct_files="));
        assert!(text.contains("offset_ct_reply_tuple="));
        assert!(text.contains("groups=socket,conntrack\n"));
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let text: String = sample()
            .dump()
            .lines()
            .filter(|l| !l.starts_with("offset_sk_dport="))
            .map(|l| format!("{l}\n"))
            .collect();
        let err = OffsetTable::load(&text).unwrap_err();
        assert!(err.to_string().contains("offset_sk_dport"));
    }

    #[test]
    fn test_corrupt_input_is_an_error() {
        assert!(OffsetTable::load("").is_err());
        assert!(OffsetTable::load("version=1\noffset_sk_num=abc\n").is_err());
        assert!(OffsetTable::load("garbage").is_err());
        let bumped = sample().dump().replace("version=1", "version=9");
        assert!(OffsetTable::load(&bumped).is_err());
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let text = format!("{}offset_from_the_future=12\n", sample().dump());
        assert_eq!(OffsetTable::load(&text).unwrap(), sample());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("hostflow.offset");
        sample().save(&path).unwrap();
        assert_eq!(OffsetTable::load_file(&path).unwrap(), sample());
    }

    #[test]
    fn test_parse_kernel_version() {
        assert_eq!(
            parse_kernel_version("4.4.0").unwrap(),
            0x0004_0004_0000_0000
        );
        assert_eq!(
            parse_kernel_version("6.18.44-fc-v130\n").unwrap(),
            6 << 48 | 18 << 32 | 44 << 16
        );
        assert_eq!(parse_kernel_version("5.10").unwrap(), 5 << 48 | 10 << 32);
        assert!(parse_kernel_version("linux").is_err());
    }

    #[test]
    fn test_group_fields_are_disjoint() {
        let mut seen = BTreeSet::new();
        for group in FieldGroup::ALL {
            for field in group.fields() {
                assert!(seen.insert(*field), "{} listed twice", field);
            }
        }
        assert_eq!(seen.len(), FIELD_COUNT);
    }

    #[test]
    fn test_constants_layout() {
        let t = sample();
        let slots = t.as_constants();
        assert_eq!(slots.len(), FIELD_COUNT + 1);
        assert_eq!(slots[OffsetField::SkDport.index()], t.get(OffsetField::SkDport));
        assert_eq!(slots[FIELD_COUNT], t.kernel_version);
    }
}
