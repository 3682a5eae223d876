//! Go runtime function table (pclntab) parsing.
//!
//! Stripped Go binaries still carry the table the runtime uses for stack
//! unwinding. It maps every function's entry pc to its name, which is all
//! we need to place a uprobe. Supported layouts are the ones introduced by
//! Go 1.2, 1.16, 1.18 and 1.20.
use std::fmt;

use crate::layout::{DecodeError, Endian, Reader};

pub const MAGIC_GO12: u32 = 0xffff_fffb;
pub const MAGIC_GO116: u32 = 0xffff_fffa;
pub const MAGIC_GO118: u32 = 0xffff_fff0;
pub const MAGIC_GO120: u32 = 0xffff_fff1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PclnVersion {
    Go12,
    Go116,
    Go118,
    Go120,
}

impl PclnVersion {
    fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            MAGIC_GO12 => Some(PclnVersion::Go12),
            MAGIC_GO116 => Some(PclnVersion::Go116),
            MAGIC_GO118 => Some(PclnVersion::Go118),
            MAGIC_GO120 => Some(PclnVersion::Go120),
            _ => None,
        }
    }
}

impl fmt::Display for PclnVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PclnVersion::Go12 => "go1.2",
            PclnVersion::Go116 => "go1.16",
            PclnVersion::Go118 => "go1.18",
            PclnVersion::Go120 => "go1.20",
        };
        f.write_str(s)
    }
}

/// Whether `data` starts with something that looks like a pclntab header.
pub fn looks_like_header(data: &[u8]) -> bool {
    if data.len() < 8 || data[4] != 0 || data[5] != 0 {
        return false;
    }
    let magic_le = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let magic_be = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    (PclnVersion::from_magic(magic_le).is_some() || PclnVersion::from_magic(magic_be).is_some())
        && matches!(data[6], 1 | 2 | 4)
        && matches!(data[7], 4 | 8)
}

/// Checked `base + index * scale` for offsets taken from the table itself.
fn slot(base: usize, index: usize, scale: usize) -> Result<usize, DecodeError> {
    index
        .checked_mul(scale)
        .and_then(|off| off.checked_add(base))
        .ok_or(DecodeError::Invalid {
            field: "pclntab offset",
            value: index as u64,
        })
}

fn word_to_usize(field: &'static str, value: u64) -> Result<usize, DecodeError> {
    usize::try_from(value).map_err(|_| DecodeError::Invalid { field, value })
}

/// One function of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncEntry {
    pub entry: u64,
    /// Entry of the next function.
    pub end: u64,
}

pub struct LineTable<'a> {
    data: &'a [u8],
    endian: Endian,
    version: PclnVersion,
    ptr_size: usize,
    nfunc: usize,
    text_start: u64,
    funcname_off: usize,
    funcdata_off: usize,
}

impl<'a> LineTable<'a> {
    /// Parse the header. `text_start` is used by the 1.18+ layouts when the
    /// header's own text start is zero, which happens in position
    /// independent binaries where the field is filled by a relocation.
    pub fn parse(data: &'a [u8], text_start: u64) -> Result<Self, DecodeError> {
        if !looks_like_header(data) {
            let r = Reader::new(data);
            return Err(DecodeError::Invalid {
                field: "pclntab magic",
                value: r.u32(0).map(u64::from).unwrap_or(0),
            });
        }
        let raw = [data[0], data[1], data[2], data[3]];
        let (endian, version) = if let Some(v) = PclnVersion::from_magic(u32::from_le_bytes(raw)) {
            (Endian::Little, v)
        } else if let Some(v) = PclnVersion::from_magic(u32::from_be_bytes(raw)) {
            (Endian::Big, v)
        } else {
            return Err(DecodeError::Invalid {
                field: "pclntab magic",
                value: u32::from_le_bytes(raw) as u64,
            });
        };
        let ptr_size = data[7] as usize;
        let r = Reader::with_endian(data, endian);
        let word = |i: usize| -> Result<u64, DecodeError> { r.uint(8 + i * ptr_size, ptr_size) };

        let mut table = LineTable {
            data,
            endian,
            version,
            ptr_size,
            nfunc: word_to_usize("pclntab nfunc", word(0)?)?,
            text_start: 0,
            funcname_off: 0,
            funcdata_off: 0,
        };
        match version {
            PclnVersion::Go12 => {
                table.funcdata_off = 8 + ptr_size;
            }
            PclnVersion::Go116 => {
                table.funcname_off = word_to_usize("pclntab funcname offset", word(2)?)?;
                table.funcdata_off = word_to_usize("pclntab functab offset", word(6)?)?;
            }
            PclnVersion::Go118 | PclnVersion::Go120 => {
                let header_text = word(2)?;
                table.text_start = if header_text != 0 {
                    header_text
                } else {
                    text_start
                };
                table.funcname_off = word_to_usize("pclntab funcname offset", word(3)?)?;
                table.funcdata_off = word_to_usize("pclntab functab offset", word(7)?)?;
            }
        }
        // The function table must fit before anything is looked up.
        let entry_size = match version {
            PclnVersion::Go118 | PclnVersion::Go120 => 8,
            _ => 2 * ptr_size,
        };
        if table.nfunc > data.len() / entry_size {
            return Err(DecodeError::Invalid {
                field: "pclntab nfunc",
                value: table.nfunc as u64,
            });
        }
        r.require(slot(table.funcdata_off, table.nfunc, entry_size)?)?;
        Ok(table)
    }

    pub fn version(&self) -> PclnVersion {
        self.version
    }

    pub fn len(&self) -> usize {
        self.nfunc
    }

    pub fn is_empty(&self) -> bool {
        self.nfunc == 0
    }

    fn reader(&self) -> Reader<'a> {
        Reader::with_endian(self.data, self.endian)
    }

    fn name_at(&self, offset: usize) -> Result<&'a [u8], DecodeError> {
        let rest = self
            .data
            .get(offset..)
            .ok_or(DecodeError::Short {
                need: offset.saturating_add(1),
                have: self.data.len(),
            })?;
        let end = rest.iter().position(|b| *b == 0).ok_or(DecodeError::Short {
            need: self.data.len() + 1,
            have: self.data.len(),
        })?;
        Ok(&rest[..end])
    }

    /// Function `i` as (entry, end, name).
    fn func(&self, i: usize) -> Result<(FuncEntry, &'a [u8]), DecodeError> {
        let r = self.reader();
        let ps = self.ptr_size;
        let ft = self.funcdata_off;
        match self.version {
            PclnVersion::Go12 | PclnVersion::Go116 => {
                let entry = r.uint(slot(ft, 2 * i, ps)?, ps)?;
                let funcoff = word_to_usize("pclntab func offset", r.uint(slot(ft, 2 * i + 1, ps)?, ps)?)?;
                let end = r.uint(slot(ft, 2 * i + 2, ps)?, ps)?;
                let (func, base) = if self.version == PclnVersion::Go12 {
                    (funcoff, 0)
                } else {
                    (slot(ft, funcoff, 1)?, self.funcname_off)
                };
                let nameoff = r.i32(slot(func, ps, 1)?)?;
                let name = self.name_at(slot(base, nameoff.max(0) as usize, 1)?)?;
                Ok((FuncEntry { entry, end }, name))
            }
            PclnVersion::Go118 | PclnVersion::Go120 => {
                let entryoff = r.u32(slot(ft, i, 8)?)? as u64;
                let funcoff = r.u32(slot(ft, i, 8)? + 4)? as usize;
                let endoff = r.u32(slot(ft, i + 1, 8)?)? as u64;
                let nameoff = r.i32(slot(ft, funcoff, 1)? + 4)?;
                let name = self.name_at(slot(self.funcname_off, nameoff.max(0) as usize, 1)?)?;
                let pc = |off: u64| {
                    self.text_start.checked_add(off).ok_or(DecodeError::Invalid {
                        field: "pclntab text start",
                        value: self.text_start,
                    })
                };
                Ok((
                    FuncEntry {
                        entry: pc(entryoff)?,
                        end: pc(endoff)?,
                    },
                    name,
                ))
            }
        }
    }

    /// Every function named exactly `name`. Entries that fail to decode are
    /// skipped.
    pub fn find(&self, name: &str) -> Vec<FuncEntry> {
        let mut found: Vec<FuncEntry> = Vec::new();
        for i in 0..self.nfunc {
            if let Ok((entry, func_name)) = self.func(i) {
                if func_name == name.as_bytes() && !found.contains(&entry) {
                    found.push(entry);
                }
            }
        }
        found
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layout::Writer;

    /// Build a little endian, 8 byte pointer table for `version`.
    pub(crate) fn build(version: PclnVersion, text_start: u64, funcs: &[(&str, u64)], end: u64) -> Vec<u8> {
        let ps = 8;
        let magic = match version {
            PclnVersion::Go12 => MAGIC_GO12,
            PclnVersion::Go116 => MAGIC_GO116,
            PclnVersion::Go118 => MAGIC_GO118,
            PclnVersion::Go120 => MAGIC_GO120,
        };
        let words = match version {
            PclnVersion::Go12 => 1,
            PclnVersion::Go116 => 7,
            _ => 8,
        };
        let mut w = Writer::with_endian(0, Endian::Little);
        w.put_u32(0, magic).put_u8(6, 1).put_u8(7, ps as u8);

        let header_end = 8 + words * ps;
        // Function names
        let mut names = Vec::new();
        let mut name_offsets = Vec::new();
        for (name, _) in funcs {
            name_offsets.push(names.len());
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }
        let n = funcs.len();
        match version {
            PclnVersion::Go12 => {
                // functab, then _func records, then names, all data relative
                let ft = header_end;
                let funcs_off = ft + (2 * n + 1) * ps;
                let names_off = funcs_off + n * 16;
                w.put_u64(8, n as u64);
                for (i, (_, pc)) in funcs.iter().enumerate() {
                    let func = funcs_off + i * 16;
                    w.put_u64(ft + 2 * i * ps, *pc)
                        .put_u64(ft + (2 * i + 1) * ps, func as u64)
                        .put_u64(func, *pc)
                        .put_u32(func + ps, (names_off + name_offsets[i]) as u32);
                }
                w.put_u64(ft + 2 * n * ps, end);
                w.put_bytes(names_off, &names);
            }
            PclnVersion::Go116 => {
                let names_off = header_end;
                let ft = names_off + names.len().next_multiple_of(8);
                w.put_u64(8, n as u64)
                    .put_u64(8 + 2 * ps, names_off as u64)
                    .put_u64(8 + 6 * ps, ft as u64);
                w.put_bytes(names_off, &names);
                let funcs_rel = (2 * n + 1) * ps;
                for (i, (_, pc)) in funcs.iter().enumerate() {
                    let func_rel = funcs_rel + i * 16;
                    w.put_u64(ft + 2 * i * ps, *pc)
                        .put_u64(ft + (2 * i + 1) * ps, func_rel as u64)
                        .put_u64(ft + func_rel, *pc)
                        .put_u32(ft + func_rel + ps, name_offsets[i] as u32);
                }
                w.put_u64(ft + 2 * n * ps, end);
            }
            PclnVersion::Go118 | PclnVersion::Go120 => {
                let names_off = header_end;
                let ft = names_off + names.len().next_multiple_of(8);
                w.put_u64(8, n as u64)
                    .put_u64(8 + 2 * ps, text_start)
                    .put_u64(8 + 3 * ps, names_off as u64)
                    .put_u64(8 + 7 * ps, ft as u64);
                w.put_bytes(names_off, &names);
                let funcs_rel = (n + 1) * 8;
                let base = if text_start == 0 { 0x401000 } else { text_start };
                for (i, (_, pc)) in funcs.iter().enumerate() {
                    let func_rel = funcs_rel + i * 8;
                    w.put_u32(ft + 8 * i, (pc - base) as u32)
                        .put_u32(ft + 8 * i + 4, func_rel as u32)
                        .put_u32(ft + func_rel, (pc - base) as u32)
                        .put_u32(ft + func_rel + 4, name_offsets[i] as u32);
                }
                w.put_u32(ft + 8 * n, (end - base) as u32);
            }
        }
        w.into_inner()
    }

    const FUNCS: &[(&str, u64)] = &[
        ("runtime.schedule", 0x401000),
        ("runtime.execute", 0x401200),
        ("main.main", 0x401800),
    ];

    #[test]
    fn test_every_layout_finds_the_function() {
        for version in [
            PclnVersion::Go12,
            PclnVersion::Go116,
            PclnVersion::Go118,
            PclnVersion::Go120,
        ] {
            let data = build(version, 0x401000, FUNCS, 0x402000);
            let table = LineTable::parse(&data, 0).unwrap();
            assert_eq!(table.version(), version);
            assert_eq!(table.len(), 3);
            assert_eq!(
                table.find("runtime.execute"),
                vec![FuncEntry {
                    entry: 0x401200,
                    end: 0x401800
                }],
                "{version}"
            );
            assert_eq!(table.find("main.main")[0].end, 0x402000, "{version}");
            assert!(table.find("runtime.exec").is_empty());
        }
    }

    #[test]
    fn test_relocated_text_start_falls_back() {
        let data = build(PclnVersion::Go120, 0, FUNCS, 0x402000);
        let table = LineTable::parse(&data, 0x401000).unwrap();
        assert_eq!(table.find("runtime.execute")[0].entry, 0x401200);
    }

    #[test]
    fn test_big_endian_magic_is_recognized() {
        let mut data = vec![0xff, 0xff, 0xff, 0xfb, 0, 0, 4, 4];
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(&[0; 8]);
        let table = LineTable::parse(&data, 0).unwrap();
        assert_eq!(table.version(), PclnVersion::Go12);
        assert!(table.is_empty());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(LineTable::parse(b"\x7fELF\x02\x01\x01\x00", 0).is_err());
        assert!(LineTable::parse(&[0xfb, 0xff, 0xff, 0xff, 0, 0, 3, 8], 0).is_err());
        // Header claims more functions than the buffer holds
        let mut data = build(PclnVersion::Go118, 0x401000, FUNCS, 0x402000);
        data[8] = 200;
        assert!(LineTable::parse(&data, 0).is_err());
    }

    #[test]
    fn test_huge_header_words_are_rejected() {
        let data = build(PclnVersion::Go118, 0x401000, FUNCS, 0x402000);

        let mut nfunc = data.clone();
        nfunc[8..16].copy_from_slice(&(u64::MAX / 4).to_le_bytes());
        assert!(matches!(
            LineTable::parse(&nfunc, 0),
            Err(DecodeError::Invalid { field: "pclntab nfunc", .. })
        ));

        let mut functab = data.clone();
        functab[8 + 7 * 8..8 + 8 * 8].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(LineTable::parse(&functab, 0).is_err());

        let mut go12 = build(PclnVersion::Go12, 0, FUNCS, 0x402000);
        go12[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(LineTable::parse(&go12, 0).is_err());
    }

    #[test]
    fn test_corrupt_entries_are_skipped() {
        let mut data = build(PclnVersion::Go116, 0, FUNCS, 0x402000);
        let ft = u64::from_le_bytes(data[8 + 6 * 8..8 + 7 * 8].try_into().unwrap()) as usize;
        // Point the first function record far outside the table
        data[ft + 8..ft + 16].copy_from_slice(&u64::MAX.to_le_bytes());
        let table = LineTable::parse(&data, 0).unwrap();
        assert!(table.find("runtime.schedule").is_empty());
        assert_eq!(table.find("runtime.execute")[0].entry, 0x401200);

        // A text start that overflows every function end
        let mut text = build(PclnVersion::Go120, 0x401000, FUNCS, 0x402000);
        text[8 + 2 * 8..8 + 3 * 8].copy_from_slice(&u64::MAX.to_le_bytes());
        let table = LineTable::parse(&text, 0).unwrap();
        assert!(table.find("runtime.schedule").is_empty());
    }
}
