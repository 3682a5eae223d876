//! Locating a function inside a binary so a uprobe can be placed on it.
//!
//! Resolution runs as a pipeline and reports which step produced the
//! address: the ELF symbol table, the dynamic symbol table, and finally the
//! Go runtime's own function table for stripped Go binaries.

pub mod gopclntab;

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol, SectionKind};
use tracing::debug;

use gopclntab::{looks_like_header, LineTable, PclnVersion};

/// Go scheduler entry point traced by the secondary probe.
pub const GO_SCHED_SYMBOL: &str = "runtime.execute";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SymbolTable,
    DynamicSymbolTable,
    Pclntab(PclnVersion),
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::SymbolTable => f.write_str("symtab"),
            Strategy::DynamicSymbolTable => f.write_str("dynsym"),
            Strategy::Pclntab(v) => write!(f, "pclntab({v})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    /// Virtual address of the function entry.
    pub addr: u64,
    /// End of the function, or `addr` when the size is unknown.
    pub end: u64,
    /// Offset of the entry inside the file, which is what uprobes take.
    pub file_offset: u64,
    pub strategy: Strategy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(ResolvedSymbol),
    NotFound,
    /// Several distinct addresses carry the name.
    Ambiguous(Vec<u64>),
}

/// Read `path` and resolve `name` inside it.
pub fn resolve_path(path: &Path, name: &str) -> Result<Resolution> {
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    resolve(&data, name).with_context(|| format!("Failed to resolve {} in {}", name, path.display()))
}

pub fn resolve(data: &[u8], name: &str) -> Result<Resolution> {
    let elf = object::File::parse(data).context("Failed to parse ELF")?;

    let hits = symbol_hits(elf.symbols(), name);
    if !hits.is_empty() {
        return finish(&elf, hits, Strategy::SymbolTable);
    }
    let hits = symbol_hits(elf.dynamic_symbols(), name);
    if !hits.is_empty() {
        return finish(&elf, hits, Strategy::DynamicSymbolTable);
    }

    let Some(table_data) = find_pclntab(&elf) else {
        return Ok(Resolution::NotFound);
    };
    let text_start = elf
        .section_by_name(".text")
        .map(|s| s.address())
        .unwrap_or(0);
    let table = LineTable::parse(table_data, text_start).context("Invalid pclntab")?;
    debug!(version = %table.version(), funcs = table.len(), "Using Go function table");
    let hits: Vec<(u64, u64)> = table
        .find(name)
        .into_iter()
        .map(|f| (f.entry, f.end))
        .collect();
    finish(&elf, hits, Strategy::Pclntab(table.version()))
}

fn symbol_hits<'data, S, I>(symbols: I, name: &str) -> Vec<(u64, u64)>
where
    S: ObjectSymbol<'data>,
    I: Iterator<Item = S>,
{
    let mut hits: Vec<(u64, u64)> = Vec::new();
    for sym in symbols {
        if sym.name() != Ok(name) || sym.address() == 0 || !sym.is_definition() {
            continue;
        }
        let hit = (sym.address(), sym.address() + sym.size());
        if !hits.iter().any(|(addr, _)| *addr == hit.0) {
            hits.push(hit);
        }
    }
    hits
}

fn finish(elf: &object::File, hits: Vec<(u64, u64)>, strategy: Strategy) -> Result<Resolution> {
    match hits.as_slice() {
        [] => Ok(Resolution::NotFound),
        [(addr, end)] => {
            let Some(file_offset) = file_offset(elf, *addr) else {
                bail!("Address {:#x} is not inside a loadable segment", addr);
            };
            Ok(Resolution::Resolved(ResolvedSymbol {
                addr: *addr,
                end: *end,
                file_offset,
                strategy,
            }))
        }
        _ => Ok(Resolution::Ambiguous(
            hits.iter().map(|(addr, _)| *addr).collect(),
        )),
    }
}

/// Translate a virtual address into a file offset through the loadable
/// segment containing it. Position independent binaries link at a zero base
/// so the same arithmetic holds for them.
pub fn file_offset(elf: &object::File, addr: u64) -> Option<u64> {
    for segment in elf.segments() {
        let (offset, size) = segment.file_range();
        let start = segment.address();
        if addr >= start && addr < start + size {
            return Some(offset + (addr - start));
        }
    }
    None
}

fn find_pclntab<'data>(elf: &object::File<'data>) -> Option<&'data [u8]> {
    if let Some(data) = elf
        .section_by_name(".gopclntab")
        .and_then(|s| s.data().ok())
    {
        return Some(data);
    }

    // Some linkers fold the table into .rodata but keep the symbol
    if let Some(sym) = elf.symbols().find(|s| s.name() == Ok("runtime.pclntab")) {
        let found = sym
            .section_index()
            .and_then(|idx| elf.section_by_index(idx).ok())
            .and_then(|section| {
                let data = section.data().ok()?;
                let start = sym.address().checked_sub(section.address())? as usize;
                data.get(start..)
            });
        if found.is_some() {
            return found;
        }
    }

    for section in elf.sections() {
        if !matches!(
            section.kind(),
            SectionKind::ReadOnlyData | SectionKind::ReadOnlyString | SectionKind::Data
        ) {
            continue;
        }
        let Ok(data) = section.data() else {
            continue;
        };
        let mut offset = 0;
        while offset + 8 <= data.len() {
            let candidate = &data[offset..];
            if looks_like_header(candidate) {
                if let Ok(table) = LineTable::parse(candidate, 0) {
                    if !table.is_empty() {
                        return Some(candidate);
                    }
                }
            }
            offset += 4;
        }
    }
    None
}
