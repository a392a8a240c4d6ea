/*
    alloctrace  -  a heap allocation tracer
    Copyright (C) 2023  Matt Kimball

    This program is free software: you can redistribute it and/or modify it
    under the terms of the GNU General Public License as published by the
    Free Software Foundation, either version 3 of the License, or (at your
    option) any later version.

    This program is distributed in the hope that it will be useful, but
    WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License
    for more details.

    You should have received a copy of the GNU General Public License along
    with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use crate::process_map::{ProcessMap, RegionKind};
use crate::ptrace;
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol};
use std::collections::HashMap;
use std::error::Error;

// How a symbol's runtime address is derived from its file offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    // Defined in the target itself: binary base plus offset.
    Static,

    // Imported through a data GOT slot: the slot holds the libc address.
    Dynamic,

    // Imported through the PLT: the slot holds either the libc address
    // or, before the linker binds it, a pointer back into the stub.
    DynamicPlt,

    // Not found in the target's symbol tables at all.
    Unresolved,
}

// One name the tracer wants to breakpoint, as found in the target ELF.
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    // The name of the function.
    pub name: String,

    // How to turn the offset into a runtime address.
    pub kind: SymbolKind,

    // For Static, the function's offset from the image base.  For the
    // dynamic kinds, the offset of the GOT slot to read.
    pub offset: u64,
}

// A user-supplied `name=module±hex` address override.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolOverride {
    pub name: String,
    pub module: OverrideModule,
    pub offset: i64,
}

// Which mapped image an override is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideModule {
    Binary,
    Libc,
}

// With lazy binding, a fresh GOT slot points six bytes past the head of
// its PLT stub, at the push of the relocation index.  The distance is an
// artifact of the standard x86-64 stub layout; it is not derived.
pub const PLT_STUB_ADJUST: u64 = 6;

const SIZEOF_RELA: usize = 24;

// The lowest load segment address.  Symbol values and relocation offsets
// are stored relative to this, so that position-independent and
// fixed-base executables resolve the same way at runtime.
fn load_bias(elf: &object::File) -> u64 {
    elf.segments()
        .map(|segment| segment.address())
        .min()
        .unwrap_or(0)
}

// Collect `symbol index -> name` for the dynamic symbol table, which the
// relocation entries refer to by index.
fn dynamic_symbol_names(elf: &object::File) -> HashMap<usize, String> {
    let mut names = HashMap::new();
    for symbol in elf.dynamic_symbols() {
        if let Ok(name) = symbol.name() {
            names.insert(symbol.index().0, name.to_string());
        }
    }
    names
}

// Parse one RELA-format relocation section, keeping the GOT slot offset
// of every entry of the wanted relocation type.  x86-64 ELF relocation
// sections are arrays of { r_offset, r_info, r_addend } little-endian
// 64-bit words, with the type in the low half of r_info and the symbol
// index in the high half.
fn relocation_slots(
    elf: &object::File,
    section_name: &str,
    wanted_type: u32,
    names: &HashMap<usize, String>,
    bias: u64,
) -> HashMap<String, u64> {
    let mut slots = HashMap::new();

    let section = match elf.section_by_name(section_name) {
        Some(section) => section,
        None => return slots,
    };
    let data = match section.data() {
        Ok(data) => data,
        Err(_) => return slots,
    };

    for entry in data.chunks_exact(SIZEOF_RELA) {
        let r_offset = u64::from_le_bytes(entry[..8].try_into().unwrap());
        let r_info = u64::from_le_bytes(entry[8..16].try_into().unwrap());
        let r_type = (r_info & 0xFFFF_FFFF) as u32;
        let r_sym = (r_info >> 32) as usize;

        if r_type != wanted_type {
            continue;
        }
        if let Some(name) = names.get(&r_sym) {
            slots.entry(name.clone()).or_insert(r_offset - bias);
        }
    }

    slots
}

// Look up each requested name in the target ELF: the static symbol table
// first, then GOT data relocations, then PLT jump slots.  Names found
// nowhere come back Unresolved with offset zero.
pub fn lookup_symbols(
    target_path: &str,
    names: &[&str],
) -> Result<Vec<SymbolEntry>, Box<dyn Error>> {
    let elf_data = std::fs::read(target_path)?;
    let elf = object::File::parse(&*elf_data)?;
    let bias = load_bias(&elf);

    let dynamic_names = dynamic_symbol_names(&elf);
    let got_slots = relocation_slots(
        &elf,
        ".rela.dyn",
        object::elf::R_X86_64_GLOB_DAT,
        &dynamic_names,
        bias,
    );
    let plt_slots = relocation_slots(
        &elf,
        ".rela.plt",
        object::elf::R_X86_64_JUMP_SLOT,
        &dynamic_names,
        bias,
    );

    let mut entries = Vec::new();
    for &name in names {
        let static_symbol = elf
            .symbols()
            .find(|symbol| matches!(symbol.name(), Ok(n) if n == name) && symbol.address() != 0);

        let entry = if let Some(symbol) = static_symbol {
            SymbolEntry {
                name: name.to_string(),
                kind: SymbolKind::Static,
                offset: symbol.address() - bias,
            }
        } else if let Some(&offset) = got_slots.get(name) {
            SymbolEntry {
                name: name.to_string(),
                kind: SymbolKind::Dynamic,
                offset,
            }
        } else if let Some(&offset) = plt_slots.get(name) {
            SymbolEntry {
                name: name.to_string(),
                kind: SymbolKind::DynamicPlt,
                offset,
            }
        } else {
            SymbolEntry {
                name: name.to_string(),
                kind: SymbolKind::Unresolved,
                offset: 0,
            }
        };
        entries.push(entry);
    }

    Ok(entries)
}

// Turn a symbol entry into an absolute address in the stopped tracee.
// Returns 0 for anything that cannot be resolved at this time; such
// breakpoints are skipped at install.
pub fn resolve_address(
    pid: u32,
    entry: &SymbolEntry,
    map: &ProcessMap,
) -> Result<u64, Box<dyn Error>> {
    let binary = map
        .find_by_kind(RegionKind::Binary)
        .ok_or("target binary is missing from the process mappings. Please report this!")?;

    match entry.kind {
        SymbolKind::Static => Ok(binary.begin + entry.offset),
        SymbolKind::Dynamic | SymbolKind::DynamicPlt => {
            if map.find_by_kind(RegionKind::Libc).is_none() {
                return Ok(0);
            }

            let got_ptr = binary.begin + entry.offset;
            let mut got_val = ptrace::peektext(pid, got_ptr);
            if entry.kind == SymbolKind::DynamicPlt
                && got_val >= binary.begin
                && got_val < binary.end
            {
                // Not bound yet; aim at the stub head instead.
                got_val -= PLT_STUB_ADJUST;
            }

            Ok(got_val)
        }
        SymbolKind::Unresolved => Ok(0),
    }
}

// Parse a `name=module±hex[,name=module±hex...]` override specification.
pub fn parse_overrides(spec: &str) -> Result<Vec<SymbolOverride>, Box<dyn Error>> {
    let mut overrides = Vec::new();

    for token in spec.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        let equals = token
            .find('=')
            .ok_or_else(|| format!("symbol override '{}' is missing '='", token))?;
        let name = &token[..equals];
        let rest = &token[equals + 1..];

        let sign_index = rest
            .find(|c| c == '+' || c == '-')
            .ok_or_else(|| format!("symbol override '{}' is missing a ±offset", token))?;
        let module = match &rest[..sign_index] {
            "bin" => OverrideModule::Binary,
            "libc" => OverrideModule::Libc,
            other => Err(format!(
                "symbol override '{}' names unknown module '{}' (expected bin or libc)",
                token, other
            ))?,
        };

        let negative = rest.as_bytes()[sign_index] == b'-';
        let digits = rest[sign_index + 1..].trim_start_matches("0x");
        let magnitude = i64::from_str_radix(digits, 16)
            .map_err(|_| format!("symbol override '{}' has a malformed offset", token))?;

        overrides.push(SymbolOverride {
            name: name.to_string(),
            module,
            offset: if negative { -magnitude } else { magnitude },
        });
    }

    Ok(overrides)
}

// Compute the absolute address an override names, if its module is
// mapped.
pub fn override_address(symbol_override: &SymbolOverride, map: &ProcessMap) -> Option<u64> {
    let kind = match symbol_override.module {
        OverrideModule::Binary => RegionKind::Binary,
        OverrideModule::Libc => RegionKind::Libc,
    };
    let region = map.find_by_kind(kind)?;

    Some((region.begin as i64 + symbol_override.offset) as u64)
}

// Fish the version string out of a glibc image: the banner embeds
// " version <x.y>.\n".
pub fn libc_version(libc_path: &str) -> Option<String> {
    let data = std::fs::read(libc_path).ok()?;
    extract_version(&data)
}

fn extract_version(data: &[u8]) -> Option<String> {
    let needle = b" version ";
    let start = data
        .windows(needle.len())
        .position(|window| window == needle)?
        + needle.len();

    let rest = &data[start..];
    let end = rest.windows(2).position(|window| window == b".\n")?;

    String::from_utf8(rest[..end].to_vec()).ok()
}
