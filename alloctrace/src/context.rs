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

use crate::breakpoint;
use crate::commandline;
use crate::process_map;
use crate::ptrace;
use crate::symbols;
use crate::symbols::SymbolKind;

// Context relevant to the traced process.  Created once the tracee is
// spawned and handed to every handler; options travel here instead of in
// process globals.
pub struct TraceContext {
    // Process-ID of the process currently under trace.  Changes exactly
    // once per followed fork.
    pub pid: u32,

    // The parsed command line, including the break conditions and the
    // target command.
    pub options: commandline::CommandLineArguments,

    // Resolved absolute path of the target executable.
    pub target_path: String,

    // The set of active breakpoints in the process.
    pub breakpoints: breakpoint::BreakpointTable,

    // A representation of the binaries mmap-ed into the process's
    // address space.  Empty until the entry breakpoint fires.
    pub process_map: process_map::ProcessMap,

    // The allocator symbols as found in the target ELF, in the same
    // order as the allocator hook table.
    pub allocator_symbols: Vec<symbols::SymbolEntry>,

    // Path and version banner of the mapped libc, once known.
    pub libc_path: Option<String>,
    pub libc_version: Option<String>,

    // Whether any allocator resolved through the dynamic tables, and
    // whether none resolved at all.
    pub target_is_dynamic: bool,
    pub target_is_stripped: bool,

    // Operation counters, one per hooked allocator entry point.
    pub malloc_count: u64,
    pub calloc_count: u64,
    pub free_count: u64,
    pub realloc_count: u64,
    pub reallocarray_count: u64,

    // Name of the hooked function whose pre-handler has run but whose
    // post-handler has not.
    pub between_pre_and_post: Option<String>,

    // The most recent decoded wait status.
    pub last_status: Option<ptrace::WaitStatus>,

    // Set by the entry breakpoint to request symbol mapping on the next
    // loop iteration, once the handler stack has unwound.
    pub should_map_syms: bool,

    // True while some primary breakpoint is between its pre- and
    // post-handler.
    pub in_breakpoint: bool,
}

impl TraceContext {
    // Construct the context for tracing a new process.
    pub fn new(
        pid: u32,
        options: commandline::CommandLineArguments,
        target_path: String,
        allocator_symbols: Vec<symbols::SymbolEntry>,
    ) -> TraceContext {
        let target_is_dynamic = allocator_symbols
            .iter()
            .any(|entry| matches!(entry.kind, SymbolKind::Dynamic | SymbolKind::DynamicPlt));
        let target_is_stripped = allocator_symbols
            .iter()
            .all(|entry| entry.kind == SymbolKind::Unresolved);

        TraceContext {
            pid,
            options,
            target_path,
            breakpoints: breakpoint::BreakpointTable::new(),
            process_map: process_map::ProcessMap::empty(),
            allocator_symbols,
            libc_path: None,
            libc_version: None,
            target_is_dynamic,
            target_is_stripped,
            malloc_count: 0,
            calloc_count: 0,
            free_count: 0,
            realloc_count: 0,
            reallocarray_count: 0,
            between_pre_and_post: None,
            last_status: None,
            should_map_syms: false,
            in_breakpoint: false,
        }
    }

    // The current operation id: a label that grows by one with each
    // hooked allocator call.
    pub fn oid(&self) -> u64 {
        self.malloc_count
            + self.calloc_count
            + self.free_count
            + self.realloc_count
            + self.reallocarray_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::SymbolEntry;

    fn context_with(symbols: Vec<SymbolEntry>) -> TraceContext {
        let options =
            commandline::CommandLineArguments::parse(&mut ["alloctrace", "/bin/true"].iter().map(
                |argument| argument.to_string(),
            ))
            .unwrap();
        TraceContext::new(1234, options, "/bin/true".to_string(), symbols)
    }

    fn entry(kind: SymbolKind) -> SymbolEntry {
        SymbolEntry {
            name: "malloc".to_string(),
            kind,
            offset: 0x100,
        }
    }

    #[test]
    fn oid_is_the_sum_of_all_counters() {
        let mut ctx = context_with(vec![]);
        assert_eq!(ctx.oid(), 0);

        ctx.malloc_count = 2;
        ctx.free_count = 1;
        ctx.reallocarray_count = 3;
        assert_eq!(ctx.oid(), 6);
    }

    #[test]
    fn classifies_dynamic_and_stripped_targets() {
        let ctx = context_with(vec![entry(SymbolKind::DynamicPlt), entry(SymbolKind::Unresolved)]);
        assert!(ctx.target_is_dynamic);
        assert!(!ctx.target_is_stripped);

        let ctx = context_with(vec![entry(SymbolKind::Unresolved), entry(SymbolKind::Unresolved)]);
        assert!(!ctx.target_is_dynamic);
        assert!(ctx.target_is_stripped);

        let ctx = context_with(vec![entry(SymbolKind::Static)]);
        assert!(!ctx.target_is_dynamic);
        assert!(!ctx.target_is_stripped);
    }
}
