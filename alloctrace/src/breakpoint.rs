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

use crate::context;
use crate::ptrace;
use std::error::Error;

// The x86_64 instruction 'int3', encoded as a single byte.
pub const TRAP_OPCODE: u8 = 0xCC;

// The allocator set, the entry breakpoint, and one transient
// return-catcher at a time, with headroom.
const CAPACITY: usize = 8;

// Handler signatures for each supported pre-handler arity.  Arguments
// beyond the context are the tracee's integer argument registers.
pub type PreHandler0 = fn(&mut context::TraceContext) -> Result<(), Box<dyn Error>>;
pub type PreHandler1 = fn(&mut context::TraceContext, u64) -> Result<(), Box<dyn Error>>;
pub type PreHandler2 = fn(&mut context::TraceContext, u64, u64) -> Result<(), Box<dyn Error>>;
pub type PreHandler3 = fn(&mut context::TraceContext, u64, u64, u64) -> Result<(), Box<dyn Error>>;

// A post-handler receives the tracee's integer return register.
pub type PostHandler = fn(&mut context::TraceContext, u64) -> Result<(), Box<dyn Error>>;

// A pre-handler of any supported arity.  Dispatching through the sum
// keeps the call site total and lets the compiler check each handler's
// argument count.
#[derive(Clone, Copy)]
pub enum PreHandler {
    NoArgs(PreHandler0),
    OneArg(PreHandler1),
    TwoArgs(PreHandler2),
    ThreeArgs(PreHandler3),
}

impl PreHandler {
    // Deliver the handler with arguments from the System V integer
    // argument registers.
    pub fn call(
        &self,
        ctx: &mut context::TraceContext,
        regs: &libc::user_regs_struct,
    ) -> Result<(), Box<dyn Error>> {
        match *self {
            PreHandler::NoArgs(handler) => handler(ctx),
            PreHandler::OneArg(handler) => handler(ctx, regs.rdi),
            PreHandler::TwoArgs(handler) => handler(ctx, regs.rdi, regs.rsi),
            PreHandler::ThreeArgs(handler) => handler(ctx, regs.rdi, regs.rsi, regs.rdx),
        }
    }
}

// A handle to a breakpoint slot.  The generation makes a handle to a
// freed slot fail to resolve instead of aliasing the slot's next tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointId {
    index: usize,
    generation: u64,
}

// Tracking data for one installed breakpoint.
pub struct Breakpoint {
    // The name of the hooked function.  Used only for reporting and for
    // matching signature-scan results.
    pub name: String,

    // The instruction address at which the breakpoint is installed.
    pub address: u64,

    // The byte displaced by the trap opcode, restored on uninstall and
    // around each single-step.
    pub original_byte: u8,

    // Called on entry, with the tracee's argument registers.
    pub pre_handler: Option<PreHandler>,

    // Called with the return register once the function returns.
    pub post_handler: Option<PostHandler>,

    // True between delivery of the pre-handler and the post-handler.
    pub inside: bool,

    // For a return-catcher, the primary breakpoint whose post-handler it
    // delivers.  None for primary breakpoints.
    pub owner: Option<BreakpointId>,
}

impl Breakpoint {
    // A long-lived breakpoint at a function entry point.
    pub fn primary(
        name: &str,
        address: u64,
        pre_handler: Option<PreHandler>,
        post_handler: Option<PostHandler>,
    ) -> Breakpoint {
        Breakpoint {
            name: name.to_string(),
            address,
            original_byte: 0,
            pre_handler,
            post_handler,
            inside: false,
            owner: None,
        }
    }

    // A transient breakpoint at the return address captured from the
    // tracee's stack, delivering the owner's post-handler.
    pub fn return_catcher(address: u64, owner: BreakpointId) -> Breakpoint {
        Breakpoint {
            name: "_return".to_string(),
            address,
            original_byte: 0,
            pre_handler: None,
            post_handler: None,
            inside: false,
            owner: Some(owner),
        }
    }
}

struct Slot {
    generation: u64,
    entry: Option<Breakpoint>,
}

// A fixed-capacity arena of breakpoint slots.
pub struct BreakpointTable {
    slots: Vec<Slot>,
}

impl BreakpointTable {
    pub fn new() -> BreakpointTable {
        let mut slots = Vec::with_capacity(CAPACITY);
        for _ in 0..CAPACITY {
            slots.push(Slot {
                generation: 0,
                entry: None,
            });
        }
        BreakpointTable { slots }
    }

    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        let slot = self.slots.get(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, id: BreakpointId) -> Option<&mut Breakpoint> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    // Find the installed breakpoint at an address, if any.  Addresses
    // are unique in the table, so the first hit is the only hit.
    pub fn find_by_address(&self, address: u64) -> Option<BreakpointId> {
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(breakpoint) = &slot.entry {
                if breakpoint.address == address {
                    return Some(BreakpointId {
                        index,
                        generation: slot.generation,
                    });
                }
            }
        }
        None
    }

    // Handles to every occupied slot.
    pub fn ids(&self) -> Vec<BreakpointId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| BreakpointId {
                index,
                generation: slot.generation,
            })
            .collect()
    }

    // Verify an insert at this address would succeed, without changing
    // anything.
    fn check_free(&self, address: u64) -> Result<(), Box<dyn Error>> {
        if self.find_by_address(address).is_some() {
            Err(format!("breakpoint already installed at {:#x}", address))?
        }
        if !self.slots.iter().any(|slot| slot.entry.is_none()) {
            Err("breakpoint table is full")?
        }
        Ok(())
    }

    fn insert(&mut self, breakpoint: Breakpoint) -> Result<BreakpointId, Box<dyn Error>> {
        self.check_free(breakpoint.address)?;

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.entry.is_none() {
                slot.entry = Some(breakpoint);
                return Ok(BreakpointId {
                    index,
                    generation: slot.generation,
                });
            }
        }

        Err("breakpoint table is full")?
    }

    // Vacate a slot, bumping its generation so outstanding handles to it
    // go stale.
    fn take(&mut self, id: BreakpointId) -> Option<Breakpoint> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take();
        if entry.is_some() {
            slot.generation += 1;
        }
        entry
    }
}

// Replace exactly one byte of a word, leaving the other seven unchanged.
fn word_with_byte(word: u64, address: u64, value: u8) -> u64 {
    let shift = (address & 7) * 8;
    (word & !(0xFF << shift)) | ((value as u64) << shift)
}

// Write a single byte into the traced process.  The peektext / poketext
// primitives are 8-byte aligned, but x86_64 instructions are not, so the
// containing word is read, patched, and written back.
pub fn write_byte(pid: u32, address: u64, value: u8) -> Result<(), Box<dyn Error>> {
    let word = ptrace::peektext(pid, address & !7);
    ptrace::poketext(pid, address & !7, word_with_byte(word, address, value))
}

// Install a breakpoint: save the byte at its address and replace it with
// the trap opcode.  An address of zero means the symbol never resolved;
// such breakpoints are skipped silently.
pub fn install(
    table: &mut BreakpointTable,
    pid: u32,
    mut breakpoint: Breakpoint,
) -> Result<Option<BreakpointId>, Box<dyn Error>> {
    if breakpoint.address == 0 {
        return Ok(None);
    }
    table.check_free(breakpoint.address)?;

    breakpoint.original_byte = ptrace::peekbyte(pid, breakpoint.address);
    write_byte(pid, breakpoint.address, TRAP_OPCODE)?;

    Ok(Some(table.insert(breakpoint)?))
}

// Remove a breakpoint, restoring the displaced byte and freeing the
// slot.
pub fn uninstall(
    table: &mut BreakpointTable,
    pid: u32,
    id: BreakpointId,
) -> Result<(), Box<dyn Error>> {
    if let Some(breakpoint) = table.take(id) {
        write_byte(pid, breakpoint.address, breakpoint.original_byte)?;
    }

    Ok(())
}

// Remove every breakpoint from the process, leaving it runnable when no
// longer traced.
pub fn remove_all(table: &mut BreakpointTable, pid: u32) -> Result<(), Box<dyn Error>> {
    for id in table.ids() {
        uninstall(table, pid, id)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str, address: u64) -> Breakpoint {
        Breakpoint::primary(name, address, None, None)
    }

    #[test]
    fn patches_one_byte_at_every_alignment() {
        let word = 0x1122334455667788u64;
        for offset in 0..8u64 {
            let address = 0x1000 + offset;
            let patched = word_with_byte(word, address, TRAP_OPCODE);
            for check in 0..8u64 {
                let shift = check * 8;
                let byte = ((patched >> shift) & 0xFF) as u8;
                if check == offset {
                    assert_eq!(byte, TRAP_OPCODE);
                } else {
                    assert_eq!(byte, ((word >> shift) & 0xFF) as u8);
                }
            }
        }
    }

    #[test]
    fn restoring_the_saved_byte_is_an_identity() {
        let word = 0xC3C3C3C3C3C3C3C3u64;
        for offset in 0..8u64 {
            let address = 0x2000 + offset;
            let original = ((word >> ((address & 7) * 8)) & 0xFF) as u8;
            let armed = word_with_byte(word, address, TRAP_OPCODE);
            assert_eq!(word_with_byte(armed, address, original), word);
        }
    }

    #[test]
    fn finds_breakpoints_by_address() {
        let mut table = BreakpointTable::new();
        let id = table.insert(named("malloc", 0x1000)).unwrap();
        table.insert(named("free", 0x2000)).unwrap();

        assert_eq!(table.find_by_address(0x1000), Some(id));
        assert!(table.find_by_address(0x3000).is_none());
        assert_eq!(table.get(id).unwrap().name, "malloc");
    }

    #[test]
    fn rejects_duplicate_addresses() {
        let mut table = BreakpointTable::new();
        table.insert(named("malloc", 0x1000)).unwrap();
        assert!(table.insert(named("calloc", 0x1000)).is_err());
    }

    #[test]
    fn rejects_inserts_beyond_capacity() {
        let mut table = BreakpointTable::new();
        for index in 0..CAPACITY {
            table
                .insert(named("bp", 0x1000 + index as u64))
                .unwrap();
        }
        assert!(table.insert(named("overflow", 0x9000)).is_err());
    }

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut table = BreakpointTable::new();
        let id = table.insert(named("malloc", 0x1000)).unwrap();
        assert!(table.take(id).is_some());

        // The slot is free again; a new tenant must not be visible
        // through the old handle.
        let new_id = table.insert(named("free", 0x2000)).unwrap();
        assert!(table.get(id).is_none());
        assert!(table.take(id).is_none());
        assert_eq!(table.get(new_id).unwrap().name, "free");
    }

    #[test]
    fn catcher_owner_survives_until_taken() {
        let mut table = BreakpointTable::new();
        let owner = table.insert(named("malloc", 0x1000)).unwrap();
        let catcher = table
            .insert(Breakpoint::return_catcher(0x4242, owner))
            .unwrap();

        assert_eq!(table.get(catcher).unwrap().owner, Some(owner));
        table.take(owner);
        let stale = table.get(catcher).unwrap().owner.unwrap();
        assert!(table.get(stale).is_none());
    }
}
