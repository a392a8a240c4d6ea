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

use crate::breakpoint::{PostHandler, PreHandler};
use crate::context::TraceContext;
use crate::pause;
use crate::pause::PauseTrigger;
use std::error::Error;
use std::io::Write;

// The allocator entry points the tracer hooks, in hook-table order.
pub const ALLOCATOR_NAMES: [&str; 5] = ["malloc", "calloc", "free", "realloc", "reallocarray"];

// The binding between one allocator entry point and its handlers.
pub struct AllocatorHook {
    pub name: &'static str,
    pub pre_handler: PreHandler,
    pub post_handler: PostHandler,
}

// The hook table, in the same order as ALLOCATOR_NAMES.
pub fn allocator_hooks() -> [AllocatorHook; 5] {
    [
        AllocatorHook {
            name: "malloc",
            pre_handler: PreHandler::OneArg(pre_malloc),
            post_handler: post_allocation,
        },
        AllocatorHook {
            name: "calloc",
            pre_handler: PreHandler::TwoArgs(pre_calloc),
            post_handler: post_allocation,
        },
        AllocatorHook {
            name: "free",
            pre_handler: PreHandler::OneArg(pre_free),
            post_handler: post_free,
        },
        AllocatorHook {
            name: "realloc",
            pre_handler: PreHandler::TwoArgs(pre_realloc),
            post_handler: post_allocation,
        },
        AllocatorHook {
            name: "reallocarray",
            pre_handler: PreHandler::ThreeArgs(pre_reallocarray),
            post_handler: post_allocation,
        },
    ]
}

// The pre-handler's half of the report line stays unterminated until
// the return catcher fires, so it has to reach the terminal now.
fn flush_report() -> Result<(), Box<dyn Error>> {
    std::io::stdout().flush()?;
    Ok(())
}

fn pre_malloc(ctx: &mut TraceContext, size: u64) -> Result<(), Box<dyn Error>> {
    ctx.malloc_count += 1;
    let oid = ctx.oid();
    print!("malloc({:#x})", size);
    flush_report()?;
    pause::check_should_break(ctx, PauseTrigger::BeforeOperation(oid))
}

fn pre_calloc(ctx: &mut TraceContext, count: u64, size: u64) -> Result<(), Box<dyn Error>> {
    ctx.calloc_count += 1;
    let oid = ctx.oid();
    print!("calloc({:#x}, {:#x})", count, size);
    flush_report()?;
    pause::check_should_break(ctx, PauseTrigger::BeforeOperation(oid))
}

fn pre_free(ctx: &mut TraceContext, address: u64) -> Result<(), Box<dyn Error>> {
    ctx.free_count += 1;
    let oid = ctx.oid();
    print!("free({:#x})", address);
    flush_report()?;
    pause::check_should_break(ctx, PauseTrigger::BeforeOperation(oid))
}

fn pre_realloc(ctx: &mut TraceContext, address: u64, size: u64) -> Result<(), Box<dyn Error>> {
    ctx.realloc_count += 1;
    let oid = ctx.oid();
    print!("realloc({:#x}, {:#x})", address, size);
    flush_report()?;
    pause::check_should_break(ctx, PauseTrigger::BeforeOperation(oid))
}

fn pre_reallocarray(
    ctx: &mut TraceContext,
    address: u64,
    count: u64,
    size: u64,
) -> Result<(), Box<dyn Error>> {
    ctx.reallocarray_count += 1;
    let oid = ctx.oid();
    print!("reallocarray({:#x}, {:#x}, {:#x})", address, count, size);
    flush_report()?;
    pause::check_should_break(ctx, PauseTrigger::BeforeOperation(oid))
}

// Completion for the allocating entry points: report the new chunk
// address from the return register.
fn post_allocation(ctx: &mut TraceContext, address: u64) -> Result<(), Box<dyn Error>> {
    let oid = ctx.oid();
    println!(" = {:#x}  [oid {}]", address, oid);
    pause::check_should_break(ctx, PauseTrigger::AfterOperation(oid))
}

// free returns nothing; the completion just closes the report line.
fn post_free(ctx: &mut TraceContext, _retval: u64) -> Result<(), Box<dyn Error>> {
    let oid = ctx.oid();
    println!("  [oid {}]", oid);
    pause::check_should_break(ctx, PauseTrigger::AfterOperation(oid))
}

// Report the operation totals at the end of the trace.
pub fn show_stats(ctx: &TraceContext) {
    println!("Statistics:");
    println!("... total mallocs: {}", ctx.malloc_count);
    println!("... total callocs: {}", ctx.calloc_count);
    println!("... total frees: {}", ctx.free_count);
    println!("... total reallocs: {}", ctx.realloc_count);
    println!("... total reallocarrays: {}", ctx.reallocarray_count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_table_matches_the_name_table() {
        let hooks = allocator_hooks();
        let names: Vec<&str> = hooks.iter().map(|hook| hook.name).collect();
        assert_eq!(names, ALLOCATOR_NAMES.to_vec());
    }

    #[test]
    fn hook_arities_follow_the_allocator_prototypes() {
        let arity = |hook: &AllocatorHook| match hook.pre_handler {
            PreHandler::NoArgs(_) => 0,
            PreHandler::OneArg(_) => 1,
            PreHandler::TwoArgs(_) => 2,
            PreHandler::ThreeArgs(_) => 3,
        };

        let arities: Vec<usize> = allocator_hooks().iter().map(arity).collect();
        assert_eq!(arities, vec![1, 2, 1, 2, 3]);
    }
}
