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
use crate::context::TraceContext;
use crate::ptrace;
use std::error::Error;
use std::io::Write;

// The moments at which the user can ask the tracer to pause the tracee
// and hand it to an interactive debugger.
pub enum PauseTrigger {
    // An allocator pre-handler is about to let the operation run.
    BeforeOperation(u64),

    // An allocator post-handler has captured the return value.
    AfterOperation(u64),

    // The tracee reached its entry point.
    Entry,

    // The tracee received SIGSEGV.
    Segfault,
}

// Compare a trigger against the configured break conditions and hand
// the tracee off if one matches.  On a match this only returns on a
// failure to exec the debugger.
pub fn check_should_break(
    ctx: &mut TraceContext,
    trigger: PauseTrigger,
) -> Result<(), Box<dyn Error>> {
    let should_break = match trigger {
        PauseTrigger::BeforeOperation(oid) => ctx.options.break_at == Some(oid),
        PauseTrigger::AfterOperation(oid) => ctx.options.break_after == Some(oid),
        PauseTrigger::Entry => ctx.options.break_at_main,
        PauseTrigger::Segfault => ctx.options.break_at_sigsegv,
    };

    if should_break {
        hand_off_to_debugger(ctx)
    } else {
        Ok(())
    }
}

// Uninstall every breakpoint, detach the tracee stopped, and replace
// this process with the debugger attached to it.  The debugger owns the
// tracee from here on.
fn hand_off_to_debugger(ctx: &mut TraceContext) -> Result<(), Box<dyn Error>> {
    println!();
    println!("    [   PROCESS PAUSED   ]");
    println!(
        "    |   * attaching debugger via: {} -p {}",
        ctx.options.gdb_path, ctx.pid
    );

    breakpoint::remove_all(&mut ctx.breakpoints, ctx.pid)?;
    ptrace::detach(ctx.pid, libc::SIGSTOP as u8)?;

    // The exec below discards this process, buffers included.
    std::io::stdout().flush()?;
    std::io::stderr().flush()?;

    let program = std::ffi::CString::new(ctx.options.gdb_path.clone())?;
    let pid_flag = std::ffi::CString::new("-p")?;
    let pid_argument = std::ffi::CString::new(ctx.pid.to_string())?;
    let argv = [
        program.as_ptr(),
        pid_flag.as_ptr(),
        pid_argument.as_ptr(),
        std::ptr::null(),
    ];

    unsafe {
        libc::execv(program.as_ptr(), argv.as_ptr());
    }

    Err(format!(
        "failed to execute debugger {}: {}",
        ctx.options.gdb_path,
        ptrace::errno_string()
    )
    .into())
}
