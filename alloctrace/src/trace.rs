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
use crate::breakpoint::{Breakpoint, PreHandler};
use crate::commandline;
use crate::context::TraceContext;
use crate::funcid;
use crate::hooks;
use crate::pause;
use crate::pause::PauseTrigger;
use crate::process_map;
use crate::process_map::RegionKind;
use crate::ptrace;
use crate::ptrace::{PtraceEvent, WaitStatus};
use crate::symbols;
use std::error::Error;

// Why the trace is ending.
enum ShutdownReason {
    // The tracee exited.  Included is the exit value.
    Exited(i32),

    // The tracee was killed by a signal.
    Killed(i32),

    // The tracee stopped on a fatal signal it will not survive.
    Crashed(i32),

    // The tracee replaced its image with exec.
    Exec,
}

// Stops on these signals will not be survived by the tracee; they end
// the trace like a crash.
fn is_fatal_stop(signal: i32) -> bool {
    signal == libc::SIGSEGV
        || signal == libc::SIGABRT
        || signal == libc::SIGBUS
        || signal == libc::SIGILL
        || signal == libc::SIGFPE
}

fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGHUP => "SIGHUP".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGQUIT => "SIGQUIT".to_string(),
        libc::SIGILL => "SIGILL".to_string(),
        libc::SIGTRAP => "SIGTRAP".to_string(),
        libc::SIGABRT => "SIGABRT".to_string(),
        libc::SIGBUS => "SIGBUS".to_string(),
        libc::SIGFPE => "SIGFPE".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGSEGV => "SIGSEGV".to_string(),
        libc::SIGPIPE => "SIGPIPE".to_string(),
        libc::SIGTERM => "SIGTERM".to_string(),
        _ => format!("signal {}", signal),
    }
}

fn trace_options_mask(follow_fork: bool) -> i32 {
    let mut mask = libc::PTRACE_O_TRACEEXEC;
    if follow_fork {
        mask |= libc::PTRACE_O_TRACEFORK | libc::PTRACE_O_TRACEVFORK | libc::PTRACE_O_TRACECLONE;
    }
    mask
}

// Pre-handler for the entry breakpoint.  The memory map is final here,
// so this is where symbol mapping gets requested; the work itself is
// deferred to the event loop, outside the dispatch machinery.
fn pre_entry(ctx: &mut TraceContext) -> Result<(), Box<dyn Error>> {
    ctx.should_map_syms = true;
    pause::check_should_break(ctx, PauseTrigger::Entry)
}

// Wait for a particular signal to be delivered to the traced process,
// passing along any other signals that arrive first.
fn wait_for_signal(pid: u32, wait_signal: i32) -> Result<(), Box<dyn Error>> {
    loop {
        let (_, status) = ptrace::waitpid(pid as i32)?;
        match status {
            WaitStatus::Stopped(signal) => {
                if signal == wait_signal {
                    break;
                } else {
                    ptrace::cont(pid, signal as u8)?;
                }
            }
            _ => Err("tracee terminated while the tracer was waiting for a signal")?,
        }
    }

    Ok(())
}

// A SIGTRAP arrived.  If one of our breakpoints caused it, run the full
// hit protocol; returns false when the trap was not ours so the caller
// can forward it.
//
// The protocol: restore the displaced byte, rewind the instruction
// pointer, deliver the pre-handler, single-step across the original
// instruction, then re-arm.  A primary with a post-handler additionally
// plants a return-catcher at the return address found at the stack
// pointer; the catcher delivers the post-handler with the return
// register and uninstalls itself.
fn on_breakpoint(ctx: &mut TraceContext) -> Result<bool, Box<dyn Error>> {
    let pid = ctx.pid;
    let mut regs = ptrace::getregs(pid)?;

    // The trap stops the tracee one byte past the int3.
    let hit_address = regs.rip - 1;
    let id = match ctx.breakpoints.find_by_address(hit_address) {
        Some(id) => id,
        None => return Ok(false),
    };

    let (original_byte, owner, inside, pre_handler, post_handler, name) = {
        let bp = ctx.breakpoints.get(id).ok_or("breakpoint vanished")?;
        (
            bp.original_byte,
            bp.owner,
            bp.inside,
            bp.pre_handler,
            bp.post_handler,
            bp.name.clone(),
        )
    };

    // Put the displaced byte back and rewind, so the original
    // instruction executes exactly once.
    breakpoint::write_byte(pid, hit_address, original_byte)?;
    regs.rip = hit_address;
    ptrace::setregs(pid, &regs)?;

    match owner {
        // A primary breakpoint at a function entry point.
        None => {
            // Allocators call each other; handlers only run for the
            // outermost tracked call.
            let deliver = !ctx.in_breakpoint && !inside;

            if deliver {
                if let Some(pre_handler) = pre_handler {
                    ctx.between_pre_and_post = Some(name.clone());
                    if let Err(err) = pre_handler.call(ctx, &regs) {
                        eprintln!("error in {} pre-handler: {}", name, err);
                    }
                }
            }

            ptrace::singlestep(pid)?;
            wait_for_signal(pid, libc::SIGTRAP)?;

            if deliver {
                if post_handler.is_some() {
                    // The tracee is at the function's first instruction,
                    // so the word at the stack pointer is the return
                    // address.
                    let return_address = ptrace::peektext(pid, regs.rsp);
                    // The return address can land in any region; the map
                    // only annotates, it never gates the install.
                    if ctx.process_map.entry_for_address(return_address).is_none() {
                        eprintln!(
                            "warning: return address {:#x} is not in any mapped region",
                            return_address
                        );
                    }
                    breakpoint::install(
                        &mut ctx.breakpoints,
                        pid,
                        Breakpoint::return_catcher(return_address, id),
                    )?;
                    if let Some(bp) = ctx.breakpoints.get_mut(id) {
                        bp.inside = true;
                    }
                    ctx.in_breakpoint = true;
                } else {
                    ctx.between_pre_and_post = None;
                }
            }

            // Re-arm for the next call.
            breakpoint::write_byte(pid, hit_address, breakpoint::TRAP_OPCODE)?;
        }

        // A return-catcher: deliver the owner's post-handler with the
        // return register, then retire.
        Some(owner_id) => {
            ptrace::singlestep(pid)?;
            wait_for_signal(pid, libc::SIGTRAP)?;

            let owner_post = ctx
                .breakpoints
                .get(owner_id)
                .and_then(|owner_bp| owner_bp.post_handler);
            if let Some(post_handler) = owner_post {
                if let Err(err) = post_handler(ctx, regs.rax) {
                    eprintln!("error in post-handler: {}", err);
                }
            }
            if let Some(owner_bp) = ctx.breakpoints.get_mut(owner_id) {
                owner_bp.inside = false;
            }

            breakpoint::uninstall(&mut ctx.breakpoints, pid, id)?;
            ctx.in_breakpoint = false;
            ctx.between_pre_and_post = None;
        }
    }

    Ok(true)
}

// A fork, vfork or clone was reported.  Consume the new process's
// initial stop, then either switch the trace over to it or detach it
// stopped, depending on the follow-fork option.
fn on_fork(ctx: &mut TraceContext) -> Result<(), Box<dyn Error>> {
    let new_pid = ptrace::geteventmsg(ctx.pid)?;
    wait_for_signal(new_pid, libc::SIGSTOP)?;

    if ctx.options.follow_fork {
        eprintln!("following fork from {} into {}", ctx.pid, new_pid);
        ptrace::detach(ctx.pid, libc::SIGCONT as u8)?;
        ctx.pid = new_pid;
        ptrace::setoptions(new_pid, trace_options_mask(true))?;
    } else {
        eprintln!(
            "detected fork; child pid {} detached (use --follow-fork to trace it)",
            new_pid
        );
        ptrace::detach(new_pid, libc::SIGSTOP as u8)?;
    }

    Ok(())
}

fn describe_target(ctx: &TraceContext) {
    let linkage = if ctx.target_is_dynamic {
        "dynamically-linked"
    } else {
        "statically-linked"
    };
    let stripped = if ctx.target_is_stripped {
        ", stripped"
    } else {
        ""
    };

    match (&ctx.libc_version, &ctx.libc_path) {
        (Some(version), Some(path)) => eprintln!(
            "{}{} target using glibc version {} ({})",
            linkage, stripped, version, path
        ),
        _ => eprintln!("{}{} target", linkage, stripped),
    }
}

// The entry breakpoint fired: the memory map is final, so rebuild the
// oracle, resolve every allocator to an absolute address, patch in
// signature-scan results and user overrides, and install the allocator
// breakpoints.
fn map_symbols(ctx: &mut TraceContext) -> Result<(), Box<dyn Error>> {
    ctx.process_map = process_map::ProcessMap::new(ctx.pid, &ctx.target_path)?;

    let binary_base = {
        let binary = ctx
            .process_map
            .find_by_kind(RegionKind::Binary)
            .ok_or("target binary is missing from the process mappings. Please report this!")?;
        eprintln!(
            "target mapped at {:#x}-{:#x} ({})",
            binary.begin, binary.end, binary.permissions
        );
        binary.begin
    };

    if let Some(libc_region) = ctx.process_map.find_by_kind(RegionKind::Libc) {
        if let Some(path) = libc_region.filename.clone() {
            ctx.libc_version = symbols::libc_version(&path);
            ctx.libc_path = Some(path);
        }
    }
    describe_target(ctx);

    let mut addresses = Vec::with_capacity(ctx.allocator_symbols.len());
    for entry in &ctx.allocator_symbols {
        addresses.push(symbols::resolve_address(ctx.pid, entry, &ctx.process_map)?);
    }

    if ctx.target_is_stripped {
        match funcid::find_function_signatures(&ctx.target_path) {
            Ok(signatures) => {
                for signature in signatures.iter().filter(|signature| signature.offset != 0) {
                    let position = ctx
                        .allocator_symbols
                        .iter()
                        .position(|entry| entry.name == signature.name);
                    if let Some(position) = position {
                        eprintln!(
                            "identified {} at offset {:#x} by signature",
                            signature.name, signature.offset
                        );
                        addresses[position] = binary_base + signature.offset;
                    }
                }
            }
            Err(err) => eprintln!("warning: signature scan failed: {}", err),
        }
    }

    let mut have_override = false;
    if let Some(spec) = ctx.options.symbols.clone() {
        for symbol_override in symbols::parse_overrides(&spec)? {
            let position = ctx
                .allocator_symbols
                .iter()
                .position(|entry| entry.name == symbol_override.name);
            match position {
                Some(position) => {
                    match symbols::override_address(&symbol_override, &ctx.process_map) {
                        Some(address) => {
                            addresses[position] = address;
                            have_override = true;
                        }
                        None => eprintln!(
                            "warning: module for override '{}' is not mapped",
                            symbol_override.name
                        ),
                    }
                }
                None => eprintln!(
                    "warning: override '{}' does not name a hooked allocator",
                    symbol_override.name
                ),
            }
        }
    }

    if addresses.iter().all(|&address| address == 0) && !have_override {
        eprintln!(
            "warning: no allocator symbols could be resolved; the target may be stripped \
             or may not use the glibc heap. Specify addresses with -s/--symbols, e.g. \
             --symbols 'malloc=libc+0x9d850,free=libc+0x9f420'"
        );
        return Ok(());
    }

    for (hook, address) in hooks::allocator_hooks().iter().zip(addresses) {
        breakpoint::install(
            &mut ctx.breakpoints,
            ctx.pid,
            Breakpoint::primary(
                hook.name,
                address,
                Some(hook.pre_handler),
                Some(hook.post_handler),
            ),
        )?;
    }

    Ok(())
}

// Report why the trace ended and the final statistics, run the SIGSEGV
// pause check, and detach where the tracee is expected to live on.
fn end_tracing(ctx: &mut TraceContext, reason: ShutdownReason) -> Result<(), Box<dyn Error>> {
    match &reason {
        ShutdownReason::Exited(code) => {
            println!();
            println!("Process exited with status {}.", code);
        }
        ShutdownReason::Killed(signal) | ShutdownReason::Crashed(signal) => {
            println!();
            print!(
                "Process exited with signal {} ({})",
                signal_name(*signal),
                signal
            );
            if let Some(name) = &ctx.between_pre_and_post {
                print!(" while executing {} (oid {})", name, ctx.oid());
            }
            println!(".");
        }
        ShutdownReason::Exec => {
            println!();
            print!("Detaching: the tracee replaced its image with exec()");
            if let Some(name) = &ctx.between_pre_and_post {
                print!(" while executing {} (oid {})", name, ctx.oid());
            }
            println!(".");
        }
    }

    if let Some(WaitStatus::Signaled(_, true)) = ctx.last_status {
        println!("Core dumped.");
    }

    hooks::show_stats(ctx);

    if let ShutdownReason::Crashed(signal) = reason {
        if signal == libc::SIGSEGV {
            pause::check_should_break(ctx, PauseTrigger::Segfault)?;
        }
    }
    if let ShutdownReason::Exec = reason {
        ptrace::detach(ctx.pid, libc::SIGCONT as u8)?;
    }

    Ok(())
}

// The event loop: continue the tracee, wait, classify the stop, and
// route it.  Every iteration either continues the tracee explicitly or
// returns through the shutdown path.
fn run_trace_loop(ctx: &mut TraceContext) -> Result<(), Box<dyn Error>> {
    let mut resume_signal: u8 = 0;

    loop {
        ptrace::cont(ctx.pid, resume_signal)?;
        let (_, status) = ptrace::waitpid(ctx.pid as i32)?;
        ctx.last_status = Some(status);
        resume_signal = 0;

        match status {
            WaitStatus::Exited(code) => {
                return end_tracing(ctx, ShutdownReason::Exited(code));
            }
            WaitStatus::Signaled(signal, _) => {
                return end_tracing(ctx, ShutdownReason::Killed(signal));
            }
            WaitStatus::Stopped(signal) if signal == libc::SIGTRAP => {
                if !on_breakpoint(ctx)? {
                    eprintln!("warning: trap at an unknown address; forwarding to the tracee");
                    resume_signal = libc::SIGTRAP as u8;
                }
            }
            WaitStatus::Stopped(signal) if is_fatal_stop(signal) => {
                return end_tracing(ctx, ShutdownReason::Crashed(signal));
            }
            WaitStatus::Stopped(signal) => {
                eprintln!(
                    "warning: tracee stopped with {}; passing it through",
                    signal_name(signal)
                );
                resume_signal = signal as u8;
            }
            WaitStatus::Event(PtraceEvent::Fork)
            | WaitStatus::Event(PtraceEvent::Vfork)
            | WaitStatus::Event(PtraceEvent::Clone) => {
                on_fork(ctx)?;
            }
            WaitStatus::Event(PtraceEvent::Exec) => {
                return end_tracing(ctx, ShutdownReason::Exec);
            }
            WaitStatus::Unknown(raw) => {
                eprintln!("warning: unexpected wait status {:#x}", raw);
            }
        }

        // Deferred work requested by the entry breakpoint.
        if ctx.should_map_syms {
            ctx.should_map_syms = false;
            map_symbols(ctx)?;
        }
    }
}

// Spawn the target and trace it until it exits, crashes, execs, or a
// break condition hands it to the debugger.
pub fn trace_command(
    options: commandline::CommandLineArguments,
) -> Result<(), Box<dyn Error>> {
    let target_path = commandline::resolve_target_path(&options.command[0])?;
    let allocator_symbols = symbols::lookup_symbols(&target_path, &hooks::ALLOCATOR_NAMES)?;

    let pid = ptrace::spawn_traced(&options.command)?;
    wait_for_signal(pid, libc::SIGTRAP)?;

    let mut ctx = TraceContext::new(pid, options, target_path, allocator_symbols);

    // Options must be in place before the first continue, or an early
    // fork can race the configuration and escape untraced.
    ptrace::setoptions(ctx.pid, trace_options_mask(ctx.options.follow_fork))?;

    let entry_address = process_map::auxv_entry_address(ctx.pid)?;
    breakpoint::install(
        &mut ctx.breakpoints,
        ctx.pid,
        Breakpoint::primary(
            "_entry",
            entry_address,
            Some(PreHandler::NoArgs(pre_entry)),
            None,
        ),
    )?;

    run_trace_loop(&mut ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_stop_signals() {
        assert!(is_fatal_stop(libc::SIGSEGV));
        assert!(is_fatal_stop(libc::SIGABRT));
        assert!(is_fatal_stop(libc::SIGBUS));
        assert!(!is_fatal_stop(libc::SIGTRAP));
        assert!(!is_fatal_stop(libc::SIGCHLD));
    }

    #[test]
    fn names_common_signals() {
        assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(64), "signal 64");
    }

    #[test]
    fn option_mask_tracks_forks_only_when_following() {
        let base = trace_options_mask(false);
        assert_eq!(base, libc::PTRACE_O_TRACEEXEC);

        let follow = trace_options_mask(true);
        assert_ne!(follow & libc::PTRACE_O_TRACEFORK, 0);
        assert_ne!(follow & libc::PTRACE_O_TRACEVFORK, 0);
        assert_ne!(follow & libc::PTRACE_O_TRACECLONE, 0);
        assert_ne!(follow & libc::PTRACE_O_TRACEEXEC, 0);
    }
}
