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

use integration_test::*;
use std::error::Error;

// A crash after a tracked malloc: the malloc pair completes, the crash
// is reported with its signal name, and nothing was freed.
#[test]
fn report_sigsegv() -> Result<(), Box<dyn Error>> {
    let output = trace_tracee("segv.c", &["-Wl,-z,now"], &[])?;

    assert_eq!(output.status, Some(0));
    assert!(
        output.stdout.contains("SIGSEGV"),
        "no SIGSEGV report in:\n{}",
        output.stdout
    );
    assert_eq!(counter(&output.stdout, "mallocs")?, 1);
    assert_eq!(counter(&output.stdout, "frees")?, 0);

    Ok(())
}

// A tracked malloc followed by an exec: one complete malloc pair, then
// the tracer detaches and reports the image replacement.
#[test]
fn detach_on_exec() -> Result<(), Box<dyn Error>> {
    let output = trace_tracee("execer.c", &["-Wl,-z,now"], &[])?;

    assert_eq!(output.status, Some(0));
    assert!(
        capture(&output.stdout, r"malloc\(0x1\) = (0x[0-9a-f]+)").is_ok(),
        "malloc pair missing from:\n{}",
        output.stdout
    );
    assert!(
        output.stdout.contains("exec()"),
        "no exec notice in:\n{}",
        output.stdout
    );
    assert_eq!(counter(&output.stdout, "mallocs")?, 1);

    Ok(())
}

// With follow-fork off, the fork runs untraced and the child's malloc
// is never reported; the parent is the process whose exit ends the
// trace.
#[test]
fn fork_is_not_followed_by_default() -> Result<(), Box<dyn Error>> {
    let output = trace_tracee("forker.c", &["-Wl,-z,now"], &[])?;

    assert_eq!(output.status, Some(0));
    assert!(
        output.stdout.contains("child="),
        "parent output missing from:\n{}",
        output.stdout
    );
    assert!(
        !output.stdout.contains("malloc(0x8)"),
        "child malloc leaked into the parent trace:\n{}",
        output.stdout
    );

    Ok(())
}

// With follow-fork on, the parent is detached at the fork event and the
// child's allocations are the ones traced.
#[test]
fn fork_is_followed_on_request() -> Result<(), Box<dyn Error>> {
    let output = trace_tracee("forker.c", &["-Wl,-z,now"], &["--follow-fork"])?;

    assert_eq!(output.status, Some(0));
    assert!(
        output.stderr.contains("following fork"),
        "no follow notice in:\n{}",
        output.stderr
    );
    assert!(
        capture(&output.stdout, r"malloc\(0x8\) = (0x[0-9a-f]+)").is_ok(),
        "child malloc missing from:\n{}",
        output.stdout
    );
    assert_eq!(counter(&output.stdout, "mallocs")?, 1);

    Ok(())
}

// --break-at-main: at the entry point the tracer tears its breakpoints
// down, detaches the tracee stopped, and execs the configured debugger
// with the tracee's pid.  /bin/echo stands in for gdb and prints the
// arguments it was handed.
#[test]
fn pause_at_entry_hands_off_to_the_debugger() -> Result<(), Box<dyn Error>> {
    let output = trace_tracee(
        "basic.c",
        &["-Wl,-z,now"],
        &["--break-at-main", "--gdb-path", "/bin/echo"],
    )?;

    let tracee_pid: u32 = capture(&output.stdout, r"-p (\d+)")?.parse()?;
    kill_leftover(tracee_pid);

    assert_eq!(output.status, Some(0));
    assert!(
        output.stdout.contains("PROCESS PAUSED"),
        "no pause notice in:\n{}",
        output.stdout
    );
    // The debugger replaced the tracer before any allocator ran.
    assert!(!output.stdout.contains("malloc("));

    Ok(())
}

// --break-at pauses before the matching operation executes: the malloc
// report line is started but never completed with a return value.
#[test]
fn pause_before_an_operation_by_oid() -> Result<(), Box<dyn Error>> {
    let output = trace_tracee(
        "basic.c",
        &["-Wl,-z,now"],
        &["--break-at", "1", "--gdb-path", "/bin/echo"],
    )?;

    let tracee_pid: u32 = capture(&output.stdout, r"-p (\d+)")?.parse()?;
    kill_leftover(tracee_pid);

    assert_eq!(output.status, Some(0));
    assert!(output.stdout.contains("malloc(0x18)"));
    assert!(
        !output.stdout.contains("malloc(0x18) ="),
        "operation completed although the tracer should have paused first:\n{}",
        output.stdout
    );

    Ok(())
}

// --break-at-sigsegv: the crash report is followed by the handoff.
#[test]
fn pause_on_sigsegv() -> Result<(), Box<dyn Error>> {
    let output = trace_tracee(
        "segv.c",
        &["-Wl,-z,now"],
        &["--break-at-sigsegv", "--gdb-path", "/bin/echo"],
    )?;

    let tracee_pid: u32 = capture(&output.stdout, r"-p (\d+)")?.parse()?;
    kill_leftover(tracee_pid);

    assert_eq!(output.status, Some(0));
    assert!(output.stdout.contains("SIGSEGV"));
    assert!(output.stdout.contains("PROCESS PAUSED"));

    Ok(())
}
