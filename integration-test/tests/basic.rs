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
use regex::Regex;
use std::error::Error;

// Trace a program that mallocs one chunk and frees it: both handlers of
// both operations fire, the pointer flows from malloc's return to
// free's argument, and the counters come out exact.
#[test]
fn trace_malloc_free() -> Result<(), Box<dyn Error>> {
    let output = trace_tracee("basic.c", &["-Wl,-z,now"], &[])?;

    assert_eq!(output.status, Some(0));

    let chunk = capture(&output.stdout, r"malloc\(0x18\) = (0x[0-9a-f]+)\s+\[oid 1\]")?;
    assert!(
        output.stdout.contains(&format!("free({})", chunk)),
        "free of the malloc'd chunk missing from:\n{}",
        output.stdout
    );

    assert_eq!(counter(&output.stdout, "mallocs")?, 1);
    assert_eq!(counter(&output.stdout, "callocs")?, 0);
    assert_eq!(counter(&output.stdout, "frees")?, 1);
    assert_eq!(counter(&output.stdout, "reallocs")?, 0);
    assert_eq!(counter(&output.stdout, "reallocarrays")?, 0);

    Ok(())
}

// Trace a program that reallocs a malloc'd chunk.  The realloc
// pre-handler sees the old pointer and the new size in the first two
// argument registers, and the operation ids are sequential.
#[test]
fn trace_realloc_arguments_and_oids() -> Result<(), Box<dyn Error>> {
    let output = trace_tracee("realloc.c", &["-Wl,-z,now"], &[])?;

    assert_eq!(output.status, Some(0));

    let chunk = capture(&output.stdout, r"malloc\(0x10\) = (0x[0-9a-f]+)\s+\[oid 1\]")?;
    let realloc_line = format!(
        r"realloc\({}, 0x20\) = 0x[0-9a-f]+\s+\[oid 2\]",
        chunk
    );
    assert!(
        Regex::new(&realloc_line)?.is_match(&output.stdout),
        "realloc line matching '{}' missing from:\n{}",
        realloc_line,
        output.stdout
    );

    assert_eq!(counter(&output.stdout, "mallocs")?, 1);
    assert_eq!(counter(&output.stdout, "reallocs")?, 1);
    assert_eq!(counter(&output.stdout, "frees")?, 1);

    Ok(())
}

// A target that does not link libc resolves no allocator symbols: the
// tracer warns, installs nothing, and lets the process run to its exit.
#[test]
fn warn_when_no_symbols_resolve() -> Result<(), Box<dyn Error>> {
    let output = trace_tracee("nolibc.c", &["-nostdlib", "-static"], &[])?;

    assert_eq!(output.status, Some(0));
    assert!(
        output.stderr.contains("--symbols"),
        "expected a --symbols suggestion in:\n{}",
        output.stderr
    );

    assert_eq!(counter(&output.stdout, "mallocs")?, 0);
    assert_eq!(counter(&output.stdout, "callocs")?, 0);
    assert_eq!(counter(&output.stdout, "frees")?, 0);
    assert_eq!(counter(&output.stdout, "reallocs")?, 0);
    assert_eq!(counter(&output.stdout, "reallocarrays")?, 0);
    assert!(output.stdout.contains("Process exited with status 0"));

    Ok(())
}
