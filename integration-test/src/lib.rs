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

use regex::Regex;
use std::error::Error;
use std::path::PathBuf;
use std::process;

// Captured output of one tracer run.
pub struct TraceOutput {
    // The tracer's exit status code.
    pub status: Option<i32>,

    // The report stream: operation lines and statistics.
    pub stdout: String,

    // The diagnostic stream: warnings and notices.
    pub stderr: String,
}

// The alloctrace binary under test, found next to the test executable's
// target directory.
pub fn tracer_path() -> Result<PathBuf, Box<dyn Error>> {
    let mut path = std::env::current_exe()?;
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("alloctrace");

    if !path.is_file() {
        Err(format!(
            "alloctrace binary not found at {}; build the workspace first",
            path.display()
        ))?
    }

    Ok(path)
}

// Compile a single C source file from the tracee directory.  Returns the
// filename of the resulting binary, which can be traced for a test case.
pub fn compile_tracee(filename: &str, extra_args: &[&str]) -> Result<String, Box<dyn Error>> {
    let source_path = format!("{}/tracee/{}", env!("CARGO_MANIFEST_DIR"), filename);

    let period_offset = filename
        .find('.')
        .ok_or("no extension in source filename")?;
    let basename = &filename[..period_offset];

    // Generate an output filename based on the source filename and our PID.
    let binary_path = format!("/tmp/{}-{}", basename, process::id());

    let compiler = std::env::var("CC").unwrap_or_else(|_| "cc".to_string());
    let compiler_status = process::Command::new(&compiler)
        .arg(&source_path)
        .args(extra_args)
        .args(["-o", &binary_path])
        .spawn()?
        .wait()?;
    assert_eq!(compiler_status.code(), Some(0));

    Ok(binary_path)
}

// Run the tracer under test against a target binary and capture its
// output streams.
pub fn run_tracer(tracer_args: &[&str], target: &str) -> Result<TraceOutput, Box<dyn Error>> {
    let output = process::Command::new(tracer_path()?)
        .args(tracer_args)
        .arg("--")
        .arg(target)
        .output()?;

    Ok(TraceOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

// Compile a tracee, trace it, and clean up the binary.
pub fn trace_tracee(
    filename: &str,
    compile_args: &[&str],
    tracer_args: &[&str],
) -> Result<TraceOutput, Box<dyn Error>> {
    let binary_path = compile_tracee(filename, compile_args)?;
    let result = run_tracer(tracer_args, &binary_path);
    std::fs::remove_file(&binary_path)?;

    result
}

// Read one counter out of the statistics block.
pub fn counter(report: &str, label: &str) -> Result<u64, Box<dyn Error>> {
    let re = Regex::new(&format!(r"\.\.\. total {}: (\d+)", label))?;
    let caps = re
        .captures(report)
        .ok_or_else(|| format!("no '{}' counter in report", label))?;

    Ok(caps.get(1).ok_or("missing capture")?.as_str().parse()?)
}

// Find the first match of a single-capture pattern in a stream.
pub fn capture(text: &str, pattern: &str) -> Result<String, Box<dyn Error>> {
    let re = Regex::new(pattern)?;
    let caps = re
        .captures(text)
        .ok_or_else(|| format!("pattern '{}' not found in:\n{}", pattern, text))?;

    Ok(caps.get(1).ok_or("missing capture")?.as_str().to_string())
}

// Kill a process a test left stopped behind the tracer's back.
pub fn kill_leftover(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}
