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

use std::error::Error;
use std::path::Path;

const DEFAULT_GDB_PATH: &str = "/usr/bin/gdb";

// Parsed commandline arguments.
pub struct CommandLineArguments {
    // The commandline for the process to trace.
    pub command: Vec<String>,

    // If true, switch to the child at a fork and detach the parent.
    pub follow_fork: bool,

    // Allocator address overrides, e.g. "malloc=libc+0x9d850,free=bin+0x400".
    pub symbols: Option<String>,

    // Pause and attach the debugger before the given operation.
    pub break_at: Option<u64>,

    // Pause and attach the debugger after the given operation.
    pub break_after: Option<u64>,

    // Pause and attach the debugger at the program entry point.
    pub break_at_main: bool,

    // Pause and attach the debugger when the tracee receives SIGSEGV.
    pub break_at_sigsegv: bool,

    // The debugger to attach on pause.
    pub gdb_path: String,

    // If true, print the version of the tool and exit.
    pub report_version: bool,

    // If true, print the commandline help text and exit.
    pub show_help: bool,
}

// A flag that consumes the following token as its value.
enum Expecting {
    Nothing,
    Symbols,
    BreakAt,
    BreakAfter,
    GdbPath,
}

// Print the commandline help text.
pub fn show_help() {
    println!(
        "Usage: alloctrace [OPTIONS] [--] COMMAND [ARGS...]

    -F, --follow-fork        Trace the child after a fork instead of the parent
    -s, --symbols SPEC       Override allocator addresses,
                             e.g. 'malloc=libc+0x9d850,free=bin+0x400'
        --break-at OID       Pause and attach the debugger before an operation
        --break-after OID    Pause and attach the debugger after an operation
        --break-at-main      Pause and attach the debugger at the entry point
        --break-at-sigsegv   Pause and attach the debugger on a segfault
        --gdb-path PATH      Debugger to attach on pause (default {})
    -h, --help               Show this help text
    -v, --version            Report version
",
        DEFAULT_GDB_PATH
    );
}

// Print the version of the build.
pub fn report_version() {
    println!("alloctrace {}", env!("CARGO_PKG_VERSION"));
}

// Resolve the target command to an absolute path, searching PATH for
// bare names, so the ELF can be read before the process exists.
pub fn resolve_target_path(command: &str) -> Result<String, Box<dyn Error>> {
    let candidate = if command.contains('/') {
        Path::new(command).to_path_buf()
    } else {
        std::env::var("PATH")
            .unwrap_or_default()
            .split(':')
            .filter(|directory| !directory.is_empty())
            .map(|directory| Path::new(directory).join(command))
            .find(|path| path.is_file())
            .ok_or_else(|| format!("target '{}' not found in PATH", command))?
    };

    let resolved = std::fs::canonicalize(&candidate)
        .map_err(|err| format!("cannot resolve target '{}': {}", command, err))?;
    Ok(resolved
        .to_str()
        .ok_or("target path is not valid UTF-8")?
        .to_string())
}

fn parse_oid(token: &str) -> Result<u64, Box<dyn Error>> {
    token
        .parse::<u64>()
        .map_err(|_| format!("invalid operation id: {}", token).into())
}

impl CommandLineArguments {
    // Parse the commandline.  The first token that is not one of our
    // flags starts the target command; anything after it belongs to the
    // target, as does everything after a bare "--".
    pub fn parse(
        args: &mut dyn Iterator<Item = String>,
    ) -> Result<CommandLineArguments, Box<dyn Error>> {
        let mut command: Vec<String> = Vec::new();
        let mut follow_fork = false;
        let mut symbols: Option<String> = None;
        let mut break_at: Option<u64> = None;
        let mut break_after: Option<u64> = None;
        let mut break_at_main = false;
        let mut break_at_sigsegv = false;
        let mut gdb_path: Option<String> = None;
        let mut report_version = false;
        let mut show_help = false;

        let mut command_started = false;
        let mut expecting = Expecting::Nothing;

        for token in args.skip(1) {
            let mut consumed_token = false;

            // If the target command has already started, assume any flag
            // arguments are for the target, not us.
            if !command_started {
                match expecting {
                    Expecting::Nothing => (),
                    Expecting::Symbols => {
                        symbols = Some(token.clone());
                        expecting = Expecting::Nothing;
                        continue;
                    }
                    Expecting::BreakAt => {
                        break_at = Some(parse_oid(&token)?);
                        expecting = Expecting::Nothing;
                        continue;
                    }
                    Expecting::BreakAfter => {
                        break_after = Some(parse_oid(&token)?);
                        expecting = Expecting::Nothing;
                        continue;
                    }
                    Expecting::GdbPath => {
                        gdb_path = Some(token.clone());
                        expecting = Expecting::Nothing;
                        continue;
                    }
                }

                if token == "--" {
                    command_started = true;
                    continue;
                }

                if token.chars().next() == Some('-') {
                    consumed_token = true;

                    if token.chars().nth(1) == Some('-') {
                        match token.as_str() {
                            "--help" => show_help = true,
                            "--version" => report_version = true,
                            "--follow-fork" => follow_fork = true,
                            "--symbols" => expecting = Expecting::Symbols,
                            "--break-at" => expecting = Expecting::BreakAt,
                            "--break-after" => expecting = Expecting::BreakAfter,
                            "--break-at-main" => break_at_main = true,
                            "--break-at-sigsegv" => break_at_sigsegv = true,
                            "--gdb-path" => expecting = Expecting::GdbPath,
                            _ => {
                                eprintln!("Unrecognized argument: {}", token);
                                show_help = true;
                            }
                        }
                    } else {
                        for flag in token.chars().skip(1) {
                            match flag {
                                'h' => show_help = true,
                                'v' => report_version = true,
                                'F' => follow_fork = true,
                                's' => expecting = Expecting::Symbols,
                                _ => {
                                    eprintln!("Unrecognized flag: {}", flag);
                                    show_help = true;
                                }
                            }
                        }
                    }
                }
            }

            if !consumed_token {
                command.push(token.clone());
                command_started = true;
            }
        }

        match expecting {
            Expecting::Nothing => (),
            Expecting::Symbols => Err("--symbols requires a value")?,
            Expecting::BreakAt => Err("--break-at requires a value")?,
            Expecting::BreakAfter => Err("--break-after requires a value")?,
            Expecting::GdbPath => Err("--gdb-path requires a value")?,
        }

        Ok(CommandLineArguments {
            command,
            follow_fork,
            symbols,
            break_at,
            break_after,
            break_at_main,
            break_at_sigsegv,
            gdb_path: gdb_path.unwrap_or_else(|| DEFAULT_GDB_PATH.to_string()),
            report_version,
            show_help,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(tokens: &[&str]) -> CommandLineArguments {
        CommandLineArguments::parse(&mut tokens.iter().map(|token| token.to_string())).unwrap()
    }

    #[test]
    fn parses_flags_before_the_command() {
        let args = parse(&[
            "alloctrace",
            "--follow-fork",
            "--break-at",
            "3",
            "--gdb-path",
            "/bin/echo",
            "./target",
            "arg1",
        ]);

        assert!(args.follow_fork);
        assert_eq!(args.break_at, Some(3));
        assert_eq!(args.break_after, None);
        assert_eq!(args.gdb_path, "/bin/echo");
        assert_eq!(args.command, vec!["./target", "arg1"]);
    }

    #[test]
    fn flags_after_the_command_belong_to_the_target() {
        let args = parse(&["alloctrace", "./target", "--follow-fork"]);
        assert!(!args.follow_fork);
        assert_eq!(args.command, vec!["./target", "--follow-fork"]);
    }

    #[test]
    fn double_dash_starts_the_command() {
        let args = parse(&["alloctrace", "-F", "--", "--break-at", "1"]);
        assert!(args.follow_fork);
        assert_eq!(args.break_at, None);
        assert_eq!(args.command, vec!["--break-at", "1"]);
    }

    #[test]
    fn parses_break_conditions_and_symbols() {
        let args = parse(&[
            "alloctrace",
            "--break-at-main",
            "--break-at-sigsegv",
            "--break-after",
            "7",
            "-s",
            "malloc=libc+0x10",
            "./target",
        ]);

        assert!(args.break_at_main);
        assert!(args.break_at_sigsegv);
        assert_eq!(args.break_after, Some(7));
        assert_eq!(args.symbols.as_deref(), Some("malloc=libc+0x10"));
    }

    #[test]
    fn defaults_are_unset() {
        let args = parse(&["alloctrace", "./target"]);
        assert!(!args.follow_fork);
        assert!(!args.break_at_main);
        assert!(!args.break_at_sigsegv);
        assert_eq!(args.break_at, None);
        assert_eq!(args.symbols, None);
        assert_eq!(args.gdb_path, DEFAULT_GDB_PATH);
        assert!(!args.show_help);
    }

    #[test]
    fn missing_values_are_errors() {
        let result = CommandLineArguments::parse(
            &mut ["alloctrace", "--break-at"].iter().map(|token| token.to_string()),
        );
        assert!(result.is_err());

        let result = CommandLineArguments::parse(
            &mut ["alloctrace", "--break-at", "x", "./t"]
                .iter()
                .map(|token| token.to_string()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn help_and_version_flags() {
        assert!(parse(&["alloctrace", "--help"]).show_help);
        assert!(parse(&["alloctrace", "-v"]).report_version);
        assert!(parse(&["alloctrace", "--badflag"]).show_help);
    }
}
