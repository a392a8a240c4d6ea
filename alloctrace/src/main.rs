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

mod breakpoint;
mod commandline;
mod context;
mod funcid;
mod hooks;
mod pause;
mod process_map;
mod ptrace;
mod symbols;
mod trace;

use std::error::Error;

// The main entry point for alloctrace.
fn main() -> Result<(), Box<dyn Error>> {
    let args = commandline::CommandLineArguments::parse(&mut std::env::args())?;
    if args.report_version {
        commandline::report_version();
        return Ok(());
    }
    if args.show_help || args.command.is_empty() {
        commandline::show_help();
        return Ok(());
    }

    trace::trace_command(args)
}
