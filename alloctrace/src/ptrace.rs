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

use libc;
use std::error::Error;
use std::ptr;

// A decoded result from the waitpid system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    // The process exited.  Included is the exit value.
    Exited(i32),

    // The process was killed by a signal.  Included is the signal value
    // and whether a core was dumped.
    Signaled(i32, bool),

    // The process has been stopped.  Included is the signal value.
    Stopped(i32),

    // A ptrace lifecycle event has occurred in the traced process.
    Event(PtraceEvent),

    // Anything the cases above do not cover, with the raw status word.
    Unknown(i32),
}

// The ptrace event kinds the tracer subscribes to with setoptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtraceEvent {
    Fork,
    Vfork,
    Clone,
    Exec,
}

// A string representing the current value of C's 'errno', for reporting
// errors from calls through libc.
pub fn errno_string() -> String {
    unsafe {
        let errno = *libc::__errno_location();
        std::ffi::CStr::from_ptr(libc::strerror(errno))
            .to_string_lossy()
            .into_owned()
    }
}

// Fork off a new child and exec a given command.  The child disables
// address space randomization, so that resolved breakpoint addresses are
// stable, and attaches itself as a tracee prior to exec.
//
// Returns the pid of the new process.
pub fn spawn_traced(command: &[String]) -> Result<u32, Box<dyn Error>> {
    let mut cstrings: Vec<std::ffi::CString> = Vec::new();
    let mut args: Vec<*const libc::c_char> = Vec::new();
    for arg in command {
        let cstring = std::ffi::CString::new(arg.clone())?;
        args.push(cstring.as_ptr());
        cstrings.push(cstring);
    }
    args.push(ptr::null());

    let pid;
    unsafe {
        pid = libc::fork();
        if pid == 0 {
            libc::personality(libc::ADDR_NO_RANDOMIZE as libc::c_ulong);
            libc::ptrace(libc::PTRACE_TRACEME, 0, 0, 0);
            libc::execvp(args[0], args.as_ptr());
            libc::exit(1);
        }
    }
    if pid == -1 {
        Err(errno_string())?
    }

    Ok(pid as u32)
}

// Continue a ptraced process's execution, delivering the given signal.
pub fn cont(pid: u32, signal: u8) -> Result<(), Box<dyn Error>> {
    unsafe {
        if libc::ptrace(libc::PTRACE_CONT, pid, 0, signal as libc::c_uint) == -1 {
            Err(errno_string())?
        } else {
            Ok(())
        }
    }
}

// Detach from a process which is currently being traced, delivering the
// given signal as it goes.
pub fn detach(pid: u32, signal: u8) -> Result<(), Box<dyn Error>> {
    unsafe {
        if libc::ptrace(libc::PTRACE_DETACH, pid, 0, signal as libc::c_uint) == -1 {
            Err(errno_string())?
        } else {
            Ok(())
        }
    }
}

// Step through a single instruction of a stopped ptraced process.
pub fn singlestep(pid: u32) -> Result<(), Box<dyn Error>> {
    unsafe {
        if libc::ptrace(libc::PTRACE_SINGLESTEP, pid, 0, 0) == -1 {
            Err(errno_string())?
        } else {
            Ok(())
        }
    }
}

// Get the CPU register contents of a currently stopped ptraced process.
pub fn getregs(pid: u32) -> Result<libc::user_regs_struct, Box<dyn Error>> {
    unsafe {
        let mut regs = std::mem::MaybeUninit::<libc::user_regs_struct>::zeroed().assume_init();

        if libc::ptrace(libc::PTRACE_GETREGS, pid, 0, &mut regs) == -1 {
            Err(errno_string())?
        } else {
            Ok(regs)
        }
    }
}

// Set the CPU register contents of a currently stopped ptraced process.
pub fn setregs(pid: u32, regs: &libc::user_regs_struct) -> Result<(), Box<dyn Error>> {
    unsafe {
        if libc::ptrace(libc::PTRACE_SETREGS, pid, 0, regs) == -1 {
            Err(errno_string())?
        } else {
            Ok(())
        }
    }
}

// Read an 8-byte word from a stopped ptraced process.
pub fn peektext(pid: u32, address: u64) -> u64 {
    unsafe { libc::ptrace(libc::PTRACE_PEEKTEXT, pid, address, 0) as u64 }
}

// Read an individual byte from a stopped ptraced process.
pub fn peekbyte(pid: u32, address: u64) -> u8 {
    ((peektext(pid, address & !7) >> ((address & 7) * 8)) & 0xFF) as u8
}

// Write an 8-byte word to a stopped ptraced process.
pub fn poketext(pid: u32, address: u64, word: u64) -> Result<(), Box<dyn Error>> {
    unsafe {
        if libc::ptrace(libc::PTRACE_POKETEXT, pid, address, word) == -1 {
            Err(errno_string())?
        } else {
            Ok(())
        }
    }
}

// Set ptrace options on a stopped process.
pub fn setoptions(pid: u32, options: i32) -> Result<(), Box<dyn Error>> {
    unsafe {
        if libc::ptrace(libc::PTRACE_SETOPTIONS, pid, 0, options) == -1 {
            Err(errno_string())?
        } else {
            Ok(())
        }
    }
}

// Get the ptrace event message for a stopped process.  Used to get the
// PID of a newly spawned process after a fork, vfork or clone.
pub fn geteventmsg(pid: u32) -> Result<u32, Box<dyn Error>> {
    let mut message: libc::c_ulong = 0;

    unsafe {
        if libc::ptrace(libc::PTRACE_GETEVENTMSG, pid, 0, &mut message) == -1 {
            Err(errno_string())?
        } else {
            Ok(message as u32)
        }
    }
}

// Wait for an event from a traced process and decode the status word.
pub fn waitpid(pid: i32) -> Result<(u32, WaitStatus), Box<dyn Error>> {
    unsafe {
        let mut status: i32 = 0;

        let result = libc::waitpid(pid, &mut status, 0);
        if result == -1 {
            Err(errno_string())?
        }

        let event = status >> 16;
        let decoded = if event == libc::PTRACE_EVENT_FORK {
            WaitStatus::Event(PtraceEvent::Fork)
        } else if event == libc::PTRACE_EVENT_VFORK {
            WaitStatus::Event(PtraceEvent::Vfork)
        } else if event == libc::PTRACE_EVENT_CLONE {
            WaitStatus::Event(PtraceEvent::Clone)
        } else if event == libc::PTRACE_EVENT_EXEC {
            WaitStatus::Event(PtraceEvent::Exec)
        } else if libc::WIFEXITED(status) {
            WaitStatus::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            WaitStatus::Signaled(libc::WTERMSIG(status), libc::WCOREDUMP(status))
        } else if libc::WIFSTOPPED(status) {
            WaitStatus::Stopped(libc::WSTOPSIG(status))
        } else {
            WaitStatus::Unknown(status)
        };

        Ok((result as u32, decoded))
    }
}
