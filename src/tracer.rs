//! Thin wrapper around ptrace for one tracee thread.
//!
//! Structured requests go through nix; the word-sized PEEK/POKE family and
//! the floating-point register file use raw `libc::ptrace`, which nix does
//! not expose.

use crate::address::VirtualAddress;
use crate::error::{Error, Result};
use crate::register::RegisterState;
use log::debug;
use memoffset::offset_of;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::ffi::CString;
use std::path::Path;

/// How a thread should be set running again.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResumeRequest {
    /// PTRACE_CONT.
    Continue,
    /// PTRACE_SYSCALL: trap on syscall entry and exit.
    SyscallTrapped,
    /// PTRACE_SINGLESTEP.
    SingleStep,
}

/// Per-thread ptrace handle. Copyable; holds no state beyond the tid.
#[derive(Copy, Clone, Debug)]
pub struct Tracer {
    tid: Pid,
}

impl Tracer {
    pub fn new(tid: Pid) -> Tracer {
        Tracer { tid }
    }

    pub fn tid(&self) -> Pid {
        self.tid
    }

    /// Attach to an already-running thread. The caller must wait for the
    /// attach SIGSTOP before issuing further requests.
    pub fn attach(tid: Pid) -> Result<Tracer> {
        ptrace::attach(tid).map_err(|e| os(tid, "PTRACE_ATTACH", e))?;
        Ok(Tracer { tid })
    }

    /// Fork and exec a new tracee. The child places itself in its own
    /// process group (so wait-for-any-thread and Ctrl-C forwarding can use
    /// `-pgid`) and disables ASLR for deterministic addresses. Returns once
    /// the child has forked; the caller waits for the exec trap.
    pub fn launch(path: &Path, args: &[String]) -> Result<Tracer> {
        let exe = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| Error::invalid("NUL in executable path"))?;
        let mut argv = vec![exe.clone()];
        for arg in args {
            argv.push(
                CString::new(arg.as_bytes()).map_err(|_| Error::invalid("NUL in argument"))?,
            );
        }

        match unsafe { nix::unistd::fork() }
            .map_err(|e| Error::os("fork of tracee failed", e))?
        {
            nix::unistd::ForkResult::Child => {
                let _ = nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));
                if let Ok(persona) = nix::sys::personality::get() {
                    let _ = nix::sys::personality::set(
                        persona | nix::sys::personality::Persona::ADDR_NO_RANDOMIZE,
                    );
                }
                if ptrace::traceme().is_err() {
                    unsafe { libc::_exit(127) };
                }
                let _ = nix::unistd::execvp(&exe, &argv);
                unsafe { libc::_exit(127) }
            }
            nix::unistd::ForkResult::Parent { child } => {
                debug!("launched tracee {} for {:?}", child, path);
                Ok(Tracer { tid: child })
            }
        }
    }

    pub fn set_options(&self, owns_process: bool) -> Result<()> {
        let mut options = ptrace::Options::PTRACE_O_TRACESYSGOOD | ptrace::Options::PTRACE_O_TRACECLONE;
        if owns_process {
            options |= ptrace::Options::PTRACE_O_EXITKILL;
        }
        ptrace::setoptions(self.tid, options).map_err(|e| os(self.tid, "PTRACE_SETOPTIONS", e))
    }

    pub fn resume(&self, how: ResumeRequest, signal: Option<Signal>) -> Result<()> {
        let r = match how {
            ResumeRequest::Continue => ptrace::cont(self.tid, signal),
            ResumeRequest::SyscallTrapped => ptrace::syscall(self.tid, signal),
            ResumeRequest::SingleStep => ptrace::step(self.tid, signal),
        };
        r.map_err(|e| os(self.tid, "resume", e))
    }

    pub fn detach(&self, signal: Option<Signal>) -> Result<()> {
        ptrace::detach(self.tid, signal).map_err(|e| os(self.tid, "PTRACE_DETACH", e))
    }

    pub fn get_siginfo(&self) -> Result<libc::siginfo_t> {
        ptrace::getsiginfo(self.tid).map_err(|e| os(self.tid, "PTRACE_GETSIGINFO", e))
    }

    /// Message of the last ptrace event, e.g. the new tid at a clone trap.
    pub fn get_event_message(&self) -> Result<u64> {
        ptrace::getevent(self.tid)
            .map(|m| m as u64)
            .map_err(|e| os(self.tid, "PTRACE_GETEVENTMSG", e))
    }

    pub fn get_gprs(&self) -> Result<libc::user_regs_struct> {
        ptrace::getregs(self.tid).map_err(|e| os(self.tid, "PTRACE_GETREGS", e))
    }

    pub fn set_gprs(&self, regs: &libc::user_regs_struct) -> Result<()> {
        ptrace::setregs(self.tid, *regs).map_err(|e| os(self.tid, "PTRACE_SETREGS", e))
    }

    pub fn get_fprs(&self) -> Result<libc::user_fpregs_struct> {
        let mut fprs: libc::user_fpregs_struct = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_GETFPREGS,
                self.tid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                &mut fprs as *mut libc::user_fpregs_struct,
            )
        };
        if rc == -1 {
            return Err(os(self.tid, "PTRACE_GETFPREGS", last_errno()));
        }
        Ok(fprs)
    }

    pub fn set_fprs(&self, fprs: &libc::user_fpregs_struct) -> Result<()> {
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_SETFPREGS,
                self.tid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                fprs as *const libc::user_fpregs_struct,
            )
        };
        if rc == -1 {
            return Err(os(self.tid, "PTRACE_SETFPREGS", last_errno()));
        }
        Ok(())
    }

    /// Read one word of the user area.
    pub fn peek_user(&self, offset: usize) -> Result<u64> {
        nix::errno::Errno::clear();
        let word = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKUSER,
                self.tid.as_raw(),
                offset as *mut libc::c_void,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        if word == -1 && nix::errno::Errno::last() != nix::errno::Errno::UnknownErrno {
            return Err(os(self.tid, "PTRACE_PEEKUSER", last_errno()));
        }
        Ok(word as u64)
    }

    pub fn poke_user(&self, offset: usize, word: u64) -> Result<()> {
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEUSER,
                self.tid.as_raw(),
                offset as *mut libc::c_void,
                word as *mut libc::c_void,
            )
        };
        if rc == -1 {
            return Err(os(self.tid, "PTRACE_POKEUSER", last_errno()));
        }
        Ok(())
    }

    pub fn peek_data(&self, addr: VirtualAddress) -> Result<u64> {
        nix::errno::Errno::clear();
        let word = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKDATA,
                self.tid.as_raw(),
                addr.as_u64() as *mut libc::c_void,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        if word == -1 && nix::errno::Errno::last() != nix::errno::Errno::UnknownErrno {
            return Err(os(self.tid, "PTRACE_PEEKDATA", last_errno()));
        }
        Ok(word as u64)
    }

    pub fn poke_data(&self, addr: VirtualAddress, word: u64) -> Result<()> {
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEDATA,
                self.tid.as_raw(),
                addr.as_u64() as *mut libc::c_void,
                word as *mut libc::c_void,
            )
        };
        if rc == -1 {
            return Err(os(self.tid, "PTRACE_POKEDATA", last_errno()));
        }
        Ok(())
    }

    /// Offset of dr`index` inside the user area.
    pub fn debug_register_offset(index: usize) -> usize {
        offset_of!(libc::user, u_debugreg) + index * std::mem::size_of::<u64>()
    }

    pub fn get_debug_register(&self, index: usize) -> Result<u64> {
        self.peek_user(Self::debug_register_offset(index))
    }

    pub fn set_debug_register(&self, index: usize, value: u64) -> Result<()> {
        self.poke_user(Self::debug_register_offset(index), value)
    }

    pub fn get_debug_registers(&self) -> Result<[u64; 8]> {
        let mut out = [0u64; 8];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.get_debug_register(i)?;
        }
        Ok(out)
    }

    /// Snapshot all register files into an immutable state.
    pub fn read_register_state(&self) -> Result<RegisterState> {
        let gprs = self.get_gprs()?;
        let fprs = self.get_fprs()?;
        let debug = self.get_debug_registers()?;
        Ok(RegisterState::new(gprs, fprs, debug))
    }

    /// Write a state back. dr4/dr5 are reserved and skipped; the remaining
    /// debug registers are written so a get/set round trip is exact.
    pub fn write_register_state(&self, state: &RegisterState) -> Result<()> {
        self.set_gprs(state.gprs())?;
        self.set_fprs(state.fprs())?;
        for i in [0usize, 1, 2, 3, 6, 7].iter().copied() {
            self.set_debug_register(i, state.debug_registers()[i])?;
        }
        Ok(())
    }

    pub fn set_program_counter(&self, pc: VirtualAddress) -> Result<()> {
        let mut regs = self.get_gprs()?;
        regs.rip = pc.as_u64();
        self.set_gprs(&regs)
    }

    /// Queue a signal directly to this thread (not the whole process).
    pub fn tgkill(&self, tgid: Pid, signal: Signal) -> Result<()> {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                tgid.as_raw() as libc::c_long,
                self.tid.as_raw() as libc::c_long,
                signal as libc::c_int,
            )
        };
        if rc == -1 {
            return Err(os(self.tid, "tgkill", last_errno()));
        }
        Ok(())
    }
}

/// Block until some thread of the tracee's process group changes state.
pub fn wait_any(process_group: Pid) -> Result<WaitStatus> {
    let target = Pid::from_raw(-process_group.as_raw());
    waitpid(target, Some(WaitPidFlag::__WALL))
        .map_err(|e| os(process_group, "wait4(-pgid, __WALL)", e))
}

/// Block until one specific thread changes state.
pub fn wait_thread(tid: Pid) -> Result<WaitStatus> {
    waitpid(tid, Some(WaitPidFlag::__WALL)).map_err(|e| os(tid, "waitpid", e))
}

fn last_errno() -> nix::Error {
    nix::errno::Errno::last()
}

fn os(tid: Pid, what: &str, e: nix::Error) -> Error {
    if e == nix::errno::Errno::ESRCH {
        Error::ProcessExited { pid: tid.as_raw() }
    } else {
        Error::os(format!("{} on tid {}", what, tid), e)
    }
}
