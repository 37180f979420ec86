//! Per-thread stop/resume state machine.
//!
//! Each tracee thread gets one engine. Step operations block on their own
//! thread; the cross-thread wait loop belongs to the process engine, which
//! hands decoded wait results back in via `handle_wait_status`.

use crate::address::VirtualAddress;
use crate::call_stack::CallStack;
use crate::disasm;
use crate::error::{Error, Result};
use crate::loaded_elves::LoadedElves;
use crate::memory::Memory;
use crate::register::RegisterState;
use crate::stop_point::{StopPointId, StopPointSet};
use crate::stop_site::{StopSitePoolSharedPtr, StopSiteType, TrapKind};
use crate::tracer::{wait_thread, ResumeRequest, Tracer};
use log::{debug, trace};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

/// Which syscalls produce user-visible stops.
#[derive(Clone, Debug)]
pub enum SyscallCatchPolicy {
    Off,
    All,
    Set(Vec<i64>),
}

impl SyscallCatchPolicy {
    pub fn is_off(&self) -> bool {
        matches!(self, SyscallCatchPolicy::Off)
    }

    pub fn matches(&self, number: i64) -> bool {
        match self {
            SyscallCatchPolicy::Off => false,
            SyscallCatchPolicy::All => true,
            SyscallCatchPolicy::Set(list) => list.contains(&number),
        }
    }
}

/// Shared process-wide collaborators every thread operation needs.
pub struct ProcessContext {
    pub pid: Pid,
    pub memory: Rc<dyn Memory>,
    pub pool: StopSitePoolSharedPtr,
    pub elves: Rc<RefCell<LoadedElves>>,
    pub stop_points: Rc<RefCell<StopPointSet>>,
    pub syscall_policy: Rc<RefCell<SyscallCatchPolicy>>,
    /// Tids born from clone traps observed inside thread-focused
    /// operations; the process engine drains this into its roster.
    pub pending_new_threads: RefCell<Vec<Pid>>,
}

#[derive(Clone, Debug)]
pub struct SyscallInfo {
    pub number: i64,
    /// Entry trap when true, exit trap when false.
    pub entry: bool,
    pub return_value: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct StoppedStatus {
    pub signal: Option<Signal>,
    pub trap: Option<TrapKind>,
    pub stop_points: Vec<StopPointId>,
    pub syscall: Option<SyscallInfo>,
    pub next_instruction: VirtualAddress,
    pub source_file: Option<PathBuf>,
    pub source_line: Option<u64>,
    pub function_name: Option<String>,
}

#[derive(Clone, Debug)]
pub enum ThreadStatus {
    Running,
    Stopped(StoppedStatus),
    Signaled(Signal),
    Exited(i32),
}

impl ThreadStatus {
    pub fn is_alive(&self) -> bool {
        matches!(self, ThreadStatus::Running | ThreadStatus::Stopped(_))
    }

    pub fn stopped(&self) -> Option<&StoppedStatus> {
        match self {
            ThreadStatus::Stopped(s) => Some(s),
            _ => None,
        }
    }
}

/// What the process engine should do with a wait result after this thread
/// decoded it.
#[derive(Debug)]
pub enum StopDisposition {
    /// Surface to the user.
    UserVisible,
    /// Handled internally (swallowed SIGSTOP, uninteresting syscall trap);
    /// resume this thread and keep waiting.
    ResumeTransparently,
    /// The thread is gone; drop its engine after bookkeeping.
    ThreadGone,
    /// A clone trap; the payload is the new thread's tid.
    CloneChild(Pid),
}

pub struct ThreadEngine {
    tracer: Tracer,
    status: ThreadStatus,
    call_stack: CallStack,
    /// An engine-queued SIGSTOP (thread birth) that must never surface.
    pending_internal_sigstop: bool,
    /// A non-trap signal to re-deliver on the next resume.
    pending_signal: Option<Signal>,
    /// Toggled on every syscall trap; entry vs exit.
    expects_syscall_exit: bool,
    last_syscall_number: i64,
}

impl ThreadEngine {
    pub fn new(tid: Pid, pending_internal_sigstop: bool) -> ThreadEngine {
        ThreadEngine {
            tracer: Tracer::new(tid),
            status: ThreadStatus::Running,
            call_stack: CallStack::empty(),
            pending_internal_sigstop,
            pending_signal: None,
            expects_syscall_exit: false,
            last_syscall_number: 0,
        }
    }

    pub fn tid(&self) -> Pid {
        self.tracer.tid()
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn status(&self) -> &ThreadStatus {
        &self.status
    }

    pub fn call_stack(&self) -> &CallStack {
        &self.call_stack
    }

    pub fn call_stack_mut(&mut self) -> &mut CallStack {
        &mut self.call_stack
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.status, ThreadStatus::Stopped(_))
    }

    /// Force the syscall-exit expectation off; called when the catch
    /// policy is disabled between an entry and its exit so the next trap
    /// is not misread as a return.
    pub fn clear_syscall_expectation(&mut self) {
        self.expects_syscall_exit = false;
    }

    /// Drop a recorded stop signal so it is not re-delivered on resume.
    /// Used for the engine-induced SIGSTOPs of an attach.
    pub fn discard_pending_signal(&mut self) {
        self.pending_signal = None;
    }

    pub fn register_state(&self) -> Result<RegisterState> {
        self.ensure_alive()?;
        self.tracer.read_register_state()
    }

    pub fn set_register_state(&mut self, state: &RegisterState) -> Result<()> {
        self.ensure_alive()?;
        self.tracer.write_register_state(state)
    }

    pub fn program_counter(&self) -> Result<VirtualAddress> {
        Ok(VirtualAddress::new(self.tracer.get_gprs()?.rip))
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.status.is_alive() {
            Ok(())
        } else {
            Err(Error::ProcessExited {
                pid: self.tid().as_raw(),
            })
        }
    }

    /// Swallow the engine-queued SIGSTOP, step off any enabled site under
    /// the pc, then issue the policy's resume request. The caller owns
    /// the wait.
    pub fn prepare_resume(&mut self, ctx: &ProcessContext) -> Result<()> {
        self.ensure_alive()?;
        self.swallow_internal_sigstop()?;
        self.step_off_stop_site(ctx)?;
        if let ThreadStatus::Exited(_) | ThreadStatus::Signaled(_) = self.status {
            return Err(Error::ProcessExited {
                pid: self.tid().as_raw(),
            });
        }

        // dr6 is sticky; clear it so the next stop's decoding only sees
        // fresh hits.
        self.tracer.set_debug_register(6, 0)?;

        let policy_off = ctx.syscall_policy.borrow().is_off();
        if policy_off {
            self.expects_syscall_exit = false;
        }
        let request = if policy_off {
            ResumeRequest::Continue
        } else {
            ResumeRequest::SyscallTrapped
        };
        let signal = self.pending_signal.take();
        self.tracer.resume(request, signal)?;
        self.status = ThreadStatus::Running;
        Ok(())
    }

    fn swallow_internal_sigstop(&mut self) -> Result<()> {
        while self.pending_internal_sigstop {
            // A queued SIGSTOP only materialises as a stop event once the
            // thread runs; a freshly-cloned thread's birth stop is already
            // pending and must only be waited for.
            if self.is_stopped() {
                self.tracer.resume(ResumeRequest::Continue, None)?;
                self.status = ThreadStatus::Running;
            }
            match wait_thread(self.tid())? {
                WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                    trace!("swallowed internal SIGSTOP on {}", self.tid());
                    self.pending_internal_sigstop = false;
                }
                WaitStatus::Stopped(_, other) => {
                    // A real signal raced in front; keep it for delivery.
                    self.pending_signal = Some(other);
                    self.tracer.resume(ResumeRequest::Continue, None)?;
                }
                WaitStatus::Exited(_, code) => {
                    self.status = ThreadStatus::Exited(code);
                    self.pending_internal_sigstop = false;
                }
                WaitStatus::Signaled(_, signal, _) => {
                    self.status = ThreadStatus::Signaled(signal);
                    self.pending_internal_sigstop = false;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// INT3 under the current pc must not fire on resume: single-step
    /// across it with every co-located site disabled, then re-enable.
    fn step_off_stop_site(&mut self, ctx: &ProcessContext) -> Result<()> {
        let pc = self.program_counter()?;
        let sites = ctx.pool.borrow().enabled_sites_at(pc);
        if sites.is_empty() {
            return Ok(());
        }
        for key in &sites {
            ctx.pool.borrow_mut().disable(key)?;
        }
        let stepped = (|| -> Result<()> {
            self.tracer.resume(ResumeRequest::SingleStep, None)?;
            match wait_thread(self.tid())? {
                WaitStatus::Exited(_, code) => {
                    self.status = ThreadStatus::Exited(code);
                }
                WaitStatus::Signaled(_, signal, _) => {
                    self.status = ThreadStatus::Signaled(signal);
                }
                _ => {}
            }
            Ok(())
        })();
        // Re-enable even when the step failed; the pool must reflect the
        // user's configuration again.
        for key in &sites {
            if self.status.is_alive() {
                ctx.pool.borrow_mut().enable(key)?;
            }
        }
        stepped
    }

    /// Decode a wait result for this thread, updating status, call stack
    /// and stop-point attribution.
    pub fn handle_wait_status(
        &mut self,
        ctx: &ProcessContext,
        wait: WaitStatus,
    ) -> Result<StopDisposition> {
        match wait {
            WaitStatus::Exited(_, code) => {
                debug!("thread {} exited with {}", self.tid(), code);
                self.status = ThreadStatus::Exited(code);
                Ok(StopDisposition::ThreadGone)
            }
            WaitStatus::Signaled(_, signal, _) => {
                debug!("thread {} killed by {}", self.tid(), signal);
                self.status = ThreadStatus::Signaled(signal);
                Ok(StopDisposition::ThreadGone)
            }
            WaitStatus::PtraceEvent(_, _, event) if event == libc::PTRACE_EVENT_CLONE => {
                let child = Pid::from_raw(self.tracer.get_event_message()? as i32);
                debug!("thread {} cloned {}", self.tid(), child);
                self.decode_stop(ctx, None, Some(TrapKind::Clone))?;
                ctx.pending_new_threads.borrow_mut().push(child);
                Ok(StopDisposition::CloneChild(child))
            }
            WaitStatus::PtraceEvent(_, signal, _) => {
                self.decode_stop(ctx, Some(signal), Some(TrapKind::Unknown))?;
                Ok(StopDisposition::UserVisible)
            }
            WaitStatus::PtraceSyscall(_) => self.handle_syscall_trap(ctx),
            WaitStatus::Stopped(_, Signal::SIGSTOP) if self.pending_internal_sigstop => {
                self.pending_internal_sigstop = false;
                trace!("swallowed internal SIGSTOP on {}", self.tid());
                Ok(StopDisposition::ResumeTransparently)
            }
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                let kind = self.trap_kind_from_siginfo()?;
                self.decode_stop(ctx, Some(Signal::SIGTRAP), Some(kind))?;
                Ok(StopDisposition::UserVisible)
            }
            WaitStatus::Stopped(_, signal) => {
                self.pending_signal = Some(signal);
                self.decode_stop(ctx, Some(signal), None)?;
                Ok(StopDisposition::UserVisible)
            }
            WaitStatus::Continued(_) | WaitStatus::StillAlive => {
                Ok(StopDisposition::ResumeTransparently)
            }
        }
    }

    fn handle_syscall_trap(&mut self, ctx: &ProcessContext) -> Result<StopDisposition> {
        let regs = self.tracer.get_gprs()?;
        let entry = !self.expects_syscall_exit;
        self.expects_syscall_exit = entry;
        let number = if entry {
            self.last_syscall_number = regs.orig_rax as i64;
            regs.orig_rax as i64
        } else {
            self.last_syscall_number
        };
        let interesting = ctx.syscall_policy.borrow().matches(number);
        if !interesting {
            return Ok(StopDisposition::ResumeTransparently);
        }
        let info = SyscallInfo {
            number,
            entry,
            return_value: if entry { None } else { Some(regs.rax as i64) },
        };
        let mut status = self.build_stopped_status(ctx, Some(Signal::SIGTRAP), Some(TrapKind::Syscall))?;
        status.syscall = Some(info);
        self.finish_stop(ctx, status)?;
        Ok(StopDisposition::UserVisible)
    }

    /// SIGTRAP cause per siginfo. SI_KERNEL covers INT3 on kernels that do
    /// not report TRAP_BRKPT.
    fn trap_kind_from_siginfo(&self) -> Result<TrapKind> {
        const TRAP_BRKPT: i32 = 1;
        const TRAP_TRACE: i32 = 2;
        const TRAP_HWBKPT: i32 = 4;
        const SI_KERNEL: i32 = 0x80;
        let siginfo = self.tracer.get_siginfo()?;
        Ok(match siginfo.si_code {
            TRAP_BRKPT | SI_KERNEL => TrapKind::Software,
            TRAP_TRACE => TrapKind::SingleStep,
            TRAP_HWBKPT => TrapKind::Hardware,
            _ => TrapKind::Unknown,
        })
    }

    /// Shared stop decoding: trap resolution, pc reset, watch-data
    /// refresh, source attribution, call-stack rebuild.
    fn decode_stop(
        &mut self,
        ctx: &ProcessContext,
        signal: Option<Signal>,
        trap: Option<TrapKind>,
    ) -> Result<()> {
        let status = self.build_stopped_status(ctx, signal, trap)?;
        self.finish_stop(ctx, status)
    }

    fn build_stopped_status(
        &mut self,
        ctx: &ProcessContext,
        signal: Option<Signal>,
        trap: Option<TrapKind>,
    ) -> Result<StoppedStatus> {
        let pc = self.program_counter()?;
        let (real_pc, stop_points) = match trap {
            Some(kind @ TrapKind::Software) | Some(kind @ TrapKind::Hardware) => {
                let dr6 = if kind == TrapKind::Hardware {
                    self.tracer.get_debug_register(6)?
                } else {
                    0
                };
                let (real_pc, sites) = ctx.pool.borrow().list_triggered(pc, kind, dr6);
                if kind == TrapKind::Hardware {
                    ctx.pool.borrow_mut().refresh_triggered_watch_data(dr6)?;
                }
                if real_pc != pc {
                    // x86 advanced past the INT3; report and resume from
                    // the patched instruction itself.
                    self.tracer.set_program_counter(real_pc)?;
                }
                let points = ctx.stop_points.borrow().points_for_sites(&sites);
                (real_pc, points)
            }
            _ => (pc, Vec::new()),
        };

        let (source_file, source_line, function_name) =
            source_location(&ctx.elves.borrow(), real_pc);

        Ok(StoppedStatus {
            signal,
            trap,
            stop_points,
            syscall: None,
            next_instruction: real_pc,
            source_file,
            source_line,
            function_name,
        })
    }

    fn finish_stop(&mut self, ctx: &ProcessContext, status: StoppedStatus) -> Result<()> {
        let state = self.tracer.read_register_state()?;
        // A stop must never be lost to a broken unwind; degrade to an
        // empty stack instead.
        self.call_stack = match CallStack::build(
            status.next_instruction,
            &state,
            &ctx.elves.borrow(),
            &*ctx.memory,
        ) {
            Ok(stack) => stack,
            Err(e) => {
                debug!("backtrace at {} failed: {}", status.next_instruction, e);
                CallStack::empty()
            }
        };
        self.status = ThreadStatus::Stopped(status);
        Ok(())
    }

    /// The stepping primitive. Disables co-located sites across the step;
    /// with `step_over_call`, a CALL at the pc turns into a resume to the
    /// instruction after it.
    pub fn step_instruction(
        &mut self,
        ctx: &ProcessContext,
        step_over_call: bool,
    ) -> Result<ThreadStatus> {
        self.ensure_alive()?;
        self.swallow_internal_sigstop()?;
        let pc = self.program_counter()?;

        if step_over_call {
            let mut window = [0u8; disasm::MAX_INSTRUCTION_LEN];
            // Best-effort read; pages can end mid-window.
            let _ = ctx.memory.read(pc, &mut window);
            ctx.pool.borrow().replace_stop_site_bytes(pc, &mut window);
            if let Ok(decoded) = disasm::decode_one(&window, pc.as_u64()) {
                if decoded.is_call {
                    return self.resume_until_address(ctx, pc + decoded.length as u64);
                }
            }
        }

        let sites = ctx.pool.borrow().enabled_sites_at(pc);
        for key in &sites {
            ctx.pool.borrow_mut().disable(key)?;
        }
        self.tracer.set_debug_register(6, 0)?;
        self.tracer.resume(ResumeRequest::SingleStep, None)?;
        self.status = ThreadStatus::Running;
        let wait = wait_thread(self.tid())?;
        for key in &sites {
            if !matches!(wait, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
                ctx.pool.borrow_mut().enable(key)?;
            }
        }
        self.handle_wait_status(ctx, wait)?;
        Ok(self.status.clone())
    }

    /// Run until pc reaches `target`, via a one-shot engine-owned software
    /// site. Any other user-visible stop on the way ends the operation
    /// there.
    pub fn resume_until_address(
        &mut self,
        ctx: &ProcessContext,
        target: VirtualAddress,
    ) -> Result<ThreadStatus> {
        self.ensure_alive()?;
        let handle = ctx
            .pool
            .borrow_mut()
            .allocate(target, StopSiteType::software_breakpoint())?;
        let was_enabled = handle.is_enabled();
        let run = (|| -> Result<()> {
            handle.enable()?;
            self.step_off_stop_site(ctx)?;
            if !self.status.is_alive() {
                return Ok(());
            }
            loop {
                self.tracer.set_debug_register(6, 0)?;
                self.tracer.resume(ResumeRequest::Continue, None)?;
                self.status = ThreadStatus::Running;
                let wait = wait_thread(self.tid())?;
                match self.handle_wait_status(ctx, wait)? {
                    StopDisposition::ResumeTransparently | StopDisposition::CloneChild(_) => {
                        continue
                    }
                    _ => return Ok(()),
                }
            }
        })();
        // Scoped cleanup: restore the site's user-visible enablement and
        // give our reference back, even on error.
        if !was_enabled {
            let _ = handle.disable();
        }
        let _ = handle.deallocate();
        run?;
        // A landing on the engine's own one-shot site is a step
        // completion, not a breakpoint hit.
        if let ThreadStatus::Stopped(stopped) = &mut self.status {
            if stopped.next_instruction == target
                && stopped.stop_points.is_empty()
                && stopped.trap == Some(TrapKind::Software)
            {
                stopped.trap = Some(TrapKind::SingleStep);
            }
        }
        Ok(self.status.clone())
    }

    /// Single-step until the source line changes (or the thread stops for
    /// another reason).
    fn step_until_different_line(
        &mut self,
        ctx: &ProcessContext,
        step_over_call: bool,
    ) -> Result<ThreadStatus> {
        let start = current_line(&ctx.elves.borrow(), self.program_counter()?);
        loop {
            let status = self.step_instruction(ctx, step_over_call)?;
            let stopped = match &status {
                ThreadStatus::Stopped(stopped) => stopped,
                _ => return Ok(status),
            };
            // A breakpoint or signal on the way ends the walk there.
            if stopped.trap != Some(TrapKind::SingleStep) || !stopped.stop_points.is_empty() {
                return Ok(status);
            }
            let here = current_line(&ctx.elves.borrow(), stopped.next_instruction);
            match (&start, &here) {
                (_, None) => continue,
                (None, Some(_)) => return Ok(status),
                (Some(a), Some(b)) if a != b => return Ok(status),
                _ => continue,
            }
        }
    }

    /// Step into: consume an unexecuted inlined frame as a synthetic
    /// single-step, else advance a source line and skip any prologue.
    pub fn step_in(&mut self, ctx: &ProcessContext) -> Result<ThreadStatus> {
        self.ensure_alive()?;
        if self.call_stack.num_unexecuted_inlined_functions() > 0 {
            self.call_stack.step_into_inlined();
            let pc = self.program_counter()?;
            let (source_file, source_line, function_name) =
                source_location(&ctx.elves.borrow(), pc);
            let status = StoppedStatus {
                signal: Some(Signal::SIGTRAP),
                trap: Some(TrapKind::SingleStep),
                stop_points: Vec::new(),
                syscall: None,
                next_instruction: pc,
                source_file,
                source_line,
                function_name,
            };
            self.status = ThreadStatus::Stopped(status);
            return Ok(self.status.clone());
        }
        let status = self.step_until_different_line(ctx, false)?;
        if !matches!(&status, ThreadStatus::Stopped(s) if s.trap == Some(TrapKind::SingleStep)) {
            return Ok(status);
        }
        self.step_over_function_prologue(ctx)
    }

    /// Step over: stay on this frame. Inside an unexecuted inlined range,
    /// run to the range's end instead of entering it.
    pub fn step_over(&mut self, ctx: &ProcessContext) -> Result<ThreadStatus> {
        self.ensure_alive()?;
        if self.call_stack.num_unexecuted_inlined_functions() > 0 {
            let next_inlined = self.call_stack.num_unexecuted_inlined_functions() - 1;
            if let Some(frame) = self.call_stack.frames().get(next_inlined) {
                if let Some(range) = frame.ranges.last() {
                    let high = VirtualAddress::new(range.high.as_u64());
                    return self.resume_until_address(ctx, high);
                }
            }
        }
        self.step_until_different_line(ctx, true)
    }

    /// Step out of the executing frame: an inlined frame runs to its
    /// range end; a real frame runs to the caller's pc recovered by the
    /// unwinder, falling back to the saved return address at rbp+8 when no
    /// CFI covers the pc.
    pub fn step_out(&mut self, ctx: &ProcessContext) -> Result<ThreadStatus> {
        self.ensure_alive()?;
        if let Some(frame) = self.call_stack.executing_frame() {
            if frame.is_inlined {
                if let Some(range) = frame.ranges.last() {
                    let high = VirtualAddress::new(range.high.as_u64());
                    return self.resume_until_address(ctx, high);
                }
            }
        }
        let return_address = self
            .caller_return_address()
            .map(Ok)
            .unwrap_or_else(|| -> Result<VirtualAddress> {
                let rbp = VirtualAddress::new(self.tracer.get_gprs()?.rbp);
                Ok(VirtualAddress::new(ctx.memory.read_u64(rbp + 8)?))
            })?;
        self.resume_until_address(ctx, return_address)
    }

    /// Return address of the executing real frame, from the already
    /// unwound stack.
    fn caller_return_address(&self) -> Option<VirtualAddress> {
        let frames = self.call_stack.executing_stack();
        let first_real = frames.iter().position(|f| !f.is_inlined)?;
        let caller = frames[first_real + 1..].iter().find(|f| !f.is_inlined)?;
        Some(caller.registers.program_counter())
    }

    /// Snapshot the user-visible stop state around a synthesized call.
    pub fn snapshot_for_invocation(&self) -> (ThreadStatus, CallStack) {
        (self.status.clone(), self.call_stack.clone())
    }

    /// Put back the pre-invocation stop state.
    pub fn restore_after_invocation(&mut self, status: ThreadStatus, call_stack: CallStack) {
        self.status = status;
        self.call_stack = call_stack;
    }

    /// Bring a running thread to a quiet stop with an engine-queued
    /// SIGSTOP. A stop that races in front is kept (and the SIGSTOP stays
    /// flagged for swallowing on the next resume).
    pub fn halt(&mut self, ctx: &ProcessContext) -> Result<()> {
        if !matches!(self.status, ThreadStatus::Running) {
            return Ok(());
        }
        self.pending_internal_sigstop = true;
        self.tracer.tgkill(ctx.pid, Signal::SIGSTOP)?;
        match wait_thread(self.tid())? {
            WaitStatus::Exited(_, code) => {
                self.status = ThreadStatus::Exited(code);
                Err(Error::ProcessExited {
                    pid: self.tid().as_raw(),
                })
            }
            WaitStatus::Signaled(_, signal, _) => {
                self.status = ThreadStatus::Signaled(signal);
                Err(Error::ProcessExited {
                    pid: self.tid().as_raw(),
                })
            }
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                self.pending_internal_sigstop = false;
                self.decode_stop(ctx, None, None)
            }
            WaitStatus::Stopped(_, signal) => {
                // Deliver the raced-in signal on the next resume; our
                // SIGSTOP is still queued and will be swallowed then.
                self.pending_signal = Some(signal);
                self.decode_stop(ctx, Some(signal), None)
            }
            _ => self.decode_stop(ctx, None, None),
        }
    }

    /// While pc sits inside [prologue-entry, body-entry) of the innermost
    /// function, run to the body entry.
    pub fn step_over_function_prologue(&mut self, ctx: &ProcessContext) -> Result<ThreadStatus> {
        self.ensure_alive()?;
        let pc = self.program_counter()?;
        let target = {
            let elves = ctx.elves.borrow();
            prologue_body_target(&elves, pc)
        };
        match target {
            Some(body) if body != pc => self.resume_until_address(ctx, body),
            _ => Ok(self.status.clone()),
        }
    }
}

/// Body-entry address when `pc` is inside the prologue of its innermost
/// function.
fn prologue_body_target(elves: &LoadedElves, pc: VirtualAddress) -> Option<VirtualAddress> {
    let (elf, fa) = elves.find_by_virtual_address(pc)?;
    let dwarf = elf.dwarf.as_ref()?;
    let function = dwarf.function_definition_containing(fa)?;
    let low = dwarf.die(function).ranges.low()?;
    let prologue_entry = dwarf.line_entry_at(low)?;
    let body = dwarf
        .next_line_entry(prologue_entry)
        .map(|next| dwarf.line_entry(next).address)?;
    if fa >= low && fa < body {
        Some(elf.to_virtual(body))
    } else {
        None
    }
}

fn current_line(elves: &LoadedElves, pc: VirtualAddress) -> Option<(PathBuf, u64)> {
    let (elf, fa) = elves.find_by_virtual_address(pc)?;
    let dwarf = elf.dwarf.as_ref()?;
    let entry_ref = dwarf.line_entry_at(fa)?;
    let entry = dwarf.line_entry(entry_ref);
    if entry.line == 0 {
        return None;
    }
    let path = dwarf.line_entry_path(entry_ref)?;
    Some((path, entry.line))
}

/// (file, line, function) attribution for a stop, with ELF symbols as the
/// fallback where DWARF is missing.
pub fn source_location(
    elves: &LoadedElves,
    pc: VirtualAddress,
) -> (Option<PathBuf>, Option<u64>, Option<String>) {
    let (elf, fa) = match elves.find_by_virtual_address(pc) {
        Some(found) => found,
        None => return (None, None, None),
    };
    if let Some(dwarf) = elf.dwarf.as_ref().filter(|d| d.has_units()) {
        let (path, line) = dwarf
            .line_entry_at(fa)
            .map(|entry_ref| {
                let entry = dwarf.line_entry(entry_ref);
                (dwarf.line_entry_path(entry_ref), Some(entry.line))
            })
            .unwrap_or((None, None));
        let function = dwarf
            .function_definition_containing(fa)
            .and_then(|die| dwarf.die_name(die));
        if path.is_some() || function.is_some() {
            return (path, line, function);
        }
    }
    let function = elf
        .image
        .symbol_containing(fa)
        .map(|sym| sym.demangled.clone().unwrap_or_else(|| sym.name.clone()));
    (None, None, function)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_policy_matching() {
        assert!(!SyscallCatchPolicy::Off.matches(1));
        assert!(SyscallCatchPolicy::All.matches(231));
        let set = SyscallCatchPolicy::Set(vec![0, 1]);
        assert!(set.matches(0));
        assert!(!set.matches(2));
    }

    #[test]
    fn statuses_classify_liveness() {
        assert!(ThreadStatus::Running.is_alive());
        assert!(!ThreadStatus::Exited(0).is_alive());
        assert!(!ThreadStatus::Signaled(Signal::SIGKILL).is_alive());
    }
}
