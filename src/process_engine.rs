//! Process lifecycle and cross-thread coordination: launch/attach, the
//! any-thread wait loop, clone-trap thread births, rendezvous servicing
//! and shutdown.

use crate::address::VirtualAddress;
use crate::elf::ElfImage;
use crate::error::{Error, Result};
use crate::loaded_elves::{
    executable_load_bias, LoadedElf, LoadedElves, Rendezvous,
};
use crate::memory::{Memory, VirtualMemory};
use crate::stop_point::{Resolver, StopPointId, StopPointSet};
use crate::stop_site::{
    DebugRegisterSchedule, DebugRegisterSink, StopSiteHandle, StopSiteMode, StopSitePool,
    StopSiteType, TrapKind,
};
use crate::thread_engine::{
    ProcessContext, StopDisposition, SyscallCatchPolicy, ThreadEngine, ThreadStatus,
};
use crate::tracer::{wait_any, wait_thread, Tracer};
use log::{debug, info, warn};
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Thread birth/death notifications for the CLI.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadLifeCycleEvent {
    Created(Pid),
    Exited(Pid, i32),
    Signaled(Pid, Signal),
}

pub type ThreadLifeCycleCallback = Box<dyn FnMut(ThreadLifeCycleEvent)>;

/// Mirrors the hardware stop-site schedule into every thread's debug
/// registers. The kernel keeps them per-thread.
struct ThreadRosterSink {
    tids: RefCell<Vec<Pid>>,
}

impl ThreadRosterSink {
    fn new() -> Rc<ThreadRosterSink> {
        Rc::new(ThreadRosterSink {
            tids: RefCell::new(Vec::new()),
        })
    }

    fn set_tids(&self, tids: Vec<Pid>) {
        *self.tids.borrow_mut() = tids;
    }
}

impl DebugRegisterSink for ThreadRosterSink {
    fn apply(&self, schedule: &DebugRegisterSchedule) -> Result<()> {
        for &tid in self.tids.borrow().iter() {
            apply_schedule(&Tracer::new(tid), schedule)?;
        }
        Ok(())
    }
}

fn apply_schedule(tracer: &Tracer, schedule: &DebugRegisterSchedule) -> Result<()> {
    for (i, value) in schedule.dr.iter().enumerate() {
        tracer.set_debug_register(i, *value)?;
    }
    tracer.set_debug_register(7, schedule.dr7)
}

pub struct ProcessEngine {
    ctx: ProcessContext,
    threads: BTreeMap<Pid, ThreadEngine>,
    process_group: Pid,
    owns_process: bool,
    alive: bool,
    /// Addresses whose traps drive the rendezvous protocol.
    rendezvous_addresses: Vec<VirtualAddress>,
    rendezvous: Option<Rendezvous>,
    /// Set once the notify function is known and patched.
    notify_site: Option<StopSiteHandle>,
    entry_site: Option<StopSiteHandle>,
    /// Attached mid-run without a known notify site: probe at
    /// function-symbol stops.
    probe_rendezvous_everywhere: bool,
    roster_sink: Rc<ThreadRosterSink>,
    lifecycle: Option<ThreadLifeCycleCallback>,
}

impl ProcessEngine {
    /// Fork/exec a new tracee and take it to its first stop.
    pub fn launch(path: &Path, args: &[String]) -> Result<ProcessEngine> {
        let tracer = Tracer::launch(path, args)?;
        let pid = tracer.tid();
        // The exec trap; the executable is loaded only after it so procfs
        // (auxv in particular) is fully populated.
        let initial = wait_thread(pid)?;
        tracer.set_options(true)?;
        let mut engine = ProcessEngine::bootstrap(pid, path.to_path_buf(), true)?;
        engine.finish_initial_stop(initial)?;
        Ok(engine)
    }

    /// Attach to a live process and all of its current threads.
    pub fn attach(pid: Pid) -> Result<ProcessEngine> {
        let tracer = Tracer::attach(pid)?;
        let initial = wait_thread(pid)?;
        tracer.set_options(false)?;
        let exe = std::fs::read_link(format!("/proc/{}/exe", pid))
            .map_err(|e| Error::io(format!("resolve /proc/{}/exe", pid), e))?;
        let mut engine = ProcessEngine::bootstrap(pid, exe, false)?;
        engine.attach_sibling_threads()?;
        engine.finish_initial_stop(initial)?;
        // The stop just consumed was our own attach SIGSTOP, not tracee
        // state to preserve.
        if let Some(main) = engine.threads.get_mut(&pid) {
            main.discard_pending_signal();
        }
        // The linker's state is usually consistent by now; probe eagerly
        // and fall back to guessing at function stops.
        engine.probe_rendezvous_everywhere = true;
        if let Err(e) = engine.service_rendezvous_update() {
            if !e.is_transient_rendezvous() {
                warn!("rendezvous probe at attach failed: {}", e);
            }
        }
        Ok(engine)
    }

    fn bootstrap(pid: Pid, exe_path: PathBuf, owns_process: bool) -> Result<ProcessEngine> {
        let image = ElfImage::from_file(&exe_path)?;
        let load_bias = if image.is_pie() {
            executable_load_bias(pid, &image)?
        } else {
            0
        };
        let executable = LoadedElf::new(
            exe_path.to_string_lossy().into_owned(),
            image,
            load_bias,
            true,
            false,
        );
        let entry_point = executable.entry_point();
        info!(
            "tracing {} (pid {}, bias {:#x}, entry {})",
            executable.name, pid, load_bias, entry_point
        );

        let memory: Rc<dyn Memory> = Rc::new(VirtualMemory::new(pid));
        let roster_sink = ThreadRosterSink::new();
        roster_sink.set_tids(vec![pid]);
        let pool = StopSitePool::new(memory.clone(), roster_sink.clone());
        let stop_points = Rc::new(RefCell::new(StopPointSet::new(pool.clone())));
        let elves = Rc::new(RefCell::new(LoadedElves::new(executable)));

        let process_group = nix::unistd::getpgid(Some(pid))
            .map_err(|e| Error::os(format!("getpgid of {}", pid), e))?;

        let ctx = ProcessContext {
            pid,
            memory,
            pool,
            elves,
            stop_points,
            syscall_policy: Rc::new(RefCell::new(SyscallCatchPolicy::Off)),
            pending_new_threads: RefCell::new(Vec::new()),
        };

        let mut threads = BTreeMap::new();
        threads.insert(pid, ThreadEngine::new(pid, false));

        let mut engine = ProcessEngine {
            ctx,
            threads,
            process_group,
            owns_process,
            alive: true,
            rendezvous_addresses: vec![entry_point],
            rendezvous: None,
            notify_site: None,
            entry_site: None,
            probe_rendezvous_everywhere: false,
            roster_sink,
            lifecycle: None,
        };

        // The entry-point site doubles as the first rendezvous trap: by
        // the time it fires the dynamic linker has filled in r_debug.
        let handle = engine
            .ctx
            .pool
            .borrow_mut()
            .allocate(entry_point, StopSiteType::software_breakpoint())?;
        handle.enable()?;
        engine.entry_site = Some(handle);
        Ok(engine)
    }

    fn attach_sibling_threads(&mut self) -> Result<()> {
        let tasks = std::fs::read_dir(format!("/proc/{}/task", self.ctx.pid))
            .map_err(|e| Error::io(format!("list /proc/{}/task", self.ctx.pid), e))?;
        for entry in tasks {
            let entry = entry.map_err(|e| Error::io("read task dir entry", e))?;
            let tid = match entry.file_name().to_string_lossy().parse::<i32>() {
                Ok(tid) => Pid::from_raw(tid),
                Err(_) => continue,
            };
            if tid == self.ctx.pid || self.threads.contains_key(&tid) {
                continue;
            }
            let tracer = Tracer::attach(tid)?;
            let wait = wait_thread(tid)?;
            tracer.set_options(false)?;
            let mut engine = ThreadEngine::new(tid, false);
            engine.handle_wait_status(&self.ctx, wait)?;
            engine.discard_pending_signal();
            self.threads.insert(tid, engine);
            debug!("attached sibling thread {}", tid);
        }
        self.sync_roster();
        Ok(())
    }

    fn finish_initial_stop(&mut self, initial: WaitStatus) -> Result<()> {
        let thread = self.threads.get_mut(&self.ctx.pid).expect("main thread");
        thread.handle_wait_status(&self.ctx, initial)?;
        Ok(())
    }

    fn sync_roster(&self) {
        self.roster_sink.set_tids(self.threads.keys().copied().collect());
    }

    pub fn pid(&self) -> Pid {
        self.ctx.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn context(&self) -> &ProcessContext {
        &self.ctx
    }

    pub fn thread(&self, tid: Pid) -> Option<&ThreadEngine> {
        self.threads.get(&tid)
    }

    pub fn thread_mut(&mut self, tid: Pid) -> Result<&mut ThreadEngine> {
        self.threads
            .get_mut(&tid)
            .ok_or_else(|| Error::not_found(format!("no thread {}", tid)))
    }

    pub fn list_threads(&self) -> Vec<(Pid, ThreadStatus)> {
        self.threads
            .iter()
            .map(|(tid, engine)| (*tid, engine.status().clone()))
            .collect()
    }

    pub fn watch_thread_lifecycle(&mut self, callback: ThreadLifeCycleCallback) {
        self.lifecycle = Some(callback);
    }

    fn emit(&mut self, event: ThreadLifeCycleEvent) {
        if let Some(callback) = &mut self.lifecycle {
            callback(event);
        }
    }

    pub fn set_syscall_catch_policy(&mut self, policy: SyscallCatchPolicy) {
        let off = policy.is_off();
        *self.ctx.syscall_policy.borrow_mut() = policy;
        if off {
            // Disabling between entry and exit: the next trap must not be
            // misread as a syscall return.
            for engine in self.threads.values_mut() {
                engine.clear_syscall_expectation();
            }
        }
    }

    // -- stop points ------------------------------------------------------

    pub fn add_breakpoint(&mut self, resolver: Resolver, hardware: bool) -> Result<StopPointId> {
        let elves = self.ctx.elves.borrow();
        self.ctx
            .stop_points
            .borrow_mut()
            .add_breakpoint(resolver, hardware, &elves)
    }

    pub fn add_watchpoint(
        &mut self,
        addr: VirtualAddress,
        mode: StopSiteMode,
        watch_size: usize,
    ) -> Result<StopPointId> {
        let elves = self.ctx.elves.borrow();
        self.ctx
            .stop_points
            .borrow_mut()
            .add_watchpoint(addr, mode, watch_size, &elves)
    }

    pub fn remove_stop_point(&mut self, id: StopPointId) -> Result<()> {
        self.ctx.stop_points.borrow_mut().remove(id)
    }

    pub fn enable_stop_point(&mut self, id: StopPointId) -> Result<()> {
        self.ctx.stop_points.borrow_mut().enable(id)
    }

    pub fn disable_stop_point(&mut self, id: StopPointId) -> Result<()> {
        self.ctx.stop_points.borrow_mut().disable(id)
    }

    // -- resume / wait ----------------------------------------------------

    /// Resume every stopped thread and block until a stop worth surfacing.
    pub fn resume(&mut self) -> Result<(Pid, ThreadStatus)> {
        self.ensure_alive()?;
        let tids: Vec<Pid> = self.threads.keys().copied().collect();
        for tid in tids {
            let engine = self.threads.get_mut(&tid).unwrap();
            if engine.is_stopped() {
                match engine.prepare_resume(&self.ctx) {
                    Ok(()) => {}
                    Err(Error::ProcessExited { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        self.wait_for_interesting_stop()
    }

    /// Resume just one thread; the rest stay where they are.
    pub fn resume_thread(&mut self, tid: Pid) -> Result<(Pid, ThreadStatus)> {
        self.ensure_alive()?;
        self.resume_one(tid)?;
        self.wait_for_interesting_stop()
    }

    /// prepare_resume with the context and thread borrowed from disjoint
    /// fields.
    fn resume_one(&mut self, tid: Pid) -> Result<()> {
        let ctx = &self.ctx;
        self.threads
            .get_mut(&tid)
            .ok_or_else(|| Error::not_found(format!("no thread {}", tid)))?
            .prepare_resume(ctx)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.alive {
            Ok(())
        } else {
            Err(Error::ProcessExited {
                pid: self.ctx.pid.as_raw(),
            })
        }
    }

    fn wait_for_interesting_stop(&mut self) -> Result<(Pid, ThreadStatus)> {
        loop {
            let wait = wait_any(self.process_group)?;
            let tid = match wait.pid() {
                Some(tid) => tid,
                None => continue,
            };
            if !self.threads.contains_key(&tid) {
                match wait {
                    // An attached tracee shares its process group with
                    // other children of the debugger; their deaths are
                    // not ours to handle.
                    WaitStatus::Exited(..) | WaitStatus::Signaled(..) => continue,
                    _ => {
                        // A cloned thread's first stop can outrun its
                        // parent's clone event. Adopt it; the stop in
                        // hand is its birth SIGSTOP.
                        self.adopt_thread(tid, false)?;
                        if self.apply_current_schedule(tid).is_err()
                            || self.resume_one(tid).is_err()
                        {
                            // Gone before it could be set up.
                            self.threads.remove(&tid);
                            self.sync_roster();
                        }
                        continue;
                    }
                }
            }

            let disposition = self
                .threads
                .get_mut(&tid)
                .unwrap()
                .handle_wait_status(&self.ctx, wait)?;
            self.drain_new_threads(true)?;

            match disposition {
                StopDisposition::UserVisible => {
                    if self.service_rendezvous_stop(tid)? {
                        // Pure rendezvous service trap; the user never
                        // sees it.
                        self.resume_one(tid)?;
                        continue;
                    }
                    self.halt_other_threads(tid)?;
                    let status = self.threads[&tid].status().clone();
                    return Ok((tid, status));
                }
                StopDisposition::ResumeTransparently => {
                    self.resume_one(tid)?;
                }
                StopDisposition::CloneChild(_) => {
                    // Children were adopted in the drain; parent keeps
                    // going.
                    self.resume_one(tid)?;
                }
                StopDisposition::ThreadGone => {
                    let status = self.threads[&tid].status().clone();
                    match &status {
                        ThreadStatus::Exited(code) => {
                            self.emit(ThreadLifeCycleEvent::Exited(tid, *code))
                        }
                        ThreadStatus::Signaled(signal) => {
                            self.emit(ThreadLifeCycleEvent::Signaled(tid, *signal))
                        }
                        _ => {}
                    }
                    if tid == self.ctx.pid {
                        self.alive = false;
                        return Ok((tid, status));
                    }
                    self.threads.remove(&tid);
                    self.sync_roster();
                    if self.threads.is_empty() {
                        self.alive = false;
                        return Ok((tid, status));
                    }
                }
            }
        }
    }

    /// Create the engine for a newly observed thread. With `expect_stop`,
    /// its birth SIGSTOP has not been consumed yet and must be absorbed
    /// before the thread is usable.
    fn adopt_thread(&mut self, tid: Pid, expect_stop: bool) -> Result<()> {
        debug!("thread {} joined", tid);
        self.threads.insert(tid, ThreadEngine::new(tid, expect_stop));
        self.sync_roster();
        self.emit(ThreadLifeCycleEvent::Created(tid));
        Ok(())
    }

    fn apply_current_schedule(&self, tid: Pid) -> Result<()> {
        let schedule = self.ctx.pool.borrow().debug_register_schedule();
        apply_schedule(&Tracer::new(tid), &schedule)
    }

    /// Adopt children recorded during thread operations. With
    /// `resume_children`, the tracee is running and the new threads join
    /// it; otherwise (mid-step) they stay stopped like everyone else.
    fn drain_new_threads(&mut self, resume_children: bool) -> Result<()> {
        loop {
            let next = self.ctx.pending_new_threads.borrow_mut().pop();
            let tid = match next {
                Some(tid) => tid,
                None => break,
            };
            if self.threads.contains_key(&tid) {
                continue;
            }
            self.adopt_thread(tid, true)?;
            // The birth SIGSTOP is guaranteed; absorb it now so the debug
            // registers can be mirrored while the thread is stopped.
            let engine = self.threads.get_mut(&tid).unwrap();
            let wait = wait_thread(tid)?;
            engine.handle_wait_status(&self.ctx, wait)?;
            self.apply_current_schedule(tid)?;
            if resume_children {
                self.resume_one(tid)?;
            }
        }
        Ok(())
    }

    /// Bring every other thread to a quiet stop once one thread surfaces
    /// a user-visible event, so memory and register edits are safe.
    fn halt_other_threads(&mut self, focus: Pid) -> Result<()> {
        let tids: Vec<Pid> = self.threads.keys().copied().collect();
        for tid in tids {
            if tid == focus {
                continue;
            }
            let engine = self.threads.get_mut(&tid).unwrap();
            if let Err(e) = engine.halt(&self.ctx) {
                if !matches!(e, Error::ProcessExited { .. }) {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    // -- stepping ---------------------------------------------------------

    pub fn step_instruction(&mut self, tid: Pid, step_over_call: bool) -> Result<ThreadStatus> {
        self.ensure_alive()?;
        let status = {
            let ctx = &self.ctx;
            self.threads
                .get_mut(&tid)
                .ok_or_else(|| Error::not_found(format!("no thread {}", tid)))?
                .step_instruction(ctx, step_over_call)?
        };
        self.drain_new_threads(false)?;
        self.note_thread_end(tid);
        Ok(status)
    }

    pub fn step_in(&mut self, tid: Pid) -> Result<ThreadStatus> {
        self.ensure_alive()?;
        let status = {
            let ctx = &self.ctx;
            self.threads
                .get_mut(&tid)
                .ok_or_else(|| Error::not_found(format!("no thread {}", tid)))?
                .step_in(ctx)?
        };
        self.drain_new_threads(false)?;
        self.note_thread_end(tid);
        Ok(status)
    }

    pub fn step_over(&mut self, tid: Pid) -> Result<ThreadStatus> {
        self.ensure_alive()?;
        let status = {
            let ctx = &self.ctx;
            self.threads
                .get_mut(&tid)
                .ok_or_else(|| Error::not_found(format!("no thread {}", tid)))?
                .step_over(ctx)?
        };
        self.drain_new_threads(false)?;
        self.note_thread_end(tid);
        Ok(status)
    }

    pub fn step_out(&mut self, tid: Pid) -> Result<ThreadStatus> {
        self.ensure_alive()?;
        let status = {
            let ctx = &self.ctx;
            self.threads
                .get_mut(&tid)
                .ok_or_else(|| Error::not_found(format!("no thread {}", tid)))?
                .step_out(ctx)?
        };
        self.drain_new_threads(false)?;
        self.note_thread_end(tid);
        Ok(status)
    }

    fn note_thread_end(&mut self, tid: Pid) {
        let status = match self.threads.get(&tid) {
            Some(engine) => engine.status().clone(),
            None => return,
        };
        match status {
            ThreadStatus::Exited(code) => {
                self.emit(ThreadLifeCycleEvent::Exited(tid, code));
                if tid == self.ctx.pid {
                    self.alive = false;
                } else {
                    self.threads.remove(&tid);
                    self.sync_roster();
                }
            }
            ThreadStatus::Signaled(signal) => {
                self.emit(ThreadLifeCycleEvent::Signaled(tid, signal));
                if tid == self.ctx.pid {
                    self.alive = false;
                } else {
                    self.threads.remove(&tid);
                    self.sync_roster();
                }
            }
            _ => {}
        }
    }

    // -- expressions -------------------------------------------------------

    /// Evaluate a variable expression against one stopped thread. The
    /// evaluator carries the `$N` history and is owned by the caller.
    pub fn evaluate_expression(
        &mut self,
        evaluator: &mut crate::expr::ExpressionEvaluator,
        tid: Pid,
        input: &str,
    ) -> Result<crate::typed_data::TypedData> {
        self.ensure_alive()?;
        let ctx = &self.ctx;
        let thread = self
            .threads
            .get_mut(&tid)
            .ok_or_else(|| Error::not_found(format!("no thread {}", tid)))?;
        evaluator.evaluate(ctx, thread, input)
    }

    // -- signal forwarding -------------------------------------------------

    /// Ctrl-C at the CLI boundary lands here: forward SIGINT to the
    /// tracee's process group and let the wait loop observe the stop.
    pub fn interrupt(&self) -> Result<()> {
        killpg(self.process_group, Signal::SIGINT)
            .map_err(|e| Error::os("forward SIGINT to tracee process group", e))
    }

    // -- rendezvous -------------------------------------------------------

    /// After a software stop: when the pc names a rendezvous address (or
    /// we are still hunting for the notify site after an attach), refresh
    /// the shared-library registry. Returns true when the stop existed
    /// only for the protocol and should not surface.
    fn service_rendezvous_stop(&mut self, tid: Pid) -> Result<bool> {
        let (pc, had_user_points, is_software) = match self.threads[&tid].status() {
            ThreadStatus::Stopped(stopped) => (
                stopped.next_instruction,
                !stopped.stop_points.is_empty(),
                stopped.trap == Some(TrapKind::Software),
            ),
            _ => return Ok(false),
        };
        if !is_software {
            return Ok(false);
        }

        let at_known_site = self.rendezvous_addresses.contains(&pc);
        let probing = self.probe_rendezvous_everywhere
            && self.notify_site.is_none()
            && self.pc_is_function_symbol(pc);
        if !at_known_site && !probing {
            return Ok(false);
        }

        match self.service_rendezvous_update() {
            Ok(()) => {}
            Err(e) if e.is_transient_rendezvous() => {
                debug!("rendezvous not ready yet at {}", pc);
            }
            Err(e) => warn!("rendezvous update failed: {}", e),
        }

        Ok(at_known_site && !had_user_points)
    }

    fn pc_is_function_symbol(&self, pc: VirtualAddress) -> bool {
        let elves = self.ctx.elves.borrow();
        match elves.find_by_virtual_address(pc) {
            Some((elf, fa)) => elf
                .image
                .symbol_containing(fa)
                .map(|sym| sym.address_range().map(|r| r.low == fa).unwrap_or(false))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Read r_debug + the link map, reconcile the registry, install the
    /// notify-function site on first sight and re-resolve stop points on
    /// change.
    fn service_rendezvous_update(&mut self) -> Result<()> {
        if self.rendezvous.is_none() {
            let elves = self.ctx.elves.borrow();
            self.rendezvous = Some(Rendezvous::new(elves.executable())?);
        }
        let rendezvous = self.rendezvous.as_ref().unwrap();

        let r_debug = rendezvous.read_r_debug(&*self.ctx.memory)?;
        if self.notify_site.is_none() && !r_debug.notify_address.is_null() {
            let handle = self
                .ctx
                .pool
                .borrow_mut()
                .allocate(r_debug.notify_address, StopSiteType::software_breakpoint())?;
            handle.enable()?;
            debug!("rendezvous notify site installed at {}", r_debug.notify_address);
            self.rendezvous_addresses.push(r_debug.notify_address);
            self.notify_site = Some(handle);
        }

        let entries = rendezvous.read_link_map(&*self.ctx.memory)?;
        let changed = self
            .ctx
            .elves
            .borrow_mut()
            .sync_with_link_map(&*self.ctx.memory, &entries)?;
        if changed {
            let elves = self.ctx.elves.borrow();
            self.ctx.stop_points.borrow_mut().resolve_all(&elves);
        }
        Ok(())
    }

    // -- shutdown ---------------------------------------------------------

    /// Stop if running, detach, let the process continue; kill and reap it
    /// when this engine launched it.
    pub fn close(&mut self) -> Result<()> {
        if !self.alive {
            return Ok(());
        }
        self.alive = false;

        let mut first_error: Option<Error> = None;
        let mut note = |r: Result<()>| {
            if let Err(e) = r {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        };

        let tids: Vec<Pid> = self.threads.keys().copied().collect();
        for tid in tids.iter() {
            if let Some(engine) = self.threads.get_mut(tid) {
                if !engine.is_stopped() {
                    note(engine.halt(&self.ctx));
                }
            }
        }

        // Restore every patched byte before letting go of the process.
        note(self.ctx.pool.borrow_mut().disable_all());

        for tid in tids {
            if let Some(engine) = self.threads.get(&tid) {
                if engine.status().is_alive() {
                    note(engine.tracer().detach(None));
                }
            }
        }
        let _ = kill(self.ctx.pid, Signal::SIGCONT);

        if self.owns_process {
            let _ = kill(self.ctx.pid, Signal::SIGKILL);
            let _ = waitpid(self.ctx.pid, Some(WaitPidFlag::__WALL));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        if self.alive {
            if let Err(e) = self.close() {
                warn!("shutdown of pid {} was incomplete: {}", self.ctx.pid, e);
            }
        }
    }
}
