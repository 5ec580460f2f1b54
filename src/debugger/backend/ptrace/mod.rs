//! Native Linux debugging with the ptrace API: int3 breakpoints, line stepping over
//! DWARF line tables, CFI based unwinding. Variables are out of reach, only registers,
//! memory and function symbols can be inspected.
mod breakpoint;
mod process;
mod register;
mod symbols;
mod tracee;

use crate::debugger::backend::ptrace::breakpoint::{Sites, Temporary, UserBreakpoint};
use crate::debugger::backend::ptrace::process::Child;
use crate::debugger::backend::ptrace::register::{Register, RegisterMap};
use crate::debugger::backend::ptrace::symbols::{FrameRegs, Modules};
use crate::debugger::backend::ptrace::tracee::{
    read_memory_by_pid, wait_thread, write_memory_by_pid, ThreadStop, TraceeCtl, QUIET_SIGNALS,
    SI_KERNEL, TRAP_BRKPT, TRAP_TRACE,
};
use crate::debugger::backend::{
    AttachMode, Backend, BackendVariant, Capabilities, FrameRef, InstallRequest, Target,
};
use crate::debugger::breakpoint::{BreakpointId, BreakpointRequest};
use crate::debugger::command::{ResumeCommand, StepKind};
use crate::debugger::config::PtraceSection;
use crate::debugger::error::Error;
use crate::debugger::error::Error::{Ptrace, Waitpid};
use crate::debugger::event::{DebugEvent, StopReason};
use crate::debugger::location::{Frame, Location};
use crate::debugger::register::RegisterSet;
use crate::debugger::thread::{ThreadId, ThreadInfo};
use crate::debugger::variable::value::{RawValue, Variable};
use crate::{muted_error, weak_error};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::libc::c_void;
use nix::sys;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use os_pipe::PipeReader;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use std::{fs, io};

const POLL_TICK: Duration = Duration::from_millis(5);
const MAX_FRAMES: u32 = 128;
/// Instructions a single line step may execute before giving up.
const MAX_LINE_STEPS: usize = 1_000_000;

/// How a single instruction step ended.
#[derive(Copy, Clone, Debug, PartialEq)]
enum StepOutcome {
    Done,
    Signal(Signal),
    /// The thread is about to exit.
    Exiting,
    Exited(i32),
}

fn thread_id(tid: Pid) -> ThreadId {
    ThreadId(tid.as_raw() as u64)
}

fn frame_regs(regs: &RegisterMap) -> FrameRegs {
    FrameRegs {
        pc: regs.pc(),
        sp: regs.sp(),
        fp: regs.fp(),
    }
}

fn read_word(tid: Pid, addr: u64) -> Option<u64> {
    sys::ptrace::read(tid, addr as *mut c_void)
        .ok()
        .map(|word| word as u64)
}

/// Traced debuggee.
struct Process {
    pid: Pid,
    external: bool,
    tracees: TraceeCtl,
    modules: Modules,
    sites: Sites,
    /// Debuggee threads were resumed and no stop was reported since.
    running: bool,
    /// Stopped right after start, no stop reported yet.
    held: bool,
    interrupt_requested: bool,
    last_stop: Option<Pid>,
    exited: bool,
}

impl Process {
    /// Thread for memory access: ptrace requests need a stopped tracee.
    fn access_tid(&self) -> Pid {
        self.tracees.stopped_one().unwrap_or(self.pid)
    }

    fn tid(&self, thread: ThreadId) -> Result<Pid, Error> {
        let tid = Pid::from_raw(thread.0 as i32);
        if self.tracees.contains(tid) {
            Ok(tid)
        } else {
            Err(Error::NotFound(format!("thread {thread}")))
        }
    }

    fn regs(&self, tid: Pid) -> Result<RegisterMap, Error> {
        RegisterMap::current(tid).map_err(Ptrace)
    }

    fn frame_regs(&self, tid: Pid) -> Result<FrameRegs, Error> {
        Ok(frame_regs(&self.regs(tid)?))
    }

    /// Canonical frame address, stack pointer before the call when there is no unwind info.
    fn frame_id(&self, regs: &FrameRegs) -> u64 {
        self.modules
            .module_at(regs.pc)
            .and_then(|m| {
                m.info
                    .as_deref()
                    .and_then(|info| info.cfa(m.to_global(regs.pc), regs))
            })
            .unwrap_or(regs.sp + 8)
    }

    /// Registers of the caller, `level` is the level of the frame described by `regs`.
    fn caller(&self, tid: Pid, regs: &FrameRegs, level: u32) -> Option<FrameRegs> {
        let lookup = if level == 0 { regs.pc } else { regs.pc.checked_sub(1)? };
        let mut read = |addr: u64| read_word(tid, addr);

        if let Some(module) = self.modules.module_at(regs.pc) {
            if let Some(info) = module.info.as_deref() {
                let global = module.to_global(lookup);
                if info.cfa(global, regs).is_some() {
                    return info.caller(global, regs, &mut read);
                }
            }
        }

        // no unwind info, walk the frame pointer chain
        if regs.fp == 0 {
            return None;
        }
        Some(FrameRegs {
            pc: read(regs.fp + 8)?,
            sp: regs.fp + 16,
            fp: read(regs.fp)?,
        })
    }

    /// Registers of the frame at `level`.
    fn unwind_to(&self, tid: Pid, level: u32) -> Result<FrameRegs, Error> {
        let mut regs = self.frame_regs(tid)?;
        for current in 0..level {
            regs = self
                .caller(tid, &regs, current)
                .ok_or_else(|| Error::NotFound(format!("frame #{level}")))?;
        }
        Ok(regs)
    }

    /// Source line of a runtime address.
    fn line_at(&self, pc: u64) -> Option<(PathBuf, u64)> {
        let module = self.modules.module_at(pc)?;
        let info = module.info.as_deref()?;
        let row = info.lines.row_for(module.to_global(pc))?;
        if row.line == 0 {
            return None;
        }
        Some((info.lines.file(row)?.to_path_buf(), row.line))
    }

    /// Source line starting exactly at a runtime address.
    fn line_starting_at(&self, pc: u64) -> Option<(PathBuf, u64)> {
        let module = self.modules.module_at(pc)?;
        let info = module.info.as_deref()?;
        let row = info.lines.row_starting_at(module.to_global(pc))?;
        if row.line == 0 {
            return None;
        }
        Some((info.lines.file(row)?.to_path_buf(), row.line))
    }

    /// First statement after the prologue of the function containing `pc`.
    fn prologue_end(&self, pc: u64) -> Option<u64> {
        let module = self.modules.module_at(pc)?;
        let info = module.info.as_deref()?;
        let function = info.function_at(module.to_global(pc))?;
        info.lines
            .prologue_end(function.address, function.address + function.size)
            .map(|addr| module.to_relocated(addr))
    }

    /// Runtime address for a breakpoint request, with the location it ends up at.
    fn resolve(&self, request: &BreakpointRequest) -> Result<(u64, Location), Error> {
        let found = match request {
            BreakpointRequest::Function(name) => self.modules.with_info().find_map(|(m, info)| {
                let function = info.find_function(name)?;
                let global = info
                    .lines
                    .prologue_end(function.address, function.address + function.size)
                    .unwrap_or(function.address);
                Some(m.to_relocated(global))
            }),
            BreakpointRequest::Line { file, line } => {
                self.modules.with_info().find_map(|(m, info)| {
                    let (global, _, _) = info.lines.resolve(file, *line)?;
                    Some(m.to_relocated(global))
                })
            }
            BreakpointRequest::Address(addr) => self.modules.module_at(*addr).map(|_| *addr),
        };

        match found {
            Some(addr) => Ok((addr, self.modules.location(addr, 0))),
            None => Err(Error::SymbolUnavailable {
                what: request.to_string(),
                message: "no code found in loaded modules".to_string(),
            }),
        }
    }

    /// Count a hit for user breakpoints at a site, returns the first one that stops.
    fn user_hit(&mut self, addr: u64) -> Option<BreakpointId> {
        let site = self.sites.get_mut(addr)?;
        let mut hit = None;
        for user in site.users.iter_mut() {
            if user.ignore > 0 {
                user.ignore -= 1;
            } else if hit.is_none() {
                hit = Some(user.id);
            }
        }
        hit
    }

    /// Temporary breakpoint at `addr` matches the current frame.
    fn temporary_hit(&self, tid: Pid, addr: u64) -> Result<bool, Error> {
        let Some(temporary) = self.sites.get(addr).and_then(|s| s.temporary) else {
            return Ok(false);
        };
        let Some(expected) = temporary.cfa else {
            return Ok(true);
        };
        let regs = self.frame_regs(tid)?;
        Ok(self.frame_id(&regs) >= expected)
    }

    /// Move pc back on the int3 that trapped, returns the site address.
    fn rewind(&self, tid: Pid) -> Result<Option<u64>, Error> {
        let mut regs = self.regs(tid)?;
        let addr = regs.pc().wrapping_sub(1);
        if self.sites.get(addr).is_none() {
            return Ok(None);
        }
        regs.update(Register::Rip, addr);
        regs.persist(tid).map_err(Ptrace)?;
        Ok(Some(addr))
    }

    fn thread_gone(&mut self, tid: Pid, code: i32, events: &mut VecDeque<DebugEvent>) {
        self.tracees.remove(tid);
        if tid == self.pid || self.tracees.is_empty() {
            info!(target: "ptrace", "process {} exited with code {code}", self.pid);
            self.exited = true;
            self.running = false;
            self.sites.forget();
            events.push_back(DebugEvent::Exited { code });
        } else {
            events.push_back(DebugEvent::ThreadExited {
                thread: thread_id(tid),
            });
        }
    }

    /// Execute one instruction of `tid`, other threads stay where they are.
    fn single_step(
        &mut self,
        tid: Pid,
        events: &mut VecDeque<DebugEvent>,
    ) -> Result<StepOutcome, Error> {
        let pc = self.regs(tid)?.pc();
        let tracees = &mut self.tracees;
        self.sites.lifted(tid, pc, || {
            let mut signal = None;
            loop {
                sys::ptrace::step(tid, signal.take()).map_err(Ptrace)?;
                let Some(stop) = wait_thread(tid, true)? else {
                    continue;
                };
                match stop {
                    ThreadStop::Trap(_) => return Ok(StepOutcome::Done),
                    ThreadStop::Cloned(new) => {
                        tracees.add_running(new);
                        events.push_back(DebugEvent::ThreadCreated {
                            thread: thread_id(new),
                        });
                    }
                    ThreadStop::Signal(sig) if QUIET_SIGNALS.contains(&sig) => signal = Some(sig),
                    ThreadStop::Signal(sig) => return Ok(StepOutcome::Signal(sig)),
                    ThreadStop::Exiting => return Ok(StepOutcome::Exiting),
                    ThreadStop::Exited(code) => return Ok(StepOutcome::Exited(code)),
                    ThreadStop::EventStop | ThreadStop::Other => {}
                }
            }
        })
    }

    /// Finish a step that did not complete, returns true if it did.
    fn settle(
        &mut self,
        tid: Pid,
        outcome: StepOutcome,
        events: &mut VecDeque<DebugEvent>,
    ) -> Result<bool, Error> {
        match outcome {
            StepOutcome::Done => return Ok(true),
            StepOutcome::Signal(signal) => {
                if signal != Signal::SIGSTOP {
                    self.tracees.set_pending_signal(tid, signal);
                }
                self.report_stop(tid, StopReason::Signal(signal.to_string()), events)?;
            }
            StepOutcome::Exiting => {
                self.sites.clear_temporary(tid).map_err(Ptrace)?;
                self.tracees.cont_stopped()?;
                self.running = true;
            }
            StepOutcome::Exited(code) => {
                self.thread_gone(tid, code, events);
                if !self.exited {
                    self.tracees.cont_stopped()?;
                    self.running = true;
                }
            }
        }
        Ok(false)
    }

    /// Interrupt every running thread and wait until it stops.
    fn stop_all(&mut self, events: &mut VecDeque<DebugEvent>) -> Result<(), Error> {
        loop {
            let running = self.tracees.running();
            if running.is_empty() || self.exited {
                return Ok(());
            }
            for tid in &running {
                match sys::ptrace::interrupt(*tid) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => return Err(Ptrace(e)),
                }
            }
            for tid in running {
                let Some(stop) = wait_thread(tid, true)? else {
                    continue;
                };
                match stop {
                    ThreadStop::Exited(code) => {
                        self.thread_gone(tid, code, events);
                        continue;
                    }
                    ThreadStop::Trap(code) if code == TRAP_BRKPT || code == SI_KERNEL => {
                        // hit reported again on the next resume
                        self.rewind(tid)?;
                    }
                    ThreadStop::Signal(signal)
                        if signal != Signal::SIGSTOP && !QUIET_SIGNALS.contains(&signal) =>
                    {
                        self.tracees.set_pending_signal(tid, signal);
                    }
                    ThreadStop::Cloned(new) => {
                        self.tracees.add_running(new);
                        events.push_back(DebugEvent::ThreadCreated {
                            thread: thread_id(new),
                        });
                    }
                    _ => {}
                }
                self.tracees.set_stopped(tid);
            }
        }
    }

    /// Stop the whole debuggee and report the stop of `tid`.
    fn report_stop(
        &mut self,
        tid: Pid,
        reason: StopReason,
        events: &mut VecDeque<DebugEvent>,
    ) -> Result<(), Error> {
        self.tracees.set_stopped(tid);
        self.stop_all(events)?;
        if self.exited {
            return Ok(());
        }
        self.sites.clear_temporary(tid).map_err(Ptrace)?;
        self.running = false;
        self.interrupt_requested = false;
        self.last_stop = Some(tid);

        let changes = weak_error!(self.modules.refresh(self.pid), "refresh modules:")
            .unwrap_or_default();
        let pc = self.regs(tid)?.pc();
        debug!(target: "ptrace", "thread {tid} stopped at {pc:#x}: {reason}");
        events.push_back(DebugEvent::Stopped {
            thread: thread_id(tid),
            reason,
            location: self.modules.location(pc, 0),
        });
        for name in changes.loaded {
            events.push_back(DebugEvent::ModuleLoaded { name });
        }
        for name in changes.unloaded {
            events.push_back(DebugEvent::ModuleUnloaded { name });
        }
        Ok(())
    }

    fn on_site_hit(
        &mut self,
        tid: Pid,
        addr: u64,
        events: &mut VecDeque<DebugEvent>,
    ) -> Result<(), Error> {
        let temporary = self.temporary_hit(tid, addr)?;
        if let Some(id) = self.user_hit(addr) {
            return self.report_stop(tid, StopReason::Breakpoint(id), events);
        }
        if temporary {
            return self.report_stop(tid, StopReason::Step, events);
        }

        // ignored hit or a temporary breakpoint of another frame
        let outcome = self.single_step(tid, events)?;
        if self.settle(tid, outcome, events)? {
            self.tracees.cont(tid)?;
        }
        Ok(())
    }

    fn on_stop(
        &mut self,
        tid: Pid,
        stop: ThreadStop,
        events: &mut VecDeque<DebugEvent>,
    ) -> Result<(), Error> {
        match stop {
            ThreadStop::Exited(code) => self.thread_gone(tid, code, events),
            ThreadStop::Cloned(new) => {
                self.tracees.add_running(new);
                events.push_back(DebugEvent::ThreadCreated {
                    thread: thread_id(new),
                });
                self.tracees.set_stopped(tid);
                self.tracees.cont(tid)?;
            }
            ThreadStop::EventStop => {
                if !self.tracees.contains(tid) {
                    self.tracees.add_running(tid);
                }
                self.tracees.set_stopped(tid);
                if self.interrupt_requested {
                    self.report_stop(tid, StopReason::Interrupted, events)?;
                } else {
                    self.tracees.cont(tid)?;
                }
            }
            ThreadStop::Trap(code) if code == TRAP_BRKPT || code == SI_KERNEL => {
                self.tracees.set_stopped(tid);
                match self.rewind(tid)? {
                    Some(addr) => self.on_site_hit(tid, addr, events)?,
                    None => {
                        let reason = StopReason::Signal(Signal::SIGTRAP.to_string());
                        self.report_stop(tid, reason, events)?;
                    }
                }
            }
            ThreadStop::Trap(TRAP_TRACE) => {
                self.report_stop(tid, StopReason::Step, events)?;
            }
            ThreadStop::Signal(signal) if QUIET_SIGNALS.contains(&signal) => {
                self.tracees.set_stopped(tid);
                self.tracees.set_pending_signal(tid, signal);
                self.tracees.cont(tid)?;
            }
            ThreadStop::Signal(signal) => {
                if signal != Signal::SIGSTOP {
                    self.tracees.set_pending_signal(tid, signal);
                }
                self.report_stop(tid, StopReason::Signal(signal.to_string()), events)?;
            }
            ThreadStop::Trap(_) | ThreadStop::Exiting | ThreadStop::Other => {
                self.tracees.set_stopped(tid);
                self.tracees.cont(tid)?;
            }
        }
        Ok(())
    }

    /// Collect stops of running threads without blocking.
    fn poll(&mut self, events: &mut VecDeque<DebugEvent>) -> Result<(), Error> {
        for tid in self.tracees.running() {
            if self.exited {
                break;
            }
            if let Some(stop) = wait_thread(tid, false)? {
                self.on_stop(tid, stop, events)?;
                if !events.is_empty() {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Step a thread off a breakpoint site under its pc. False when the step ended the stop.
    fn leave_site(
        &mut self,
        tid: Pid,
        events: &mut VecDeque<DebugEvent>,
    ) -> Result<bool, Error> {
        let pc = self.regs(tid)?.pc();
        if self.sites.get(pc).is_none() {
            return Ok(true);
        }
        let outcome = self.single_step(tid, events)?;
        self.settle(tid, outcome, events)
    }

    fn continue_all(&mut self, tid: Pid, events: &mut VecDeque<DebugEvent>) -> Result<(), Error> {
        let mut leave = vec![tid];
        leave.extend(self.last_stop.filter(|t| *t != tid && self.tracees.contains(*t)));
        for t in leave {
            if !self.leave_site(t, events)? {
                return Ok(());
            }
        }
        self.tracees.cont_stopped()?;
        self.running = true;
        Ok(())
    }

    /// Run only `tid` until it reaches `addr` in a frame not deeper than `frame`.
    /// False when another stop ended the run.
    fn run_to_in_thread(
        &mut self,
        tid: Pid,
        addr: u64,
        frame: Option<u64>,
        events: &mut VecDeque<DebugEvent>,
    ) -> Result<bool, Error> {
        self.sites
            .set_temporary(tid, addr, Temporary { cfa: frame })
            .map_err(Ptrace)?;
        loop {
            if !self.leave_site(tid, events)? {
                return Ok(false);
            }
            self.tracees.cont(tid)?;
            let stop = loop {
                if let Some(stop) = wait_thread(tid, true)? {
                    break stop;
                }
            };
            self.tracees.set_stopped(tid);

            match stop {
                ThreadStop::Trap(code) if code == TRAP_BRKPT || code == SI_KERNEL => {
                    let Some(at) = self.rewind(tid)? else {
                        let reason = StopReason::Signal(Signal::SIGTRAP.to_string());
                        self.report_stop(tid, reason, events)?;
                        return Ok(false);
                    };
                    if at == addr && self.temporary_hit(tid, at)? {
                        self.sites.clear_temporary(tid).map_err(Ptrace)?;
                        return Ok(true);
                    }
                    if let Some(id) = self.user_hit(at) {
                        self.report_stop(tid, StopReason::Breakpoint(id), events)?;
                        return Ok(false);
                    }
                }
                ThreadStop::Cloned(new) => {
                    self.tracees.add_running(new);
                    events.push_back(DebugEvent::ThreadCreated {
                        thread: thread_id(new),
                    });
                }
                ThreadStop::Signal(signal) if QUIET_SIGNALS.contains(&signal) => {
                    self.tracees.set_pending_signal(tid, signal);
                }
                ThreadStop::Signal(signal) => {
                    let outcome = StepOutcome::Signal(signal);
                    self.settle(tid, outcome, events)?;
                    return Ok(false);
                }
                ThreadStop::Exiting => {
                    self.settle(tid, StepOutcome::Exiting, events)?;
                    return Ok(false);
                }
                ThreadStop::Exited(code) => {
                    self.settle(tid, StepOutcome::Exited(code), events)?;
                    return Ok(false);
                }
                ThreadStop::Trap(_) | ThreadStop::EventStop | ThreadStop::Other => {}
            }
        }
    }

    fn step_instruction(
        &mut self,
        tid: Pid,
        events: &mut VecDeque<DebugEvent>,
    ) -> Result<(), Error> {
        events.push_back(DebugEvent::Running);
        let outcome = self.single_step(tid, events)?;
        if self.settle(tid, outcome, events)? {
            self.report_stop(tid, StopReason::Step, events)?;
        }
        Ok(())
    }

    /// Step to the beginning of another source line. Calls are stepped over unless `into`
    /// is set and the callee has line information.
    fn step_line(
        &mut self,
        tid: Pid,
        into: bool,
        events: &mut VecDeque<DebugEvent>,
    ) -> Result<(), Error> {
        let regs = self.frame_regs(tid)?;
        let Some(mut line) = self.line_at(regs.pc) else {
            // no line information, leave the function instead
            return self.step_out(tid, events);
        };
        let mut frame = self.frame_id(&regs);
        events.push_back(DebugEvent::Running);

        for _ in 0..MAX_LINE_STEPS {
            let outcome = self.single_step(tid, events)?;
            if !self.settle(tid, outcome, events)? {
                return Ok(());
            }

            let regs = self.frame_regs(tid)?;
            let cfa = self.frame_id(&regs);
            if cfa < frame {
                if into && self.line_at(regs.pc).is_some() {
                    if let Some(body) = self.prologue_end(regs.pc).filter(|a| *a != regs.pc) {
                        if !self.run_to_in_thread(tid, body, Some(cfa), events)? {
                            return Ok(());
                        }
                    }
                    return self.report_stop(tid, StopReason::Step, events);
                }
                // first instruction of the callee: return address on top of the stack
                let Some(ret) = read_word(tid, cfa - 8) else {
                    return self.report_stop(tid, StopReason::Step, events);
                };
                if !self.run_to_in_thread(tid, ret, Some(frame), events)? {
                    return Ok(());
                }
                continue;
            }
            if cfa > frame {
                // returned into the caller, finish its current line
                frame = cfa;
                match self.line_at(regs.pc) {
                    Some(caller_line) => line = caller_line,
                    None => return self.report_stop(tid, StopReason::Step, events),
                }
                continue;
            }
            if let Some(new_line) = self.line_starting_at(regs.pc) {
                if new_line != line {
                    return self.report_stop(tid, StopReason::Step, events);
                }
            }
        }
        warn!(target: "ptrace", "line step of {tid} gave up after {MAX_LINE_STEPS} instructions");
        self.report_stop(tid, StopReason::Step, events)
    }

    fn step_out(&mut self, tid: Pid, events: &mut VecDeque<DebugEvent>) -> Result<(), Error> {
        let regs = self.frame_regs(tid)?;
        let caller = self.caller(tid, &regs, 0).ok_or_else(|| Error::NotSupported {
            command: "finish",
            reason: "outermost frame".to_string(),
        })?;
        let frame = self.frame_id(&caller);
        self.sites
            .set_temporary(tid, caller.pc, Temporary { cfa: Some(frame) })
            .map_err(Ptrace)?;
        events.push_back(DebugEvent::Running);
        self.continue_all(tid, events)
    }

    fn run_to(
        &mut self,
        tid: Pid,
        request: &BreakpointRequest,
        events: &mut VecDeque<DebugEvent>,
    ) -> Result<(), Error> {
        let (addr, _) = self.resolve(request)?;
        self.sites
            .set_temporary(tid, addr, Temporary { cfa: None })
            .map_err(Ptrace)?;
        events.push_back(DebugEvent::Running);
        self.continue_all(tid, events)
    }

    /// Pop the current frame without executing the rest of it.
    fn return_from_frame(
        &mut self,
        tid: Pid,
        events: &mut VecDeque<DebugEvent>,
    ) -> Result<(), Error> {
        let mut regs = self.regs(tid)?;
        let caller = self
            .caller(tid, &frame_regs(&regs), 0)
            .ok_or_else(|| Error::NotSupported {
                command: "return",
                reason: "outermost frame".to_string(),
            })?;
        regs.update(Register::Rip, caller.pc);
        regs.update(Register::Rsp, caller.sp);
        regs.update(Register::Rbp, caller.fp);
        regs.persist(tid).map_err(Ptrace)?;
        events.push_back(DebugEvent::Running);
        self.report_stop(tid, StopReason::Step, events)
    }

    fn terminate(&mut self) -> Result<(), Error> {
        if self.exited {
            return Ok(());
        }
        self.exited = true;

        if self.external {
            let mut events = VecDeque::new();
            self.stop_all(&mut events)?;
            let tid = self.access_tid();
            weak_error!(self.sites.disable_all(tid), "restore breakpoint sites:");
            for tid in self.tracees.tids() {
                muted_error!(sys::ptrace::detach(tid, None), "detach:");
            }
            info!(target: "ptrace", "detached from process {}", self.pid);
            return Ok(());
        }

        match sys::signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(Error::Syscall("kill", e)),
        }
        // reap every thread, the leader goes last
        for _ in 0..1024 {
            match waitpid(self.pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
                Ok(_) => {}
                Err(Errno::ECHILD) => break,
                Err(e) => return Err(Waitpid(e)),
            }
        }
        info!(target: "ptrace", "process {} killed", self.pid);
        Ok(())
    }
}

/// Forward lines written by the debuggee into `tx`.
fn forward(reader: PipeReader, tx: Sender<String>) -> io::Result<()> {
    thread::Builder::new()
        .name("mdbg-ptrace-output".to_string())
        .spawn(move || {
            for line in BufReader::new(reader).lines() {
                let Ok(line) = line else {
                    break;
                };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(())
}

/// Backend driving a Linux process with ptrace.
pub struct PtraceBackend {
    config: PtraceSection,
    process: Option<Process>,
    events: VecDeque<DebugEvent>,
    output: Option<Receiver<String>>,
}

impl PtraceBackend {
    pub fn new(config: &PtraceSection) -> Self {
        Self {
            config: config.clone(),
            process: None,
            events: VecDeque::new(),
            output: None,
        }
    }

    fn process(&mut self) -> Result<&mut Process, Error> {
        live(&mut self.process)
    }

    fn stopped_process(&mut self, command: &'static str) -> Result<&mut Process, Error> {
        stopped(&mut self.process, command)
    }
}

fn live(process: &mut Option<Process>) -> Result<&mut Process, Error> {
    match process.as_mut() {
        Some(process) if !process.exited => Ok(process),
        _ => Err(Error::NotFound("debuggee process".to_string())),
    }
}

/// Stopped process, ptrace requests need the tracee in a stop.
fn stopped<'a>(
    process: &'a mut Option<Process>,
    command: &'static str,
) -> Result<&'a mut Process, Error> {
    let process = live(process)?;
    if process.running {
        return Err(Error::NotSupported {
            command,
            reason: "debuggee is running".to_string(),
        });
    }
    Ok(process)
}

impl Backend for PtraceBackend {
    fn variant(&self) -> BackendVariant {
        BackendVariant::Ptrace
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            live_breakpoints: false,
            memory: true,
            registers: true,
            locals: false,
            attach_process: true,
            attach_core: false,
            resumable: true,
        }
    }

    fn connection_target(&self) -> String {
        "ptrace".to_string()
    }

    fn start(&mut self, mode: &AttachMode, target: &Target) -> Result<(), Error> {
        let child = match mode {
            AttachMode::Launch => {
                let (out_reader, out_writer) = os_pipe::pipe()?;
                let (err_reader, err_writer) = os_pipe::pipe()?;
                let (tx, rx) = mpsc::channel();
                forward(out_reader, tx.clone())?;
                forward(err_reader, tx)?;
                self.output = Some(rx);
                Child::new(target).install(out_writer, err_writer, self.config.disable_aslr)?
            }
            AttachMode::AttachToProcess(pid) => Child::from_external(Pid::from_raw(*pid as i32))?,
            AttachMode::AttachToCore(_) | AttachMode::AttachToRemote => {
                return Err(Error::NotSupported {
                    command: "start",
                    reason: format!("{mode:?} is not available with ptrace"),
                })
            }
        };

        let pid = child.pid();
        let main = fs::read_link(format!("/proc/{pid}/exe"))
            .unwrap_or_else(|_| child.program().clone());
        let mut modules = Modules::new(main);
        weak_error!(modules.refresh(pid), "read memory map:");
        info!(
            target: "ptrace",
            "{} process {pid}: {}",
            if child.is_external() { "attached to" } else { "started" },
            child.program().display()
        );

        self.process = Some(Process {
            pid,
            external: child.is_external(),
            tracees: TraceeCtl::new(pid, child.threads()),
            modules,
            sites: Sites::default(),
            running: false,
            held: true,
            interrupt_requested: false,
            last_stop: None,
            exited: false,
        });
        self.events.push_back(DebugEvent::Ready {
            process: pid.as_raw() as u64,
        });
        Ok(())
    }

    fn next_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            if let Some(line) = self.output.as_ref().and_then(|rx| rx.try_recv().ok()) {
                return Ok(Some(DebugEvent::Output(line)));
            }
            if let Some(process) = self.process.as_mut() {
                if process.running && !process.exited {
                    process.poll(&mut self.events)?;
                    if !self.events.is_empty() {
                        continue;
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let tick = (deadline - now).min(POLL_TICK);
            match self.output.as_ref().map(|rx| rx.recv_timeout(tick)) {
                Some(Ok(line)) => return Ok(Some(DebugEvent::Output(line))),
                Some(Err(RecvTimeoutError::Timeout)) => {}
                Some(Err(RecvTimeoutError::Disconnected)) => self.output = None,
                None => thread::sleep(tick),
            }
        }
    }

    fn resume(&mut self, thread: ThreadId, command: &ResumeCommand) -> Result<(), Error> {
        let process = stopped(&mut self.process, "resume")?;
        let tid = process
            .tid(thread)
            .or_else(|_| process.last_stop.ok_or(Error::NotFound(format!("thread {thread}"))))?;
        process.held = false;
        debug!(target: "ptrace", "resume thread {tid}: {command}");

        let events = &mut self.events;
        match command {
            ResumeCommand::Continue => {
                events.push_back(DebugEvent::Running);
                process.continue_all(tid, events)
            }
            ResumeCommand::Step(StepKind::Instruction) => process.step_instruction(tid, events),
            ResumeCommand::Step(StepKind::Over) => process.step_line(tid, false, events),
            ResumeCommand::Step(StepKind::Into) => process.step_line(tid, true, events),
            ResumeCommand::Step(StepKind::Out) => process.step_out(tid, events),
            ResumeCommand::RunToLine { file, line } => {
                let request = BreakpointRequest::Line {
                    file: file.clone(),
                    line: *line,
                };
                process.run_to(tid, &request, events)
            }
            ResumeCommand::RunToFunction(function) => {
                let request = BreakpointRequest::Function(function.clone());
                process.run_to(tid, &request, events)
            }
            ResumeCommand::ReturnFromFrame => process.return_from_frame(tid, events),
        }
    }

    fn interrupt(&mut self) -> Result<(), Error> {
        let Some(process) = self.process.as_mut().filter(|p| !p.exited) else {
            return Ok(());
        };
        if process.held || !process.running {
            process.held = false;
            let tid = process.last_stop.unwrap_or(process.pid);
            return process.report_stop(tid, StopReason::Interrupted, &mut self.events);
        }

        process.interrupt_requested = true;
        let Some(tid) = process.tracees.running().first().copied() else {
            return Ok(());
        };
        match sys::ptrace::interrupt(tid) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Ptrace(e)),
        }
    }

    fn terminate(&mut self) -> Result<(), Error> {
        self.events.clear();
        match self.process.take() {
            Some(mut process) => process.terminate(),
            None => Ok(()),
        }
    }

    fn insert_breakpoint(&mut self, request: &InstallRequest) -> Result<Location, Error> {
        if request.condition.is_some() {
            return Err(Error::BackendRejected {
                command: format!("break {}", request.request),
                message: "breakpoint conditions need a variable evaluator".to_string(),
            });
        }
        let process = self.stopped_process("break")?;
        if process.modules.with_info().next().is_none() {
            let pid = process.pid;
            weak_error!(process.modules.refresh(pid), "read memory map:");
        }
        let (addr, location) = process.resolve(&request.request)?;
        let user = UserBreakpoint {
            id: request.id,
            ignore: request.ignore_count,
        };
        let tid = process.access_tid();
        process.sites.add_user(tid, addr, user).map_err(Ptrace)?;
        debug!(target: "ptrace", "breakpoint {} set at {addr:#x}", request.id);
        Ok(location)
    }

    fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error> {
        let process = self.stopped_process("delete")?;
        let tid = process.access_tid();
        process.sites.remove_user(tid, id).map_err(Ptrace)
    }

    fn threads(&mut self) -> Result<Vec<ThreadInfo>, Error> {
        let process = self.process()?;
        let pid = process.pid;
        Ok(process
            .tracees
            .tids()
            .into_iter()
            .map(|tid| {
                let comm = fs::read_to_string(format!("/proc/{pid}/task/{tid}/comm"))
                    .map(|name| name.trim().to_string())
                    .unwrap_or_else(|_| "thread".to_string());
                ThreadInfo {
                    id: thread_id(tid),
                    label: format!("{comm} (LWP {tid})"),
                }
            })
            .collect())
    }

    fn frames(&mut self, thread: ThreadId) -> Result<Vec<Frame>, Error> {
        let process = self.stopped_process("backtrace")?;
        let tid = process.tid(thread)?;
        let mut regs = process.frame_regs(tid)?;
        let mut frames = vec![];
        for level in 0..MAX_FRAMES {
            let lookup = if level == 0 { 0 } else { 1 };
            frames.push(Frame {
                level,
                location: process.modules.location(regs.pc, lookup),
            });
            let Some(caller) = process.caller(tid, &regs, level) else {
                break;
            };
            if caller.pc == 0 || caller.sp <= regs.sp {
                break;
            }
            regs = caller;
        }
        Ok(frames)
    }

    fn registers(&mut self, thread: ThreadId) -> Result<RegisterSet, Error> {
        let process = self.stopped_process("registers")?;
        let tid = process.tid(thread)?;
        Ok(RegisterSet::from(&process.regs(tid)?))
    }

    fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>, Error> {
        let process = self.stopped_process("memory")?;
        let tid = process.access_tid();
        let mut data = read_memory_by_pid(tid, address, len).map_err(Ptrace)?;
        process.sites.unpatch(address, &mut data);
        Ok(data)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let process = self.stopped_process("memory")?;
        let mut data = data.to_vec();
        process.sites.repatch(address, &mut data);
        write_memory_by_pid(process.access_tid(), address, &data).map_err(Ptrace)
    }

    fn locals(&mut self, _frame: FrameRef) -> Result<Vec<Variable>, Error> {
        Err(Error::NotSupported {
            command: "locals",
            reason: "ptrace backend reads no variable information".to_string(),
        })
    }

    fn evaluate(&mut self, frame: FrameRef, expression: &str) -> Result<Variable, Error> {
        let process = self.stopped_process("evaluate")?;
        let expression = expression.trim();

        if let Some(name) = expression.strip_prefix('$') {
            let register = Register::from_str(name).map_err(|_| Error::SymbolUnavailable {
                what: expression.to_string(),
                message: "unknown register".to_string(),
            })?;
            let tid = process.tid(frame.thread)?;
            let value = if frame.level == 0 {
                process.regs(tid)?.value(register)
            } else {
                let regs = process.unwind_to(tid, frame.level)?;
                match register {
                    Register::Rip => regs.pc,
                    Register::Rsp => regs.sp,
                    Register::Rbp => regs.fp,
                    _ => {
                        return Err(Error::SymbolUnavailable {
                            what: expression.to_string(),
                            message: format!("not recovered in frame #{}", frame.level),
                        })
                    }
                }
            };
            return Ok(Variable::new(
                name,
                expression,
                "u64",
                RawValue::UInt(value),
            ));
        }

        let function = process.modules.with_info().find_map(|(m, info)| {
            info.find_function(expression)
                .map(|f| (f.name.clone(), m.to_relocated(f.address)))
        });
        match function {
            Some((name, addr)) => Ok(Variable::new(
                expression,
                expression,
                format!("fn {name}"),
                RawValue::Pointer(addr),
            )),
            None => Err(Error::SymbolUnavailable {
                what: expression.to_string(),
                message: "only registers and function symbols are known".to_string(),
            }),
        }
    }

    fn children(&mut self, _frame: FrameRef, parent: &Variable) -> Result<Vec<Variable>, Error> {
        Err(Error::NotSupported {
            command: "expand",
            reason: format!("`{}` has no members known to ptrace backend", parent.name),
        })
    }
}

impl Drop for PtraceBackend {
    fn drop(&mut self) {
        muted_error!(self.terminate(), "terminate ptrace debuggee:");
    }
}

