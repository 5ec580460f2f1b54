//! Detached session over a snapshot: everything is answered from the captured copy.
use crate::debugger::backend::{
    AttachMode, Backend, BackendVariant, Capabilities, FrameRef, InstallRequest, Target,
};
use crate::debugger::breakpoint::BreakpointId;
use crate::debugger::command::ResumeCommand;
use crate::debugger::error::Error;
use crate::debugger::event::{DebugEvent, StopReason};
use crate::debugger::location::{Frame, Location};
use crate::debugger::register::RegisterSet;
use crate::debugger::snapshot::{LocalsRecord, Snapshot, ThreadRecord};
use crate::debugger::thread::{ThreadId, ThreadInfo};
use crate::debugger::variable::value::Variable;
use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

pub struct ReplayBackend {
    snapshot: Snapshot,
    events: VecDeque<DebugEvent>,
}

fn not_resumable(command: &'static str) -> Error {
    Error::NotSupported {
        command,
        reason: "snapshot sessions cannot be resumed or modified".to_string(),
    }
}

fn not_captured(what: impl Into<String>) -> Error {
    Error::SymbolUnavailable {
        what: what.into(),
        message: "not captured in the snapshot".to_string(),
    }
}

impl ReplayBackend {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            events: VecDeque::new(),
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    fn current_thread(&self) -> Option<&ThreadRecord> {
        let current = self.snapshot.header.current_thread;
        self.snapshot
            .threads
            .iter()
            .find(|t| Some(t.thread) == current || t.is_current)
            .or_else(|| self.snapshot.threads.first())
    }

    fn thread(&self, thread: ThreadId) -> Result<&ThreadRecord, Error> {
        self.snapshot
            .threads
            .iter()
            .find(|t| t.thread == thread)
            .ok_or_else(|| Error::NotFound(format!("thread {thread}")))
    }

    fn locals_record(&self, frame: FrameRef) -> Result<&LocalsRecord, Error> {
        self.snapshot
            .locals
            .iter()
            .find(|l| l.thread == frame.thread && l.frame == frame.level)
            .ok_or_else(|| not_captured(format!("locals of frame #{}", frame.level)))
    }
}

impl Backend for ReplayBackend {
    fn variant(&self) -> BackendVariant {
        BackendVariant::Replay
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            live_breakpoints: false,
            memory: true,
            registers: true,
            locals: true,
            attach_process: false,
            attach_core: false,
            resumable: false,
        }
    }

    fn connection_target(&self) -> String {
        format!("snapshot of session {}", self.snapshot.header.session_id)
    }

    fn start(&mut self, _mode: &AttachMode, _target: &Target) -> Result<(), Error> {
        self.events.push_back(DebugEvent::Ready { process: 0 });
        let (thread, location) = match self.current_thread() {
            Some(t) => (
                t.thread,
                t.frames
                    .first()
                    .map(|f| f.location.clone())
                    .unwrap_or_default(),
            ),
            None => (ThreadId(0), Location::default()),
        };
        self.events.push_back(DebugEvent::Stopped {
            thread,
            reason: StopReason::Snapshot,
            location,
        });
        Ok(())
    }

    fn next_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>, Error> {
        if self.events.is_empty() {
            thread::sleep(timeout.min(Duration::from_millis(10)));
        }
        Ok(self.events.pop_front())
    }

    fn resume(&mut self, _: ThreadId, _: &ResumeCommand) -> Result<(), Error> {
        Err(not_resumable("resume"))
    }

    fn interrupt(&mut self) -> Result<(), Error> {
        Err(not_resumable("interrupt"))
    }

    fn terminate(&mut self) -> Result<(), Error> {
        self.events.clear();
        Ok(())
    }

    fn insert_breakpoint(&mut self, _: &InstallRequest) -> Result<Location, Error> {
        Err(not_resumable("insert-breakpoint"))
    }

    fn remove_breakpoint(&mut self, _: BreakpointId) -> Result<(), Error> {
        Ok(())
    }

    fn threads(&mut self) -> Result<Vec<ThreadInfo>, Error> {
        Ok(self
            .snapshot
            .threads
            .iter()
            .map(|t| ThreadInfo {
                id: t.thread,
                label: t.label.clone(),
            })
            .collect())
    }

    fn frames(&mut self, thread: ThreadId) -> Result<Vec<Frame>, Error> {
        Ok(self.thread(thread)?.frames.clone())
    }

    fn registers(&mut self, thread: ThreadId) -> Result<RegisterSet, Error> {
        Ok(self.thread(thread)?.registers.clone())
    }

    fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>, Error> {
        self.snapshot
            .read_memory(address, len)
            .ok_or_else(|| not_captured(format!("memory at {address:#x} ({len} bytes)")))
    }

    fn write_memory(&mut self, _: u64, _: &[u8]) -> Result<(), Error> {
        Err(not_resumable("write-memory"))
    }

    fn locals(&mut self, frame: FrameRef) -> Result<Vec<Variable>, Error> {
        Ok(self.locals_record(frame)?.variables.clone())
    }

    fn evaluate(&mut self, frame: FrameRef, expression: &str) -> Result<Variable, Error> {
        let record = self.locals_record(frame)?;
        record
            .evaluated
            .iter()
            .chain(record.variables.iter())
            .chain(record.expanded.values().flatten())
            .find(|v| v.expression == expression)
            .cloned()
            .ok_or_else(|| not_captured(format!("`{expression}`")))
    }

    fn children(&mut self, frame: FrameRef, parent: &Variable) -> Result<Vec<Variable>, Error> {
        self.locals_record(frame)?
            .expanded
            .get(&parent.expression)
            .cloned()
            .ok_or_else(|| not_captured(format!("children of `{}`", parent.expression)))
    }

    /// Nothing is ever evaluated, captured values are only looked up.
    fn may_have_side_effects(&self, _: &str) -> bool {
        false
    }
}
