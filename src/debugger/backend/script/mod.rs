//! Interpreted backend: a script program plays the debuggee, no real process exists.
mod interp;
mod parser;

pub use interp::{Value, CODE_BASE, MEMORY_SIZE};
pub use parser::parse_program;

use crate::debugger::backend::script::interp::{Effect, Machine};
use crate::debugger::backend::script::parser::{parse_expr, Expr};
use crate::debugger::backend::{
    may_have_side_effects_with, AttachMode, Backend, BackendVariant, Capabilities, FrameRef,
    InstallRequest, Target,
};
use crate::debugger::breakpoint::{BreakpointId, BreakpointRequest};
use crate::debugger::command::{ResumeCommand, StepKind};
use crate::debugger::config::ScriptSection;
use crate::debugger::error::Error;
use crate::debugger::event::{DebugEvent, StopReason};
use crate::debugger::location::{Frame, Location};
use crate::debugger::register::RegisterSet;
use crate::debugger::thread::{ThreadId, ThreadInfo};
use crate::debugger::variable::value::Variable;
use indexmap::IndexMap;
use log::{debug, warn};
use std::collections::VecDeque;
use std::fs;
use std::thread;
use std::time::Duration;

/// Instructions executed per `next_event` call.
const SLICE: usize = 4096;
const IDLE_TICK: Duration = Duration::from_millis(5);

const PURE_BUILTINS: &[&str] = &["ptr", "len", "peek"];

#[derive(Clone, Debug, PartialEq)]
enum Goal {
    Continue,
    Over {
        thread: ThreadId,
        line: Option<u64>,
        depth: usize,
    },
    Into {
        thread: ThreadId,
        line: Option<u64>,
        depth: usize,
    },
    Out {
        thread: ThreadId,
        depth: usize,
    },
    Instruction {
        thread: ThreadId,
        done: bool,
    },
    Address(u64),
}

#[derive(Clone, Debug, PartialEq)]
enum RunState {
    NotStarted,
    /// Program loaded, nothing executed yet.
    Held,
    Stopped,
    Running(Goal),
    Exited,
}

struct ScriptBreakpoint {
    address: u64,
    condition: Option<Expr>,
    ignore_left: u32,
}

pub struct ScriptBackend {
    max_steps: u64,
    machine: Option<Machine>,
    state: RunState,
    events: VecDeque<DebugEvent>,
    breakpoints: IndexMap<BreakpointId, ScriptBreakpoint>,
    /// Next thread index for round-robin scheduling.
    cursor: usize,
    /// Thread that stopped last or was scheduled last.
    current: ThreadId,
    /// Breakpoint check skipped once for this thread at this address (the resume position).
    skip: Option<(ThreadId, u64)>,
    /// Something executed since the last resume.
    moved: bool,
    executed: u64,
}

impl ScriptBackend {
    pub fn new(config: &ScriptSection) -> Self {
        Self {
            max_steps: config.max_steps,
            machine: None,
            state: RunState::NotStarted,
            events: VecDeque::new(),
            breakpoints: IndexMap::new(),
            cursor: 0,
            current: ThreadId(1),
            skip: None,
            moved: false,
            executed: 0,
        }
    }

    fn machine(&self, command: &str) -> Result<&Machine, Error> {
        self.machine.as_ref().ok_or_else(|| Error::BackendRejected {
            command: command.to_string(),
            message: "no program is loaded".to_string(),
        })
    }

    fn machine_mut(&mut self, command: &str) -> Result<&mut Machine, Error> {
        self.machine.as_mut().ok_or_else(|| Error::BackendRejected {
            command: command.to_string(),
            message: "no program is loaded".to_string(),
        })
    }

    fn thread_index(&self, command: &str, thread: ThreadId) -> Result<usize, Error> {
        self.machine(command)?
            .thread_index(thread)
            .ok_or_else(|| Error::NotFound(format!("thread {thread}")))
    }

    fn stop(&mut self, thread: ThreadId, reason: StopReason) {
        let location = self
            .machine
            .as_ref()
            .and_then(|m| m.thread_index(thread).map(|t| m.location(t)))
            .unwrap_or_default();
        debug!(target: "script", "thread {thread} stopped at {location} ({reason})");
        self.state = RunState::Stopped;
        self.current = thread;
        self.events.push_back(DebugEvent::Stopped {
            thread,
            reason,
            location,
        });
    }

    fn resolve(&self, request: &BreakpointRequest) -> Result<(u64, Location), Error> {
        let machine = self.machine("break")?;
        match request {
            BreakpointRequest::Function(name) => machine.resolve_function(name),
            BreakpointRequest::Line { file, line } => machine.resolve_line(file, *line),
            BreakpointRequest::Address(addr) => machine.resolve_address(*addr),
        }
    }

    fn goal_reached(&self, machine: &Machine, t: usize, tid: ThreadId, goal: &Goal) -> bool {
        let line = machine.line(t);
        let depth = machine.depth(t);
        match goal {
            Goal::Continue => false,
            Goal::Address(address) => self.moved && machine.pc(t) == Some(*address),
            Goal::Over {
                thread,
                line: from,
                depth: from_depth,
            } => {
                *thread == tid
                    && line.is_some()
                    && depth <= *from_depth
                    && (depth < *from_depth || line != *from)
            }
            Goal::Into {
                thread,
                line: from,
                depth: from_depth,
            } => *thread == tid && line.is_some() && (line != *from || depth != *from_depth),
            Goal::Out {
                thread,
                depth: from_depth,
            } => *thread == tid && line.is_some() && depth < *from_depth,
            Goal::Instruction { thread, done } => *thread == tid && *done,
        }
    }

    /// Breakpoint that fires for a thread about to execute `address`.
    fn breakpoint_hit(&mut self, t: usize, address: u64) -> Option<BreakpointId> {
        let machine = self.machine.as_ref()?;
        for (id, bp) in self.breakpoints.iter_mut() {
            if bp.address != address {
                continue;
            }
            if let Some(cond) = &bp.condition {
                match machine.evaluate(t, 0, cond) {
                    Ok(v) if v == Value::Bool(false) || v == Value::Nil || v == Value::Int(0) => {
                        continue
                    }
                    Ok(_) => {}
                    Err(e) => warn!(target: "script", "breakpoint {id} condition: {e}"),
                }
            }
            if bp.ignore_left > 0 {
                bp.ignore_left -= 1;
                continue;
            }
            return Some(*id);
        }
        None
    }

    /// Queue events of executed effects. Returns `true` when the module set changed.
    fn apply_effects(&mut self, effects: Vec<Effect>) -> bool {
        let mut modules_changed = false;
        for effect in effects {
            let event = match effect {
                Effect::Output(line) => DebugEvent::Output(line),
                Effect::ModuleLoaded(name) => {
                    modules_changed = true;
                    DebugEvent::ModuleLoaded { name }
                }
                Effect::ModuleUnloaded(name) => {
                    modules_changed = true;
                    DebugEvent::ModuleUnloaded { name }
                }
                Effect::ThreadCreated(thread) => DebugEvent::ThreadCreated { thread },
                Effect::ThreadExited(thread) => DebugEvent::ThreadExited { thread },
                Effect::Exited(code) => {
                    self.state = RunState::Exited;
                    DebugEvent::Exited { code }
                }
            };
            self.events.push_back(event);
        }
        modules_changed
    }

    /// Run up to [`SLICE`] instructions of the running program.
    fn run_slice(&mut self) {
        for _ in 0..SLICE {
            let RunState::Running(goal) = self.state.clone() else {
                return;
            };
            let Some(machine) = self.machine.as_ref() else {
                return;
            };
            if machine.is_finished() || machine.threads().is_empty() {
                return;
            }

            let t = self.cursor % machine.threads().len();
            self.cursor = t + 1;
            let tid = machine.threads()[t].id;
            self.current = tid;

            // the stepping thread is gone, nothing left to step
            let goal = match goal {
                Goal::Over { thread, .. }
                | Goal::Into { thread, .. }
                | Goal::Out { thread, .. }
                | Goal::Instruction { thread, .. }
                    if machine.thread_index(thread).is_none() =>
                {
                    self.state = RunState::Running(Goal::Continue);
                    Goal::Continue
                }
                goal => goal,
            };

            if self.goal_reached(machine, t, tid, &goal) {
                self.stop(tid, StopReason::Step);
                return;
            }

            let pc = machine.pc(t);
            if let Some(pc) = pc {
                if self.skip == Some((tid, pc)) {
                    self.skip = None;
                } else if let Some(id) = self.breakpoint_hit(t, pc) {
                    self.stop(tid, StopReason::Breakpoint(id));
                    return;
                }
            }

            let Some(machine) = self.machine.as_mut() else {
                return;
            };
            let modules_changed = match machine.step(t) {
                Ok(effects) => self.apply_effects(effects),
                Err(e) => {
                    warn!(target: "script", "thread {tid}: {e}");
                    self.events.push_back(DebugEvent::Output(e.to_string()));
                    self.stop(tid, StopReason::Signal("runtime error".to_string()));
                    return;
                }
            };

            self.moved = true;
            self.executed += 1;
            if let RunState::Running(Goal::Instruction { thread, done }) = &mut self.state {
                if *thread == tid {
                    *done = true;
                }
            }
            if self.executed >= self.max_steps && self.state != RunState::Exited {
                self.executed = 0;
                self.stop(tid, StopReason::Signal("step limit exceeded".to_string()));
                return;
            }
            // pending breakpoints of a loaded module are installed before its code runs
            if modules_changed || !matches!(self.state, RunState::Running(_)) {
                return;
            }
        }
    }

    fn child_expression(parent: &str, suffix: &str) -> String {
        let simple = parent
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '[' | ']'));
        if simple {
            format!("{parent}{suffix}")
        } else {
            format!("({parent}){suffix}")
        }
    }
}

impl Backend for ScriptBackend {
    fn variant(&self) -> BackendVariant {
        BackendVariant::Script
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            live_breakpoints: true,
            memory: true,
            registers: true,
            locals: true,
            attach_process: false,
            attach_core: false,
            resumable: true,
        }
    }

    fn connection_target(&self) -> String {
        "script interpreter".to_string()
    }

    fn start(&mut self, mode: &AttachMode, target: &Target) -> Result<(), Error> {
        if *mode != AttachMode::Launch {
            return Err(Error::NotSupported {
                command: "start",
                reason: "script programs can only be launched".to_string(),
            });
        }
        let source = fs::read_to_string(&target.program)?;
        let program = parse_program(&source)?;
        let machine = Machine::new(&program, &target.program)?;
        debug!(
            target: "script",
            "program {} loaded, {} functions",
            target.program.display(),
            program.functions.len()
        );

        self.machine = Some(machine);
        self.state = RunState::Held;
        self.current = ThreadId(1);
        self.events.push_back(DebugEvent::Ready { process: 1 });
        Ok(())
    }

    fn next_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>, Error> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        if matches!(self.state, RunState::Running(_)) {
            self.run_slice();
        } else {
            thread::sleep(timeout.min(IDLE_TICK));
        }
        Ok(self.events.pop_front())
    }

    fn resume(&mut self, thread: ThreadId, command: &ResumeCommand) -> Result<(), Error> {
        if !matches!(self.state, RunState::Held | RunState::Stopped) {
            return Err(Error::BackendRejected {
                command: command.to_string(),
                message: "program is not stopped".to_string(),
            });
        }
        let t = self.thread_index("resume", thread)?;
        let machine = self.machine("resume")?;
        let line = machine.line(t);
        let depth = machine.depth(t);

        let goal = match command {
            ResumeCommand::Continue => Goal::Continue,
            ResumeCommand::Step(StepKind::Over) => Goal::Over {
                thread,
                line,
                depth,
            },
            ResumeCommand::Step(StepKind::Into) => Goal::Into {
                thread,
                line,
                depth,
            },
            ResumeCommand::Step(StepKind::Out) => Goal::Out { thread, depth },
            ResumeCommand::Step(StepKind::Instruction) => Goal::Instruction {
                thread,
                done: false,
            },
            ResumeCommand::RunToLine { file, line } => {
                Goal::Address(machine.resolve_line(file, *line)?.0)
            }
            ResumeCommand::RunToFunction(function) => {
                Goal::Address(machine.resolve_function(function)?.0)
            }
            ResumeCommand::ReturnFromFrame => {
                self.machine_mut("return")?.pop_frame(t)?;
                self.events.push_back(DebugEvent::Running);
                self.stop(thread, StopReason::Step);
                return Ok(());
            }
        };

        self.skip = machine.pc(t).map(|pc| (thread, pc));
        self.moved = false;
        self.cursor = t;
        self.current = thread;
        self.state = RunState::Running(goal);
        self.events.push_back(DebugEvent::Running);
        Ok(())
    }

    fn interrupt(&mut self) -> Result<(), Error> {
        match self.state {
            RunState::Held | RunState::Running(_) => {
                let current = self.current;
                let thread = match self.machine.as_ref() {
                    Some(m) if m.thread_index(current).is_some() => current,
                    Some(m) => m.threads().first().map(|t| t.id).unwrap_or(current),
                    None => current,
                };
                self.stop(thread, StopReason::Interrupted);
                Ok(())
            }
            RunState::Stopped => Ok(()),
            RunState::NotStarted | RunState::Exited => Err(Error::BackendRejected {
                command: "interrupt".to_string(),
                message: "program is not running".to_string(),
            }),
        }
    }

    fn terminate(&mut self) -> Result<(), Error> {
        self.machine = None;
        self.state = RunState::Exited;
        self.events.clear();
        self.breakpoints.clear();
        Ok(())
    }

    fn insert_breakpoint(&mut self, request: &InstallRequest) -> Result<Location, Error> {
        let (address, location) = self.resolve(&request.request)?;
        let condition = request
            .condition
            .as_deref()
            .map(|c| {
                parse_expr(c).map_err(|e| Error::BackendRejected {
                    command: format!("break if {c}"),
                    message: e.to_string(),
                })
            })
            .transpose()?;
        self.breakpoints.insert(
            request.id,
            ScriptBreakpoint {
                address,
                condition,
                ignore_left: request.ignore_count,
            },
        );
        Ok(location)
    }

    fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error> {
        self.breakpoints
            .shift_remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("breakpoint {id}")))
    }

    fn threads(&mut self) -> Result<Vec<ThreadInfo>, Error> {
        Ok(self
            .machine("threads")?
            .threads()
            .iter()
            .map(|t| ThreadInfo {
                id: t.id,
                label: t.label.clone(),
            })
            .collect())
    }

    fn frames(&mut self, thread: ThreadId) -> Result<Vec<Frame>, Error> {
        let t = self.thread_index("frames", thread)?;
        Ok(self.machine("frames")?.frames(t))
    }

    fn registers(&mut self, thread: ThreadId) -> Result<RegisterSet, Error> {
        let t = self.thread_index("registers", thread)?;
        let machine = self.machine("registers")?;
        Ok([
            ("pc".to_string(), machine.pc(t).unwrap_or_default()),
            ("sp".to_string(), machine.depth(t) as u64),
            ("line".to_string(), machine.line(t).unwrap_or_default()),
        ]
        .into_iter()
        .collect())
    }

    fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>, Error> {
        self.machine("read memory")?.read_memory(address, len)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        self.machine_mut("write memory")?.write_memory(address, data)
    }

    fn locals(&mut self, frame: FrameRef) -> Result<Vec<Variable>, Error> {
        let t = self.thread_index("locals", frame.thread)?;
        self.machine("locals")?.locals(t, frame.level)
    }

    fn evaluate(&mut self, frame: FrameRef, expression: &str) -> Result<Variable, Error> {
        let t = self.thread_index("evaluate", frame.thread)?;
        let expr = parse_expr(expression).map_err(|e| Error::BackendRejected {
            command: format!("evaluate {expression}"),
            message: e.to_string(),
        })?;
        let value = self.machine("evaluate")?.evaluate(t, frame.level, &expr)?;
        Ok(value.to_variable(expression, expression))
    }

    fn children(&mut self, frame: FrameRef, parent: &Variable) -> Result<Vec<Variable>, Error> {
        let t = self.thread_index("children", frame.thread)?;
        let expr = parse_expr(&parent.expression)?;
        let value = self.machine("children")?.evaluate(t, frame.level, &expr)?;

        let children = match value {
            Value::List(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let suffix = format!("[{i}]");
                    v.to_variable(&suffix, &Self::child_expression(&parent.expression, &suffix))
                })
                .collect(),
            Value::Record(fields) => fields
                .iter()
                .map(|(name, v)| {
                    let suffix = format!(".{name}");
                    v.to_variable(name, &Self::child_expression(&parent.expression, &suffix))
                })
                .collect(),
            Value::Pointer { address, .. } if address != 0 => {
                let expression = Self::child_expression(&parent.expression, "[0]");
                let byte = self.machine("children")?.read_memory(address, 1)?;
                let value = Value::Int(byte.first().copied().unwrap_or_default() as i64);
                vec![value.to_variable("[0]", &expression)]
            }
            _ => vec![],
        };
        Ok(children)
    }

    fn may_have_side_effects(&self, expression: &str) -> bool {
        may_have_side_effects_with(expression, PURE_BUILTINS)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    const PROGRAM: &str = r#"fn add(a, b) {
    let s = a + b
    return s
}

fn main() {
    let x = 1
    let y = add(x, 2)

    print y
    let z = y * 2
    return 0
}
"#;

    fn write_program(source: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("mdbg-script-{}.mds", uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(source.as_bytes()).unwrap();
        path
    }

    fn started(source: &str) -> (ScriptBackend, PathBuf) {
        let path = write_program(source);
        let mut backend = ScriptBackend::new(&ScriptSection::default());
        backend
            .start(&AttachMode::Launch, &Target::new(&path))
            .unwrap();
        assert_eq!(
            backend.next_event(Duration::ZERO).unwrap(),
            Some(DebugEvent::Ready { process: 1 })
        );
        (backend, path)
    }

    /// Pull events until a stop or exit.
    fn until_stop(backend: &mut ScriptBackend) -> Vec<DebugEvent> {
        let mut events = vec![];
        for _ in 0..1000 {
            if let Some(event) = backend.next_event(Duration::ZERO).unwrap() {
                let last = matches!(event, DebugEvent::Stopped { .. } | DebugEvent::Exited { .. });
                events.push(event);
                if last {
                    return events;
                }
            }
        }
        panic!("program did not stop: {events:?}");
    }

    fn stopped_line(events: &[DebugEvent]) -> Option<u64> {
        match events.last() {
            Some(DebugEvent::Stopped { location, .. }) => location.line,
            _ => None,
        }
    }

    #[test]
    fn test_breakpoint_and_steps() {
        let (mut backend, path) = started(PROGRAM);
        let loc = backend
            .insert_breakpoint(&InstallRequest {
                id: BreakpointId(1),
                request: BreakpointRequest::Line {
                    file: path.clone(),
                    line: 9,
                },
                condition: None,
                ignore_count: 0,
            })
            .unwrap();
        // empty line snaps to the next one with code
        assert_eq!(loc.line, Some(10));

        backend.resume(ThreadId(1), &ResumeCommand::Continue).unwrap();
        let events = until_stop(&mut backend);
        assert_eq!(events[0], DebugEvent::Running);
        assert!(matches!(
            events.last(),
            Some(DebugEvent::Stopped {
                reason: StopReason::Breakpoint(BreakpointId(1)),
                ..
            })
        ));
        assert_eq!(stopped_line(&events), Some(10));

        backend
            .resume(ThreadId(1), &ResumeCommand::Step(StepKind::Over))
            .unwrap();
        let events = until_stop(&mut backend);
        assert!(events.contains(&DebugEvent::Output("3".to_string())));
        assert_eq!(stopped_line(&events), Some(11));

        let frame = FrameRef {
            thread: ThreadId(1),
            level: 0,
        };
        let y = backend.evaluate(frame, "y").unwrap();
        assert_eq!(y.value, crate::debugger::variable::value::RawValue::Int(3));

        backend.resume(ThreadId(1), &ResumeCommand::Continue).unwrap();
        let events = until_stop(&mut backend);
        assert_eq!(events.last(), Some(&DebugEvent::Exited { code: 0 }));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_module_load_ends_slice() {
        let source = r#"module "libmath" {
    fn square(x) {
        return x * x
    }
}

fn main() {
    load "libmath"
    let b = square(2)
    return b
}
"#;
        let (mut backend, path) = started(source);
        let square = InstallRequest {
            id: BreakpointId(1),
            request: BreakpointRequest::Function("square".to_string()),
            condition: None,
            ignore_count: 0,
        };
        assert!(backend.insert_breakpoint(&square).is_err());

        backend.resume(ThreadId(1), &ResumeCommand::Continue).unwrap();
        let mut loaded = false;
        for _ in 0..1000 {
            match backend.next_event(Duration::ZERO).unwrap() {
                Some(DebugEvent::ModuleLoaded { name }) => {
                    assert_eq!(name, "libmath");
                    loaded = true;
                    break;
                }
                Some(DebugEvent::Exited { .. }) => panic!("module code ran before the load event"),
                _ => {}
            }
        }
        assert!(loaded);

        // the module's code has not run yet
        let loc = backend.insert_breakpoint(&square).unwrap();
        assert_eq!(loc.line, Some(3));
        let events = until_stop(&mut backend);
        assert!(matches!(
            events.last(),
            Some(DebugEvent::Stopped {
                reason: StopReason::Breakpoint(BreakpointId(1)),
                ..
            })
        ));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_step_into_and_out() {
        let (mut backend, path) = started(PROGRAM);
        backend.interrupt().unwrap();
        let events = until_stop(&mut backend);
        assert_eq!(stopped_line(&events), Some(7));

        let step = |backend: &mut ScriptBackend, kind| {
            backend
                .resume(ThreadId(1), &ResumeCommand::Step(kind))
                .unwrap();
            stopped_line(&until_stop(backend))
        };
        assert_eq!(step(&mut backend, StepKind::Into), Some(8));
        assert_eq!(step(&mut backend, StepKind::Into), Some(2));
        let frames = backend.frames(ThreadId(1)).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].location.function.as_deref(), Some("add"));

        assert_eq!(step(&mut backend, StepKind::Out), Some(10));
        assert_eq!(backend.frames(ThreadId(1)).unwrap().len(), 1);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_conditional_breakpoint_and_ignore_count() {
        let source = r#"fn main() {
    let i = 0
    while i < 10 {
        i = i + 1
    }
}
"#;
        let (mut backend, path) = started(source);
        backend
            .insert_breakpoint(&InstallRequest {
                id: BreakpointId(1),
                request: BreakpointRequest::Line {
                    file: path.clone(),
                    line: 4,
                },
                condition: Some("i >= 5".to_string()),
                ignore_count: 1,
            })
            .unwrap();
        backend.resume(ThreadId(1), &ResumeCommand::Continue).unwrap();
        until_stop(&mut backend);

        let frame = FrameRef {
            thread: ThreadId(1),
            level: 0,
        };
        let i = backend.evaluate(frame, "i").unwrap();
        assert_eq!(i.value, crate::debugger::variable::value::RawValue::Int(6));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_children_and_memory() {
        let source = r#"fn main() {
    poke 32, "abc"
    let p = {name: "pt", xs: [1, 2], s: ptr("char*", 32)}
    return 0
}
"#;
        let (mut backend, path) = started(source);
        backend
            .resume(
                ThreadId(1),
                &ResumeCommand::RunToLine {
                    file: path.clone(),
                    line: 4,
                },
            )
            .unwrap();
        assert_eq!(stopped_line(&until_stop(&mut backend)), Some(4));

        let frame = FrameRef {
            thread: ThreadId(1),
            level: 0,
        };
        let locals = backend.locals(frame).unwrap();
        assert_eq!(locals.len(), 1);
        let children = backend.children(frame, &locals[0]).unwrap();
        let names: Vec<_> = children.iter().map(|c| c.expression.as_str()).collect();
        assert_eq!(names, vec!["p.name", "p.xs", "p.s"]);
        assert_eq!(children[2].type_name, "char*");

        let xs = backend.children(frame, &children[1]).unwrap();
        assert_eq!(xs[1].expression, "p.xs[1]");
        assert_eq!(backend.read_memory(32, 4).unwrap(), b"abc\0".to_vec());
        assert!(backend.read_memory(MEMORY_SIZE as u64, 1).is_err());

        assert!(!backend.may_have_side_effects("len(p.xs)"));
        assert!(backend.may_have_side_effects("reset(p)"));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_launch_only() {
        let mut backend = ScriptBackend::new(&ScriptSection::default());
        let err = backend
            .start(&AttachMode::AttachToProcess(1), &Target::new("x.mds"))
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));
    }
}
