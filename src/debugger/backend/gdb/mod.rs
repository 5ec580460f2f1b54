//! Native debugger driven over its machine interface (MI2), spoken through the child's pipes.
pub mod mi;

use crate::debugger::backend::gdb::mi::{
    parse_record, parse_u64, quote, AsyncKind, Record, ResultClass, StreamKind, Tuple, Value,
};
use crate::debugger::backend::{
    AttachMode, Backend, BackendVariant, Capabilities, FrameRef, InstallRequest, RetryPolicy,
    Target, TimeoutArbiter, TimeoutDecision,
};
use crate::debugger::breakpoint::{BreakpointId, BreakpointRequest};
use crate::debugger::command::{ResumeCommand, StepKind};
use crate::debugger::config::GdbSection;
use crate::debugger::error::Error;
use crate::debugger::event::{DebugEvent, StopReason};
use crate::debugger::location::{Frame, Location};
use crate::debugger::register::RegisterSet;
use crate::debugger::thread::{ThreadId, ThreadInfo};
use crate::debugger::transport::{is_timeout, PipeTransport, Transport};
use crate::debugger::variable::value::{RawValue, Variable};
use crate::muted_error;
use itertools::Itertools;
use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// How many times the timeout arbiter may extend one command.
const MAX_TIMEOUT_EXTENSIONS: u32 = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    /// No debuggee.
    Idle,
    /// Debuggee requested, the first stop is its entry point.
    Starting,
    Live,
    /// Core file, nothing can run.
    PostMortem,
}

pub struct GdbBackend {
    config: GdbSection,
    transport: Option<PipeTransport>,
    buffer: Vec<u8>,
    next_token: u64,
    events: VecDeque<DebugEvent>,
    phase: Phase,
    /// Entry stop not reported yet: the debuggee is held there.
    held: Option<(ThreadId, Location)>,
    pid: Option<u64>,
    attached: bool,
    interrupt_requested: bool,
    numbers: HashMap<BreakpointId, u64>,
    by_number: HashMap<u64, BreakpointId>,
    register_names: Vec<String>,
    /// Variable objects by expression, valid until the next resume.
    varobjs: HashMap<String, String>,
    arbiter: Option<TimeoutArbiter>,
}

fn not_connected() -> Error {
    Error::BackendRejected {
        command: "gdb".to_string(),
        message: "debugger is not running".to_string(),
    }
}

/// Location from an MI frame or breakpoint tuple.
fn location_of(t: &Tuple) -> Location {
    Location {
        function: t
            .str("func")
            .filter(|f| *f != "??")
            .map(ToString::to_string),
        file: t
            .str("fullname")
            .or_else(|| t.str("file"))
            .map(PathBuf::from),
        line: t.u64("line"),
        address: t.u64("addr"),
    }
}

/// Backend value string to a raw value.
fn parse_value(type_name: &str, text: &str, children: Option<usize>) -> RawValue {
    if children.is_some_and(|c| c > 0) {
        let summary = (text != "{...}" && !text.is_empty()).then(|| text.to_string());
        return RawValue::Aggregate { summary, children };
    }

    let ty = type_name.trim();
    let first = text.split_whitespace().next().unwrap_or_default();
    if ty.ends_with('*') || (first.starts_with("0x") && !ty.is_empty() && !text.contains('{')) {
        if let Some(addr) = parse_u64(first) {
            return RawValue::Pointer(addr);
        }
    }
    match text {
        "true" => return RawValue::Bool(true),
        "false" => return RawValue::Bool(false),
        _ => {}
    }
    if let Ok(v) = text.parse::<i64>() {
        return RawValue::Int(v);
    }
    if let Ok(v) = text.parse::<u64>() {
        return RawValue::UInt(v);
    }
    // chars are printed as `97 'a'`
    if text.ends_with('\'') {
        if let Ok(v) = first.parse::<i64>() {
            return RawValue::Int(v);
        }
    }
    if matches!(ty, "float" | "double" | "long double") {
        if let Ok(v) = text.parse::<f64>() {
            return RawValue::Float(v);
        }
    }
    if text.starts_with('<') && text.ends_with('>') {
        return RawValue::Unavailable(text.trim_matches(['<', '>']).to_string());
    }
    RawValue::Text(text.to_string())
}

fn variable_of(name: &str, expression: &str, t: &Tuple) -> Variable {
    let type_name = t.str("type").unwrap_or_default();
    let children = t.u64("numchild").map(|c| c as usize);
    let value = match t.str("value") {
        Some(text) => parse_value(type_name, text, children),
        // `--simple-values` omits values of aggregates
        None => RawValue::Aggregate {
            summary: None,
            children,
        },
    };
    Variable::new(name, expression, type_name, value)
}

/// Source expression of a varobj child.
fn child_expression(parent: &Variable, exp: &str) -> String {
    if exp.parse::<u64>().is_ok() {
        format!("{}[{exp}]", parent.expression)
    } else if exp.starts_with('*') {
        format!("*{}", parent.expression)
    } else if parent.is_pointer() {
        format!("{}->{exp}", parent.expression)
    } else {
        format!("{}.{exp}", parent.expression)
    }
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, Error> {
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| Error::MiParsing(format!("invalid memory contents `{hex}`")))
        })
        .collect()
}

impl GdbBackend {
    pub fn new(config: &GdbSection) -> Self {
        Self {
            config: config.clone(),
            transport: None,
            buffer: vec![],
            next_token: 1,
            events: VecDeque::new(),
            phase: Phase::Idle,
            held: None,
            pid: None,
            attached: false,
            interrupt_requested: false,
            numbers: HashMap::new(),
            by_number: HashMap::new(),
            register_names: vec![],
            varobjs: HashMap::new(),
            arbiter: None,
        }
    }

    fn lost(&mut self, command: &str, e: io::Error) -> Error {
        let transport = self
            .transport
            .take()
            .map(|t| t.describe())
            .unwrap_or_else(|| "gdb".to_string());
        Error::TransportLost {
            command: command.to_string(),
            transport,
            message: e.to_string(),
        }
    }

    /// Next complete output line, waiting at most `timeout` for it.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, Error> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 4096];
        let mut polled = false;
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                return Ok(Some(String::from_utf8_lossy(&line).trim_end().to_string()));
            }

            let now = Instant::now();
            if now >= deadline && polled {
                return Ok(None);
            }
            polled = true;
            let Some(transport) = self.transport.as_mut() else {
                return Err(not_connected());
            };
            match transport.recv(&mut buf, deadline.saturating_duration_since(now)) {
                Ok(0) => {
                    let e = io::Error::from(io::ErrorKind::UnexpectedEof);
                    return Err(self.lost("read", e));
                }
                Ok(n) => self.buffer.extend_from_slice(&buf[..n]),
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) => return Err(self.lost("read", e)),
            }
        }
    }

    fn read_record(&mut self, timeout: Duration) -> Result<Option<Record>, Error> {
        let Some(line) = self.read_line(timeout)? else {
            return Ok(None);
        };
        if line.is_empty() {
            return Ok(None);
        }
        trace!(target: "gdb", "-> {line}");
        match parse_record(&line) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // the debuggee shares gdb's output
                trace!(target: "gdb", "not an MI record ({e}), treat as output");
                Ok(Some(Record::Stream {
                    kind: StreamKind::Target,
                    text: line,
                }))
            }
        }
    }

    /// Send an MI command and wait for its result record, out of band records become events.
    fn execute(&mut self, command: &str) -> Result<Tuple, Error> {
        let name = command
            .split_whitespace()
            .next()
            .unwrap_or(command)
            .trim_start_matches('-')
            .to_string();
        let token = self.next_token;
        self.next_token += 1;

        trace!(target: "gdb", "<- {token}{command}");
        let Some(transport) = self.transport.as_mut() else {
            return Err(not_connected());
        };
        if let Err(e) = transport.send(format!("{token}{command}\n").as_bytes()) {
            return Err(self.lost(&name, e));
        }

        let timeout = self.config.command_timeout();
        let mut extensions = 0;
        let mut deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                let waited = timeout * (extensions + 1);
                let decision = match self.arbiter.as_mut() {
                    Some(decide) if extensions < MAX_TIMEOUT_EXTENSIONS => decide(&name, waited),
                    _ => TimeoutDecision::Abort,
                };
                if decision == TimeoutDecision::Abort {
                    return Err(Error::ResponseTimeout {
                        command: name,
                        waited,
                    });
                }
                extensions += 1;
                deadline = Instant::now() + timeout;
                continue;
            }

            match self.read_record(deadline - now)? {
                Some(Record::Result {
                    token: Some(t),
                    class,
                    results,
                }) if t == token => {
                    return match class {
                        ResultClass::Error => Err(Error::BackendRejected {
                            command: name,
                            message: results.str("msg").unwrap_or_default().to_string(),
                        }),
                        _ => Ok(results),
                    }
                }
                Some(record) => self.on_record(record),
                None => {}
            }
        }
    }

    fn on_record(&mut self, record: Record) {
        match record {
            Record::Async {
                kind: AsyncKind::Exec,
                class,
                results,
                ..
            } => match class.as_str() {
                "running" if self.phase == Phase::Live => self.events.push_back(DebugEvent::Running),
                "running" => {}
                "stopped" => self.on_stopped(&results),
                other => trace!(target: "gdb", "ignore exec record {other}"),
            },
            Record::Async {
                kind: AsyncKind::Notify,
                class,
                results,
                ..
            } => {
                let event = match class.as_str() {
                    "thread-created" => results
                        .u64("id")
                        .map(|id| DebugEvent::ThreadCreated { thread: ThreadId(id) }),
                    "thread-exited" => results
                        .u64("id")
                        .map(|id| DebugEvent::ThreadExited { thread: ThreadId(id) }),
                    "library-loaded" => results
                        .str("target-name")
                        .or_else(|| results.str("id"))
                        .map(|name| DebugEvent::ModuleLoaded {
                            name: name.to_string(),
                        }),
                    "library-unloaded" => results
                        .str("target-name")
                        .or_else(|| results.str("id"))
                        .map(|name| DebugEvent::ModuleUnloaded {
                            name: name.to_string(),
                        }),
                    "thread-group-started" => {
                        self.pid = results.u64("pid");
                        None
                    }
                    _ => None,
                };
                self.events.extend(event);
            }
            Record::Async { class, .. } => trace!(target: "gdb", "ignore status record {class}"),
            Record::Stream {
                kind: StreamKind::Console | StreamKind::Target,
                text,
            } => {
                let text = text.trim_end();
                if !text.is_empty() {
                    self.events.push_back(DebugEvent::Output(text.to_string()));
                }
            }
            Record::Stream {
                kind: StreamKind::Log,
                text,
            } => debug!(target: "gdb", "{}", text.trim_end()),
            Record::Result { token, class, .. } => {
                debug!(target: "gdb", "ignore unexpected result {class:?} (token {token:?})")
            }
            Record::Prompt => {}
        }
    }

    fn on_stopped(&mut self, results: &Tuple) {
        let reason = results.str("reason").unwrap_or_default();
        let exit_code = match reason {
            "exited-normally" => Some(0),
            "exited" => results
                .str("exit-code")
                .and_then(|code| i32::from_str_radix(code, 8).ok()),
            "exited-signalled" => Some(-1),
            _ => None,
        };
        if let Some(code) = exit_code {
            self.phase = Phase::Idle;
            self.held = None;
            self.events.push_back(DebugEvent::Exited { code });
            return;
        }

        let thread = results.u64("thread-id").map(ThreadId).unwrap_or(ThreadId(1));
        let location = results.tuple("frame").map(location_of).unwrap_or_default();

        if self.phase == Phase::Starting {
            self.phase = Phase::Live;
            self.held = Some((thread, location));
            self.events.push_back(DebugEvent::Ready {
                process: self.pid.unwrap_or_default(),
            });
            return;
        }

        let interrupted = std::mem::take(&mut self.interrupt_requested);
        let reason = match reason {
            "breakpoint-hit" => match results.u64("bkptno").and_then(|n| self.by_number.get(&n)) {
                Some(id) => StopReason::Breakpoint(*id),
                None => StopReason::Step,
            },
            "end-stepping-range" | "function-finished" | "location-reached" => StopReason::Step,
            "signal-received" => match results.str("signal-name") {
                Some("SIGINT") if interrupted => StopReason::Interrupted,
                Some(signal) => StopReason::Signal(signal.to_string()),
                None => StopReason::Signal("unknown".to_string()),
            },
            "" if interrupted => StopReason::Interrupted,
            "" => StopReason::Signal("unknown".to_string()),
            other => StopReason::Signal(other.to_string()),
        };
        self.events.push_back(DebugEvent::Stopped {
            thread,
            reason,
            location,
        });
    }

    fn drop_varobjs(&mut self) {
        let roots: Vec<String> = self
            .varobjs
            .drain()
            .map(|(_, name)| name)
            .filter(|name| !name.contains('.'))
            .collect();
        for name in roots {
            muted_error!(self.execute(&format!("-var-delete {name}")));
        }
    }

    fn load_program(&mut self, target: &Target) -> Result<(), Error> {
        if target.program.as_os_str().is_empty() {
            return Ok(());
        }
        let program = target.program.display().to_string();
        self.execute(&format!("-file-exec-and-symbols {}", quote(&program)))?;
        if !target.args.is_empty() {
            let args = target.args.iter().map(|a| quote(a)).join(" ");
            self.execute(&format!("-exec-arguments {args}"))?;
        }
        if let Some(cwd) = &target.cwd {
            self.execute(&format!("-environment-cd {}", quote(&cwd.display().to_string())))?;
        }
        Ok(())
    }

    fn unresolved(expression: &str) -> impl FnOnce(Error) -> Error + '_ {
        move |e| match e {
            Error::BackendRejected { message, .. } => Error::SymbolUnavailable {
                what: format!("`{expression}`"),
                message,
            },
            e => e,
        }
    }
}

impl Backend for GdbBackend {
    fn variant(&self) -> BackendVariant {
        BackendVariant::Gdb
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            live_breakpoints: false,
            memory: true,
            registers: true,
            locals: true,
            attach_process: true,
            attach_core: true,
            resumable: true,
        }
    }

    fn connection_target(&self) -> String {
        self.config.path.display().to_string()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.startup_attempts,
            interval: Duration::ZERO,
        }
    }

    /// Spawn the debugger once, then wait one startup interval per attempt for its first prompt.
    fn connect(&mut self, attempt: u32) -> Result<(), Error> {
        if self.transport.is_none() {
            let mut args = vec![
                "--interpreter=mi2".to_string(),
                "--nx".to_string(),
                "--quiet".to_string(),
            ];
            args.extend(self.config.extra_args.iter().cloned());
            let path = which::which(&self.config.path).unwrap_or_else(|_| self.config.path.clone());
            self.transport = Some(PipeTransport::spawn(&path, &args)?);
            self.buffer.clear();
        }

        let interval = self.config.startup_interval();
        let deadline = Instant::now() + interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ResponseTimeout {
                    command: format!("startup (attempt {attempt})"),
                    waited: interval,
                });
            }
            match self.read_record(deadline - now)? {
                Some(Record::Prompt) => break,
                Some(record) => self.on_record(record),
                None => {}
            }
        }
        // startup banner is not debuggee output
        self.events.clear();

        self.execute("-gdb-set confirm off")?;
        self.execute("-gdb-set pagination off")?;
        self.execute("-gdb-set mi-async on")?;
        debug!(target: "gdb", "debugger is ready (attempt {attempt})");
        Ok(())
    }

    fn start(&mut self, mode: &AttachMode, target: &Target) -> Result<(), Error> {
        match mode {
            AttachMode::Launch => {
                self.load_program(target)?;
                self.phase = Phase::Starting;
                self.execute("-exec-run --start")?;
            }
            AttachMode::AttachToProcess(pid) => {
                self.load_program(target)?;
                self.phase = Phase::Starting;
                self.attached = true;
                self.pid = Some(*pid as u64);
                self.execute(&format!("-target-attach {pid}"))?;
            }
            AttachMode::AttachToCore(core) => {
                self.load_program(target)?;
                self.execute(&format!(
                    "-target-select core {}",
                    quote(&core.display().to_string())
                ))?;
                self.phase = Phase::PostMortem;

                let info = self.execute("-thread-info")?;
                let current = info.u64("current-thread-id").unwrap_or(1);
                let location = info
                    .list("threads")
                    .iter()
                    .filter_map(Value::as_tuple)
                    .find(|t| t.u64("id") == Some(current))
                    .and_then(|t| t.tuple("frame"))
                    .map(location_of)
                    .unwrap_or_default();
                self.events.push_back(DebugEvent::Ready { process: 0 });
                self.events.push_back(DebugEvent::Stopped {
                    thread: ThreadId(current),
                    reason: StopReason::Signal("core dump".to_string()),
                    location,
                });
            }
            AttachMode::AttachToRemote => {
                return Err(Error::NotSupported {
                    command: "start",
                    reason: "use the remote backend for agents".to_string(),
                })
            }
        }
        Ok(())
    }

    fn next_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>, Error> {
        if self.events.is_empty() && self.transport.is_some() {
            if let Some(record) = self.read_record(timeout)? {
                self.on_record(record);
            }
        } else if self.events.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
        }
        Ok(self.events.pop_front())
    }

    fn resume(&mut self, thread: ThreadId, command: &ResumeCommand) -> Result<(), Error> {
        if self.phase == Phase::PostMortem {
            return Err(Error::NotSupported {
                command: "resume",
                reason: "core files cannot run".to_string(),
            });
        }
        self.held = None;
        self.drop_varobjs();

        let command = match command {
            ResumeCommand::Continue => "-exec-continue".to_string(),
            ResumeCommand::Step(StepKind::Over) => format!("-exec-next --thread {thread}"),
            ResumeCommand::Step(StepKind::Into) => format!("-exec-step --thread {thread}"),
            ResumeCommand::Step(StepKind::Out) => format!("-exec-finish --thread {thread}"),
            ResumeCommand::Step(StepKind::Instruction) => {
                format!("-exec-step-instruction --thread {thread}")
            }
            ResumeCommand::RunToLine { file, line } => format!(
                "-exec-until --thread {thread} {}",
                quote(&format!("{}:{line}", file.display()))
            ),
            ResumeCommand::RunToFunction(function) => {
                format!("-exec-until --thread {thread} {}", quote(function))
            }
            ResumeCommand::ReturnFromFrame => {
                // pops the frame without running, no running/stopped records follow
                let results = self.execute(&format!("-exec-return --thread {thread}"))?;
                let location = results.tuple("frame").map(location_of).unwrap_or_default();
                self.events.push_back(DebugEvent::Running);
                self.events.push_back(DebugEvent::Stopped {
                    thread,
                    reason: StopReason::Step,
                    location,
                });
                return Ok(());
            }
        };
        self.execute(&command).map(|_| ())
    }

    fn interrupt(&mut self) -> Result<(), Error> {
        if let Some((thread, location)) = self.held.take() {
            self.events.push_back(DebugEvent::Stopped {
                thread,
                reason: StopReason::Interrupted,
                location,
            });
            return Ok(());
        }
        self.interrupt_requested = true;
        self.execute("-exec-interrupt --all").map(|_| ())
    }

    fn terminate(&mut self) -> Result<(), Error> {
        if self.transport.is_none() {
            return Ok(());
        }
        self.drop_varobjs();
        match self.phase {
            Phase::Starting | Phase::Live if self.attached => {
                muted_error!(self.execute("-target-detach"), "detach:");
            }
            Phase::Starting | Phase::Live => {
                muted_error!(
                    self.execute("-interpreter-exec console \"kill\""),
                    "kill debuggee:"
                );
            }
            Phase::Idle | Phase::PostMortem => {}
        }

        if let Some(mut transport) = self.transport.take() {
            let _ = transport.send(b"-gdb-exit\n");
            if let Err(e) = transport.shutdown(Duration::from_millis(500)) {
                warn!(target: "gdb", "debugger shutdown: {e}");
            }
        }
        self.phase = Phase::Idle;
        self.held = None;
        self.numbers.clear();
        self.by_number.clear();
        self.events.clear();
        Ok(())
    }

    fn insert_breakpoint(&mut self, request: &InstallRequest) -> Result<Location, Error> {
        if self.numbers.contains_key(&request.id) {
            self.remove_breakpoint(request.id)?;
        }

        let mut command = String::from("-break-insert");
        if let Some(condition) = &request.condition {
            let _ = write!(command, " -c {}", quote(condition));
        }
        if request.ignore_count > 0 {
            let _ = write!(command, " -i {}", request.ignore_count);
        }
        let location = match &request.request {
            BreakpointRequest::Function(name) => name.clone(),
            BreakpointRequest::Line { file, line } => format!("{}:{line}", file.display()),
            BreakpointRequest::Address(addr) => format!("*{addr:#x}"),
        };
        let _ = write!(command, " {}", quote(&location));

        let results = self.execute(&command).map_err(|e| match e {
            Error::BackendRejected { message, .. } => Error::SymbolUnavailable {
                what: request.request.to_string(),
                message,
            },
            e => e,
        })?;
        let bkpt = results
            .tuple("bkpt")
            .ok_or_else(|| Error::MiParsing("break-insert result without bkpt".to_string()))?;
        let number = bkpt
            .u64("number")
            .ok_or_else(|| Error::MiParsing("breakpoint without number".to_string()))?;

        // a breakpoint on an inlined or generic function has several locations
        let obtained = match bkpt.str("addr") {
            Some("<MULTIPLE>") => bkpt
                .list("locations")
                .first()
                .and_then(Value::as_tuple)
                .map(location_of)
                .unwrap_or_default(),
            _ => location_of(bkpt),
        };

        self.numbers.insert(request.id, number);
        self.by_number.insert(number, request.id);
        Ok(obtained)
    }

    fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error> {
        let Some(number) = self.numbers.remove(&id) else {
            return Ok(());
        };
        self.by_number.remove(&number);
        self.execute(&format!("-break-delete {number}")).map(|_| ())
    }

    fn threads(&mut self) -> Result<Vec<ThreadInfo>, Error> {
        let results = self.execute("-thread-info")?;
        Ok(results
            .list("threads")
            .iter()
            .filter_map(Value::as_tuple)
            .filter_map(|t| {
                Some(ThreadInfo {
                    id: ThreadId(t.u64("id")?),
                    label: t
                        .str("name")
                        .or_else(|| t.str("target-id"))
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect())
    }

    fn frames(&mut self, thread: ThreadId) -> Result<Vec<Frame>, Error> {
        let results = self.execute(&format!("-stack-list-frames --thread {thread}"))?;
        Ok(results
            .list("stack")
            .iter()
            .filter_map(Value::as_tuple)
            .map(|t| Frame {
                level: t.u64("level").unwrap_or_default() as u32,
                location: location_of(t),
            })
            .collect())
    }

    fn registers(&mut self, thread: ThreadId) -> Result<RegisterSet, Error> {
        if self.register_names.is_empty() {
            let results = self.execute("-data-list-register-names")?;
            self.register_names = results
                .list("register-names")
                .iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect();
        }

        let results = self.execute(&format!("-data-list-register-values --thread {thread} x"))?;
        Ok(results
            .list("register-values")
            .iter()
            .filter_map(Value::as_tuple)
            .filter_map(|t| {
                let name = self.register_names.get(t.u64("number")? as usize)?;
                // vector registers are tuples, only scalar ones are kept
                let value = parse_u64(t.str("value")?)?;
                (!name.is_empty()).then(|| (name.clone(), value))
            })
            .collect())
    }

    fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>, Error> {
        let results = self.execute(&format!("-data-read-memory-bytes {address:#x} {len}"))?;
        let mut bytes = Vec::with_capacity(len);
        for block in results.list("memory").iter().filter_map(Value::as_tuple) {
            bytes.extend(decode_hex(block.str("contents").unwrap_or_default())?);
        }
        Ok(bytes)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let hex: String = data.iter().map(|b| format!("{b:02x}")).collect();
        self.execute(&format!("-data-write-memory-bytes {address:#x} {hex}"))
            .map(|_| ())
    }

    fn locals(&mut self, frame: FrameRef) -> Result<Vec<Variable>, Error> {
        let results = self.execute(&format!(
            "-stack-list-variables --thread {} --frame {} --simple-values",
            frame.thread, frame.level
        ))?;
        Ok(results
            .list("variables")
            .iter()
            .filter_map(Value::as_tuple)
            .filter_map(|t| {
                let name = t.str("name")?;
                Some(variable_of(name, name, t))
            })
            .collect())
    }

    fn evaluate(&mut self, frame: FrameRef, expression: &str) -> Result<Variable, Error> {
        let results = self
            .execute(&format!(
                "-var-create --thread {} --frame {} - * {}",
                frame.thread,
                frame.level,
                quote(expression)
            ))
            .map_err(Self::unresolved(expression))?;
        if let Some(name) = results.str("name") {
            self.varobjs.insert(expression.to_string(), name.to_string());
        }
        Ok(variable_of(expression, expression, &results))
    }

    fn children(&mut self, frame: FrameRef, parent: &Variable) -> Result<Vec<Variable>, Error> {
        let varobj = match self.varobjs.get(&parent.expression) {
            Some(varobj) => varobj.clone(),
            None => {
                self.evaluate(frame, &parent.expression)?;
                self.varobjs
                    .get(&parent.expression)
                    .cloned()
                    .ok_or_else(|| Error::SymbolUnavailable {
                        what: format!("`{}`", parent.expression),
                        message: "no variable object".to_string(),
                    })?
            }
        };

        let results = self
            .execute(&format!("-var-list-children --simple-values {varobj}"))
            .map_err(Self::unresolved(&parent.expression))?;
        let mut children = vec![];
        for child in results.list("children").iter().filter_map(Value::as_tuple) {
            let (Some(exp), Some(name)) = (child.str("exp"), child.str("name")) else {
                continue;
            };
            let expression = child_expression(parent, exp);
            self.varobjs.insert(expression.clone(), name.to_string());
            children.push(variable_of(exp, &expression, child));
        }
        Ok(children)
    }

    fn set_timeout_arbiter(&mut self, arbiter: TimeoutArbiter) {
        self.arbiter = Some(arbiter);
    }
}

impl Drop for GdbBackend {
    fn drop(&mut self) {
        muted_error!(self.terminate());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn feed(backend: &mut GdbBackend, lines: &[&str]) -> Vec<DebugEvent> {
        for line in lines {
            backend.on_record(parse_record(line).unwrap());
        }
        backend.events.drain(..).collect()
    }

    #[test]
    fn test_entry_stop_is_ready() {
        let mut backend = GdbBackend::new(&GdbSection::default());
        backend.phase = Phase::Starting;
        let events = feed(
            &mut backend,
            &[
                r#"=thread-group-started,id="i1",pid="4242""#,
                r#"*running,thread-id="all""#,
                r#"*stopped,reason="breakpoint-hit",disp="del",bkptno="1",frame={addr="0x401136",func="main",args=[],file="calc.c",fullname="/src/calc.c",line="9"},thread-id="1",stopped-threads="all""#,
            ],
        );
        assert_eq!(events, vec![DebugEvent::Ready { process: 4242 }]);

        backend.interrupt().unwrap();
        let events: Vec<_> = backend.events.drain(..).collect();
        assert_eq!(
            events,
            vec![DebugEvent::Stopped {
                thread: ThreadId(1),
                reason: StopReason::Interrupted,
                location: Location::at_line("/src/calc.c", 9)
                    .with_function("main")
                    .with_address(0x401136),
            }]
        );
    }

    #[test]
    fn test_stop_records_to_events() {
        struct TestCase {
            line: &'static str,
            interrupted: bool,
            expected: DebugEvent,
        }

        let cases = vec![
            TestCase {
                line: r#"*stopped,reason="breakpoint-hit",bkptno="3",frame={func="sum",file="calc.c",line="4"},thread-id="2""#,
                interrupted: false,
                expected: DebugEvent::Stopped {
                    thread: ThreadId(2),
                    reason: StopReason::Breakpoint(BreakpointId(7)),
                    location: Location::at_line("calc.c", 4).with_function("sum"),
                },
            },
            TestCase {
                line: r#"*stopped,reason="end-stepping-range",frame={func="??",addr="0x10"},thread-id="1""#,
                interrupted: false,
                expected: DebugEvent::Stopped {
                    thread: ThreadId(1),
                    reason: StopReason::Step,
                    location: Location::default().with_address(0x10),
                },
            },
            TestCase {
                line: r#"*stopped,reason="signal-received",signal-name="SIGINT",thread-id="1""#,
                interrupted: true,
                expected: DebugEvent::Stopped {
                    thread: ThreadId(1),
                    reason: StopReason::Interrupted,
                    location: Location::default(),
                },
            },
            TestCase {
                line: r#"*stopped,reason="signal-received",signal-name="SIGSEGV",thread-id="1""#,
                interrupted: false,
                expected: DebugEvent::Stopped {
                    thread: ThreadId(1),
                    reason: StopReason::Signal("SIGSEGV".to_string()),
                    location: Location::default(),
                },
            },
            TestCase {
                line: r#"*stopped,reason="exited",exit-code="012""#,
                interrupted: false,
                expected: DebugEvent::Exited { code: 10 },
            },
            TestCase {
                line: r#"*stopped,reason="exited-normally""#,
                interrupted: false,
                expected: DebugEvent::Exited { code: 0 },
            },
            TestCase {
                line: r#"=library-loaded,id="/lib/libc.so.6",target-name="/lib/libc.so.6",host-name="/lib/libc.so.6""#,
                interrupted: false,
                expected: DebugEvent::ModuleLoaded {
                    name: "/lib/libc.so.6".to_string(),
                },
            },
            TestCase {
                line: r#"=thread-created,id="2",group-id="i1""#,
                interrupted: false,
                expected: DebugEvent::ThreadCreated {
                    thread: ThreadId(2),
                },
            },
            TestCase {
                line: r#"~"hello\n""#,
                interrupted: false,
                expected: DebugEvent::Output("hello".to_string()),
            },
        ];

        for tc in cases {
            let mut backend = GdbBackend::new(&GdbSection::default());
            backend.phase = Phase::Live;
            backend.by_number.insert(3, BreakpointId(7));
            backend.interrupt_requested = tc.interrupted;
            assert_eq!(feed(&mut backend, &[tc.line]), vec![tc.expected], "{}", tc.line);
        }
    }

    #[test]
    fn test_parse_values() {
        struct TestCase {
            type_name: &'static str,
            text: &'static str,
            children: Option<usize>,
            expected: RawValue,
        }

        let cases = vec![
            TestCase { type_name: "int", text: "-5", children: None, expected: RawValue::Int(-5) },
            TestCase {
                type_name: "unsigned long",
                text: "18446744073709551615",
                children: None,
                expected: RawValue::UInt(u64::MAX),
            },
            TestCase { type_name: "bool", text: "true", children: None, expected: RawValue::Bool(true) },
            TestCase { type_name: "char", text: "97 'a'", children: None, expected: RawValue::Int(97) },
            TestCase { type_name: "double", text: "1.5", children: None, expected: RawValue::Float(1.5) },
            TestCase {
                type_name: "char *",
                text: "0x402004 \"hello\"",
                children: None,
                expected: RawValue::Pointer(0x402004),
            },
            TestCase {
                type_name: "struct point",
                text: "{...}",
                children: Some(2),
                expected: RawValue::Aggregate { summary: None, children: Some(2) },
            },
            TestCase {
                type_name: "int",
                text: "<optimized out>",
                children: None,
                expected: RawValue::Unavailable("optimized out".to_string()),
            },
            TestCase {
                type_name: "enum color",
                text: "RED",
                children: None,
                expected: RawValue::Text("RED".to_string()),
            },
        ];

        for tc in cases {
            assert_eq!(parse_value(tc.type_name, tc.text, tc.children), tc.expected, "{}", tc.text);
        }
    }

    #[test]
    fn test_child_expressions() {
        let record = Variable::new("p", "p", "struct point", RawValue::Aggregate { summary: None, children: Some(2) });
        let pointer = Variable::new("n", "n", "struct node *", RawValue::Pointer(0x10));
        let array = Variable::new("a", "s.a", "int [4]", RawValue::Aggregate { summary: None, children: Some(4) });

        assert_eq!(child_expression(&record, "x"), "p.x");
        assert_eq!(child_expression(&pointer, "next"), "n->next");
        assert_eq!(child_expression(&pointer, "*n"), "*n");
        assert_eq!(child_expression(&array, "2"), "s.a[2]");
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode_hex("00ff10").unwrap(), vec![0, 0xff, 0x10]);
        assert!(decode_hex("0g").is_err());
        assert!(decode_hex("abc").is_err());
    }
}
