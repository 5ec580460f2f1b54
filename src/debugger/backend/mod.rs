//! Backend variants behind one control interface.
pub mod gdb;
pub mod ptrace;
pub mod remote;
pub mod replay;
pub mod script;

use crate::debugger::breakpoint::{BreakpointBackend, BreakpointId, BreakpointRequest};
use crate::debugger::command::ResumeCommand;
use crate::debugger::error::Error;
use crate::debugger::event::DebugEvent;
use crate::debugger::location::{Frame, Location};
use crate::debugger::register::RegisterSet;
use crate::debugger::thread::{ThreadId, ThreadInfo};
use crate::debugger::variable::value::Variable;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use strum_macros::{Display, EnumString};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackendVariant {
    /// Native debugger driven over its machine interface.
    Gdb,
    /// Linux ptrace API used directly.
    Ptrace,
    /// Interpreted script, no real process.
    Script,
    /// Agent on an embedded target, reached over a transport.
    Remote,
    /// Snapshot served as a detached session.
    Replay,
}

/// What a backend can do.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Breakpoints may be inserted and removed while the debuggee runs.
    pub live_breakpoints: bool,
    pub memory: bool,
    pub registers: bool,
    pub locals: bool,
    pub attach_process: bool,
    pub attach_core: bool,
    /// False for post-mortem sessions (cores, snapshots).
    pub resumable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachMode {
    Launch,
    AttachToProcess(u32),
    AttachToCore(PathBuf),
    AttachToRemote,
}

impl AttachMode {
    pub fn is_post_mortem(&self) -> bool {
        matches!(self, AttachMode::AttachToCore(_))
    }
}

/// Debuggee program description.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl Target {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }
}

/// Frame selector for inspection queries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRef {
    pub thread: ThreadId,
    pub level: u32,
}

/// Breakpoint as sent to a backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRequest {
    pub id: BreakpointId,
    pub request: BreakpointRequest,
    pub condition: Option<String>,
    pub ignore_count: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimeoutDecision {
    WaitLonger,
    Abort,
}

/// Asked when a backend request got no response in time: `(command, waited so far)`.
pub type TimeoutArbiter = Box<dyn FnMut(&str, Duration) -> TimeoutDecision + Send>;

/// How a backend connection is retried by the connection starter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            interval: Duration::ZERO,
        }
    }
}

/// Uniform control interface of a debugger backend.
///
/// A backend never changes session state itself, it reports [`DebugEvent`]s from
/// [`Backend::next_event`] and the session state machine consumes them.
pub trait Backend: Send {
    fn variant(&self) -> BackendVariant;

    fn capabilities(&self) -> Capabilities;

    /// Description of what `connect` reaches (a transport, a debugger binary).
    fn connection_target(&self) -> String {
        self.variant().to_string()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Single connection attempt, retried by the connection starter.
    fn connect(&mut self, _attempt: u32) -> Result<(), Error> {
        Ok(())
    }

    /// Create or attach the debuggee. A `Ready` event follows once it exists and is held.
    fn start(&mut self, mode: &AttachMode, target: &Target) -> Result<(), Error>;

    /// Next event, waiting at most `timeout`.
    fn next_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>, Error>;

    /// Resume the debuggee, a `Running` event follows.
    fn resume(&mut self, thread: ThreadId, command: &ResumeCommand) -> Result<(), Error>;

    /// Stop a running debuggee, a `Stopped` event with `Interrupted` reason follows.
    fn interrupt(&mut self) -> Result<(), Error>;

    /// Kill (or detach from) the debuggee and release backend resources.
    fn terminate(&mut self) -> Result<(), Error>;

    fn insert_breakpoint(&mut self, request: &InstallRequest) -> Result<Location, Error>;

    fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error>;

    fn threads(&mut self) -> Result<Vec<ThreadInfo>, Error>;

    fn frames(&mut self, thread: ThreadId) -> Result<Vec<Frame>, Error>;

    fn registers(&mut self, thread: ThreadId) -> Result<RegisterSet, Error>;

    fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>, Error>;

    /// Read several regions, backends with a request pipeline override this.
    fn read_memory_many(&mut self, regions: &[(u64, usize)]) -> Vec<Result<Vec<u8>, Error>> {
        regions
            .iter()
            .map(|(addr, len)| self.read_memory(*addr, *len))
            .collect()
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error>;

    fn locals(&mut self, frame: FrameRef) -> Result<Vec<Variable>, Error>;

    fn evaluate(&mut self, frame: FrameRef, expression: &str) -> Result<Variable, Error>;

    /// One level of children of `parent`.
    fn children(&mut self, frame: FrameRef, parent: &Variable) -> Result<Vec<Variable>, Error>;

    fn may_have_side_effects(&self, expression: &str) -> bool {
        may_have_side_effects(expression)
    }

    fn set_timeout_arbiter(&mut self, _arbiter: TimeoutArbiter) {}
}

impl<B: Backend + ?Sized> BreakpointBackend for B {
    fn insert_breakpoint(&mut self, request: &InstallRequest) -> Result<Location, Error> {
        Backend::insert_breakpoint(self, request)
    }

    fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error> {
        Backend::remove_breakpoint(self, id)
    }
}

static CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z_][A-Za-z0-9_:]*)\s*\(").expect("valid regex"));

/// Plain and compound assignments (`=`, `+=`, `<<=`, ...), comparisons do not match.
static ASSIGN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<<=|>>=|(^|[^=!<>])=($|[^=])").expect("valid regex"));

const PURE_CALLS: &[&str] = &["sizeof", "alignof", "offsetof", "_Alignof"];

/// Conservative check for assignments, increments and function calls in a C-like expression.
pub fn may_have_side_effects(expression: &str) -> bool {
    may_have_side_effects_with(expression, PURE_CALLS)
}

/// Same as [`may_have_side_effects`] with a custom list of functions known to be pure.
pub fn may_have_side_effects_with(expression: &str, pure_calls: &[&str]) -> bool {
    if expression.contains("++") || expression.contains("--") {
        return true;
    }
    if ASSIGN_RE.is_match(expression) {
        return true;
    }
    CALL_RE
        .captures_iter(expression)
        .any(|cap| !pure_calls.contains(&&cap[1]))
}
