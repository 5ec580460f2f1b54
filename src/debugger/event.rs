use crate::debugger::breakpoint::BreakpointId;
use crate::debugger::location::Location;
use crate::debugger::thread::ThreadId;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Why the debuggee stopped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Breakpoint(BreakpointId),
    /// Step, run-to or return-from-frame completed.
    Step,
    Signal(String),
    /// Stop requested by `interrupt` (or stop at entry).
    Interrupted,
    /// Session built from a snapshot.
    Snapshot,
}

impl Display for StopReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Breakpoint(id) => write!(f, "breakpoint {id}"),
            StopReason::Step => f.write_str("step"),
            StopReason::Signal(sig) => write!(f, "signal {sig}"),
            StopReason::Interrupted => f.write_str("interrupted"),
            StopReason::Snapshot => f.write_str("snapshot"),
        }
    }
}

/// Canonical event stream every backend produces, whatever its wire format is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugEvent {
    /// Debuggee exists and is held, nothing ran yet.
    Ready { process: u64 },
    Running,
    Stopped {
        thread: ThreadId,
        reason: StopReason,
        location: Location,
    },
    ModuleLoaded { name: String },
    ModuleUnloaded { name: String },
    ThreadCreated { thread: ThreadId },
    ThreadExited { thread: ThreadId },
    /// Debuggee or backend output line.
    Output(String),
    Exited { code: i32 },
}
