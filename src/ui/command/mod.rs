//! Console commands.
//!
//! A command is parsed from one line of user input (see [`parser`]) and then handled by the
//! console against a running session.

pub mod parser;

use crate::debugger::command::ResumeCommand;
use crate::debugger::variable::format::FormatHint;
use crate::debugger::{BreakpointId, BreakpointRequest, Error, ThreadId};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum BreakpointCommand {
    Add {
        request: BreakpointRequest,
        condition: Option<String>,
        ignore_count: u32,
    },
    Enable(BreakpointId),
    Disable(BreakpointId),
    Delete(BreakpointId),
    Info,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchCommand {
    Add { expression: String, force: bool },
    Remove(String),
    Expand(String),
    Collapse(String),
    /// Set (or reset with `None`) the display format of a type.
    Format {
        type_name: String,
        hint: Option<FormatHint>,
    },
    Info,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotCommand {
    /// Save into the given file or into the configured snapshot directory.
    Save(Option<PathBuf>),
    Load(PathBuf),
}

/// External commands that can be processed by the debugger.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Start the debuggee, or restart it if the session is over.
    Run,
    Resume(ResumeCommand),
    Interrupt,
    Breakpoint(BreakpointCommand),
    Watch(WatchCommand),
    Print { expression: String, force: bool },
    Locals,
    Backtrace { all: bool },
    /// Show threads, or switch the current one.
    Thread(Option<ThreadId>),
    /// Show the current frame, or switch to another level.
    Frame(Option<u32>),
    Memory { address: u64, len: usize },
    Registers,
    Snapshot(SnapshotCommand),
    Help(Option<String>),
    Quit,
}

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("malformed command (try `help command`):\n{0}")]
    Parsing(String),
    #[error(transparent)]
    Handle(#[from] Error),
}

pub type CommandResult<T> = Result<T, CommandError>;
