//! Resume commands. All of them share the `Stopped -> Running` edge and differ only in payload.
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use strum_macros::{Display as StrumDisplay, EnumString};

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, StrumDisplay, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum StepKind {
    Over,
    Into,
    Out,
    Instruction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeCommand {
    Continue,
    Step(StepKind),
    RunToLine { file: PathBuf, line: u64 },
    RunToFunction(String),
    /// Pop the current frame without executing the rest of it.
    ReturnFromFrame,
}

impl Display for ResumeCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ResumeCommand::Continue => f.write_str("continue"),
            ResumeCommand::Step(kind) => write!(f, "step {kind}"),
            ResumeCommand::RunToLine { file, line } => {
                write!(f, "run to {}:{line}", file.display())
            }
            ResumeCommand::RunToFunction(function) => write!(f, "run to {function}"),
            ResumeCommand::ReturnFromFrame => f.write_str("return"),
        }
    }
}
