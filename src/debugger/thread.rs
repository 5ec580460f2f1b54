use crate::debugger::location::Frame;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Backend level thread identifier (an OS tid, a GDB thread number or a script thread index).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub u64);

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread as reported by a backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub label: String,
}

/// Thread view owned by a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub label: String,
    /// Frames, empty until derived at a stop.
    pub frames: Vec<Frame>,
    pub is_current: bool,
}

impl From<ThreadInfo> for Thread {
    fn from(info: ThreadInfo) -> Self {
        Self {
            id: info.id,
            label: info.label,
            frames: vec![],
            is_current: false,
        }
    }
}
