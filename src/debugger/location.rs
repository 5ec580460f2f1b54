use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// A place in the debuggee: function, source position and instruction address.
/// Any part may be missing, a missing file/line means there is no debug information for the place.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u64>,
}

impl Location {
    pub fn at_line(file: impl Into<PathBuf>, line: u64) -> Self {
        Self {
            file: Some(file.into()),
            line: Some(line),
            ..Default::default()
        }
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn with_address(mut self, address: u64) -> Self {
        self.address = Some(address);
        self
    }

    pub fn has_debug_info(&self) -> bool {
        self.file.is_some() && self.line.is_some()
    }

    /// True if `file` names the same source file as this location.
    /// Relative request paths match by suffix, so `src/main.c` matches `/home/u/p/src/main.c`.
    pub fn same_file(&self, file: &Path) -> bool {
        match self.file.as_deref() {
            None => false,
            Some(own) => own == file || own.ends_with(file) || file.ends_with(own),
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut parts = vec![];
        if let Some(function) = &self.function {
            parts.push(function.clone());
        }
        match (&self.file, self.line) {
            (Some(file), Some(line)) => parts.push(format!("{}:{line}", file.display())),
            (Some(file), None) => parts.push(file.display().to_string()),
            _ => {}
        }
        if let Some(addr) = self.address {
            parts.push(format!("{addr:#016X}"));
        }
        if parts.is_empty() {
            return f.write_str("??");
        }
        f.write_str(&parts.join(" at "))
    }
}

/// Stack frame, level 0 is the innermost one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub level: u32,
    pub location: Location,
}
