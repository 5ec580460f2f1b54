//! Engine configuration, passed explicitly into session construction.
use crate::debugger::error::Error;
use crate::debugger::variable::format::NumericBase;
use log::debug;
use serde::Deserialize;
use std::fs::read_to_string;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Report a stop right after start instead of running to the first breakpoint.
    pub stop_at_entry: bool,
    /// How long to wait for the backend `Ready` event.
    pub start_timeout_ms: u64,
    /// Event poll granularity of the session worker.
    pub poll_interval_ms: u64,
    /// Forward raw backend output to the `log-line` hook.
    pub log_backend_chatter: bool,
    /// Default logger filter, `RUST_LOG` overrides it.
    pub log_filter: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            stop_at_entry: false,
            start_timeout_ms: 10_000,
            poll_interval_ms: 50,
            log_backend_chatter: true,
            log_filter: "warn".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BreakpointsSection {
    /// Ask `on_breakpoint_adjusted` before keeping a breakpoint that landed on another line.
    pub confirm_adjusted: bool,
    /// Send full source paths to the backend instead of file names.
    pub use_full_path: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InspectionSection {
    pub max_children: usize,
    pub max_string_length: usize,
    pub default_base: NumericBase,
}

impl Default for InspectionSection {
    fn default() -> Self {
        Self {
            max_children: 256,
            max_string_length: 4096,
            default_base: NumericBase::Dec,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub directory: PathBuf,
    /// Number of recently touched memory regions kept for a snapshot.
    pub max_regions: usize,
    pub max_region_size: usize,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            max_regions: 64,
            max_region_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    pub retry_interval_ms: u64,
    pub max_attempts: u32,
    pub response_timeout_ms: u64,
    /// How many times `on_response_timeout` may extend a single wait.
    pub max_timeout_extensions: u32,
    /// Directory for deployed programs, relative to the agent root.
    pub deploy_dir: String,
    pub chunk_size: usize,
    pub baud_rate: u32,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            retry_interval_ms: 1000,
            max_attempts: 10,
            response_timeout_ms: 5000,
            max_timeout_extensions: 3,
            deploy_dir: "deploy".to_string(),
            chunk_size: 4096,
            baud_rate: 115_200,
        }
    }
}

impl RemoteSection {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GdbSection {
    pub path: PathBuf,
    pub extra_args: Vec<String>,
    /// Attempts to get the first MI prompt from a freshly spawned debugger.
    pub startup_attempts: u32,
    pub startup_interval_ms: u64,
    /// How long a single MI command may take.
    pub command_timeout_ms: u64,
}

impl Default for GdbSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("gdb"),
            extra_args: vec![],
            startup_attempts: 20,
            startup_interval_ms: 250,
            command_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PtraceSection {
    pub disable_aslr: bool,
}

impl GdbSection {
    pub fn startup_interval(&self) -> Duration {
        Duration::from_millis(self.startup_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for PtraceSection {
    fn default() -> Self {
        Self { disable_aslr: true }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScriptSection {
    /// Statements a script may execute between two stops, guards against endless loops.
    pub max_steps: u64,
}

impl Default for ScriptSection {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionSection,
    pub breakpoints: BreakpointsSection,
    pub inspection: InspectionSection,
    pub snapshot: SnapshotSection,
    pub remote: RemoteSection,
    pub gdb: GdbSection,
    pub ptrace: PtraceSection,
    pub script: ScriptSection,
}

impl Config {
    const DEFAULT_PATH: &'static str = ".config/mdbg/config.toml";

    /// Load configuration from `path`, or from `~/.config/mdbg/config.toml` if `path` is `None`.
    ///
    /// A missing default file means default configuration, a missing explicit file or a
    /// malformed one is an error.
    pub fn from_file(path: Option<&Path>) -> Result<Self, Error> {
        let data = match path {
            Some(path) => read_to_string(path)?,
            None => {
                let Some(home) = home::home_dir() else {
                    return Ok(Config::default());
                };
                match read_to_string(home.join(Self::DEFAULT_PATH)) {
                    Ok(data) => data,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        debug!(target: "session", "no config file, use defaults");
                        return Ok(Config::default());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };
        Self::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<Self, Error> {
        Ok(toml::de::from_str(data)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.session.poll_interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.session.start_timeout_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_preset_equals_default() {
        let preset = include_str!("preset/config.toml");
        let config = Config::from_toml(preset).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_config() {
        struct TestCase {
            toml: &'static str,
            check: fn(&Config) -> bool,
        }

        let cases = vec![
            TestCase {
                toml: "",
                check: |c| c == &Config::default(),
            },
            TestCase {
                toml: "[breakpoints]\nconfirm_adjusted = true",
                check: |c| c.breakpoints.confirm_adjusted && !c.breakpoints.use_full_path,
            },
            TestCase {
                toml: "[inspection]\ndefault_base = \"hex\"\nmax_children = 8",
                check: |c| {
                    c.inspection.default_base == NumericBase::Hex
                        && c.inspection.max_children == 8
                        && c.inspection.max_string_length == 4096
                },
            },
            TestCase {
                toml: "[remote]\nmax_attempts = 3\nretry_interval_ms = 10",
                check: |c| {
                    c.remote.max_attempts == 3
                        && c.remote.retry_interval() == Duration::from_millis(10)
                },
            },
        ];

        for tc in cases {
            let config = Config::from_toml(tc.toml).unwrap();
            assert!((tc.check)(&config), "{}", tc.toml);
        }
    }

    #[test]
    fn test_malformed_config() {
        let err = Config::from_toml("[session]\nstop_at_entry = \"maybe\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
