use crate::debugger::state::SessionState;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- session errors --------------------------------------------
    #[error("`{command}` is not allowed while the session is {state}")]
    InvalidState {
        command: &'static str,
        state: SessionState,
    },
    #[error("`{command}` is not supported: {reason}")]
    NotSupported {
        command: &'static str,
        reason: String,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("session worker is stopped")]
    WorkerStopped,

    // --------------------------------- backend errors --------------------------------------------
    #[error("backend rejected `{command}`: {message}")]
    BackendRejected { command: String, message: String },
    #[error("{what} is unavailable: {message}")]
    SymbolUnavailable { what: String, message: String },
    #[error("expression `{expression}` may have side effects, evaluation must be forced")]
    SideEffectRefused { expression: String },

    // --------------------------------- connection errors -----------------------------------------
    #[error("cannot connect to {target} after {attempts} attempts: {last_error}")]
    ConnectionTimeout {
        target: String,
        attempts: u32,
        last_error: String,
    },
    #[error("transport {transport} lost during `{command}`: {message}")]
    TransportLost {
        command: String,
        transport: String,
        message: String,
    },
    #[error("no response to `{command}` after {waited:?}")]
    ResponseTimeout { command: String, waited: Duration },
    #[error("protocol violation during `{command}`: {message}")]
    Protocol { command: String, message: String },
    #[error("operation cancelled")]
    Cancelled,

    // --------------------------------- artifact errors -------------------------------------------
    #[error("snapshot artifact {} is corrupt: {reason}", .path.display())]
    ArtifactCorrupt { path: PathBuf, reason: String },

    // --------------------------------- parsing errors --------------------------------------------
    #[error("script parsing error: {0}")]
    ScriptParsing(String),
    #[error("machine interface record parsing error: {0}")]
    MiParsing(String),
    #[error("config parsing error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("dwarf file parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    RegEx(#[from] regex::Error),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("attach a running process: {0}")]
    Attach(nix::Error),
    #[error(transparent)]
    IO(#[from] std::io::Error),

    // --------------------------------- third party errors ----------------------------------------
    #[error("hook: {0}")]
    Hook(anyhow::Error),
}

impl Error {
    /// Return a hint to a session: a fatal error means the debuggee can no longer be controlled
    /// and the session must move into the `Crashed` state.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::InvalidState { .. } => false,
            Error::NotSupported { .. } => false,
            Error::NotFound(_) => false,
            Error::WorkerStopped => false,
            Error::BackendRejected { .. } => false,
            Error::SymbolUnavailable { .. } => false,
            Error::SideEffectRefused { .. } => false,
            Error::ConnectionTimeout { .. } => false,
            Error::ResponseTimeout { .. } => false,
            Error::Cancelled => false,
            Error::ArtifactCorrupt { .. } => false,
            Error::ScriptParsing(_) => false,
            Error::MiParsing(_) => false,
            Error::Config(_) => false,
            Error::DwarfParsing(_) => false,
            Error::ObjParsing(_) => false,
            Error::Json(_) => false,
            Error::RegEx(_) => false,
            Error::Ptrace(_) => false,
            Error::IO(_) => false,
            Error::Hook(_) => false,

            // the debuggee or the channel to it is gone
            Error::TransportLost { .. } => true,
            Error::Protocol { .. } => true,
            Error::Waitpid(_) => true,
            Error::Syscall(_, _) => true,
            Error::Attach(_) => true,
        }
    }

    /// True for errors after which the same command may simply be retried or adjusted.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout { .. }
                | Error::SymbolUnavailable { .. }
                | Error::BackendRejected { .. }
                | Error::SideEffectRefused { .. }
        )
    }

    /// True when an expression or symbol simply does not resolve in the current context.
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            Error::SymbolUnavailable { .. } | Error::BackendRejected { .. }
        )
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "session", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "session", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
