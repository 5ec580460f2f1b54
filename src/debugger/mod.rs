pub mod backend;
pub mod breakpoint;
pub mod cancel;
pub mod command;
pub mod config;
pub mod connect;
pub mod error;
pub mod event;
pub mod location;
pub mod register;
pub mod remote;
pub mod session;
pub mod snapshot;
pub mod state;
pub mod thread;
pub mod transport;
pub mod variable;
pub mod worker;

pub use backend::{AttachMode, Backend, BackendVariant, Capabilities, Target, TimeoutDecision};
pub use breakpoint::{BreakpointId, BreakpointRequest, Resolution};
pub use cancel::CancellationToken;
pub use command::{ResumeCommand, StepKind};
pub use config::Config;
pub use connect::ConnectionProgress;
pub use error::Error;
pub use event::StopReason;
pub use location::{Frame, Location};
pub use session::Session;
pub use state::SessionState;
pub use thread::ThreadId;
pub use variable::WatchItem;

use std::time::Duration;

/// Outbound notifications of a session. Called on the thread that drives the session.
pub trait EventHook {
    fn on_state_changed(&self, old: SessionState, new: SessionState);

    fn on_breakpoint_resolved(&self, id: BreakpointId, resolution: &Resolution);

    /// Debuggee stopped. `frame` is the current frame of `thread`, if any is known.
    fn on_stop(
        &self,
        thread: ThreadId,
        frame: Option<&Frame>,
        reason: &StopReason,
    ) -> anyhow::Result<()>;

    /// Roots of the inspection tree after a rebuild, or a changed subtree.
    fn on_watch_updated(&self, items: &[WatchItem]);

    /// Backend chatter and debuggee output.
    fn on_log_line(&self, line: &str);

    /// Asked when `breakpoints.confirm_adjusted` is on and a breakpoint landed elsewhere.
    fn on_breakpoint_adjusted(
        &self,
        _id: BreakpointId,
        _requested: &BreakpointRequest,
        _obtained: &Location,
    ) -> bool {
        true
    }

    fn on_response_timeout(&self, _command: &str, _waited: Duration) -> TimeoutDecision {
        TimeoutDecision::Abort
    }

    fn on_connection_progress(&self, _progress: &ConnectionProgress) {}
}

/// Hook that ignores everything.
#[derive(Default, Clone, Copy)]
pub struct NopHook;

impl EventHook for NopHook {
    fn on_state_changed(&self, _: SessionState, _: SessionState) {}

    fn on_breakpoint_resolved(&self, _: BreakpointId, _: &Resolution) {}

    fn on_stop(&self, _: ThreadId, _: Option<&Frame>, _: &StopReason) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_watch_updated(&self, _: &[WatchItem]) {}

    fn on_log_line(&self, _: &str) {}
}
