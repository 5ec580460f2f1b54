use crate::debugger::{
    BreakpointId, BreakpointRequest, ConnectionProgress, EventHook, Frame, Location, Resolution,
    SessionState, StopReason, ThreadId, TimeoutDecision, WatchItem,
};
use crate::ui::console::editor::CommandCompleter;
use crate::ui::console::file::FileView;
use crate::ui::console::print::style::{ErrorView, KeywordView};
use crate::ui::console::print::{render_location, ExternalPrinter};
use crate::ui::console::Prompter;
use log::debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct TerminalHook {
    file_view: FileView,
    printer: ExternalPrinter,
    prompter: Arc<Prompter>,
    completer: Arc<Mutex<CommandCompleter>>,
}

impl TerminalHook {
    pub(super) fn new(
        printer: ExternalPrinter,
        prompter: Arc<Prompter>,
        completer: Arc<Mutex<CommandCompleter>>,
    ) -> Self {
        Self {
            file_view: FileView::new(),
            printer,
            prompter,
            completer,
        }
    }
}

impl EventHook for TerminalHook {
    fn on_state_changed(&self, old: SessionState, new: SessionState) {
        debug!(target: "console", "session state: {old} -> {new}");
        match new {
            SessionState::Finished => self.printer.println(KeywordView::from("Program finished")),
            SessionState::Crashed => self.printer.println(ErrorView::from(
                "Debugger session crashed, `run` starts a new one",
            )),
            _ => {}
        }
    }

    fn on_breakpoint_resolved(&self, id: BreakpointId, resolution: &Resolution) {
        let msg = match resolution {
            Resolution::Exact(location) => {
                format!("Breakpoint {id} at {}", render_location(location))
            }
            Resolution::Adjusted {
                requested,
                obtained,
            } => format!(
                "Breakpoint {id} at {} (requested at {requested})",
                render_location(obtained)
            ),
            Resolution::Failed(reason) => format!("Breakpoint {id} pending: {reason}"),
        };
        self.printer.println(msg);
    }

    fn on_stop(
        &self,
        thread: ThreadId,
        frame: Option<&Frame>,
        reason: &StopReason,
    ) -> anyhow::Result<()> {
        let head = match reason {
            StopReason::Breakpoint(id) => format!("Hit breakpoint {id}"),
            StopReason::Step => "Stopped".to_string(),
            StopReason::Signal(signal) => {
                format!("Signal {} received", KeywordView::from(signal))
            }
            StopReason::Interrupted => "Interrupted".to_string(),
            StopReason::Snapshot => "Snapshot opened".to_string(),
        };

        let Some(frame) = frame else {
            self.printer.println(format!("{head} in thread {thread}"));
            return Ok(());
        };
        self.printer.println(format!(
            "{head} in thread {thread}: {}",
            render_location(&frame.location)
        ));
        if frame.location.has_debug_info() {
            // sources may live on another machine (remote targets)
            match self.file_view.render_source(&frame.location, 0) {
                Ok(source) => self.printer.print(source),
                Err(e) => debug!(target: "console", "no source for {}: {e:#}", frame.location),
            }
        }
        Ok(())
    }

    fn on_watch_updated(&self, items: &[WatchItem]) {
        let names = items.iter().map(|item| item.name.clone());
        self.completer
            .lock()
            .unwrap()
            .replace_expression_hints(names);
    }

    fn on_log_line(&self, line: &str) {
        self.printer.println(line.trim_end());
    }

    fn on_breakpoint_adjusted(
        &self,
        id: BreakpointId,
        requested: &BreakpointRequest,
        obtained: &Location,
    ) -> bool {
        self.prompter.yes(&format!(
            "Breakpoint {id} requested at {requested} can only be set at {}. Accept? (y or n)",
            render_location(obtained)
        ))
    }

    fn on_response_timeout(&self, command: &str, waited: Duration) -> TimeoutDecision {
        let question = format!(
            "No response to `{command}` after {}s. Wait longer? (y or n)",
            waited.as_secs()
        );
        if self.prompter.yes(&question) {
            TimeoutDecision::WaitLonger
        } else {
            TimeoutDecision::Abort
        }
    }

    fn on_connection_progress(&self, progress: &ConnectionProgress) {
        let mut msg = format!(
            "Connecting to {} (attempt {}/{})",
            progress.target, progress.attempt, progress.max_attempts
        );
        if let Some(error) = &progress.last_error {
            msg = format!("{msg}, last error: {error}");
        }
        self.printer.println(msg);
    }
}
