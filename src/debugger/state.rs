//! Session lifecycle.
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Session state.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unstarted,
    Starting,
    Running,
    Stopped,
    Finishing,
    Finished,
    Crashed,
}

impl SessionState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Crashed)
    }
}

/// Inputs that drive the state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Transition {
    /// Start-session command.
    Start,
    /// Backend reports that the debuggee exists and is held.
    Ready,
    /// Any stop event (breakpoint, step, signal, interrupt, entry).
    Stop,
    /// Backend running event following a resume command.
    Resume,
    /// Debuggee exit or stop-session.
    Exit,
    /// Teardown done.
    Finish,
    /// Start failed before the debuggee became ready, the session may be started again.
    Abort,
    /// Transport loss or backend failure.
    Crash,
}

impl SessionState {
    /// Return the next state for `input`, `None` if the input is not legal in this state.
    pub fn next(self, input: Transition) -> Option<SessionState> {
        use SessionState::*;
        use Transition::*;

        let next = match (self, input) {
            (Unstarted, Start) => Starting,
            (Starting, Ready) => Running,
            (Starting, Abort) => Unstarted,
            (Running, Stop) => Stopped,
            (Stopped, Resume) => Running,
            (Running | Stopped | Starting, Exit) => Finishing,
            (Finishing, Finish) => Finished,
            (state, Crash) if !state.is_terminal() => Crashed,
            _ => return None,
        };
        Some(next)
    }
}

/// State holder with transition bookkeeping.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: SessionState,
    reached_running: bool,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: SessionState::Unstarted,
            reached_running: false,
            started_at: None,
            stopped_at: None,
        }
    }
}

impl StateMachine {
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True if the session has been in `Running` state at least once.
    pub fn reached_running(&self) -> bool {
        self.reached_running
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.stopped_at
    }

    /// Apply an input. Illegal inputs are logged and ignored, state is never corrupted.
    ///
    /// Returns `(old, new)` if the state changed.
    pub fn apply(&mut self, input: Transition) -> Option<(SessionState, SessionState)> {
        let old = self.state;
        let Some(new) = old.next(input) else {
            warn!(target: "session", "ignore `{input}` event in {old} state");
            return None;
        };

        debug!(target: "session", "state transition {old} -> {new} ({input})");
        self.state = new;
        match new {
            SessionState::Starting => self.started_at = Some(Utc::now()),
            SessionState::Running => self.reached_running = true,
            SessionState::Finished | SessionState::Crashed => self.stopped_at = Some(Utc::now()),
            _ => {}
        }
        Some((old, new))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use SessionState::*;
    use Transition::*;

    #[test]
    fn test_transition_table() {
        struct TestCase {
            from: SessionState,
            input: Transition,
            to: Option<SessionState>,
        }

        let cases = vec![
            TestCase { from: Unstarted, input: Start, to: Some(Starting) },
            TestCase { from: Starting, input: Ready, to: Some(Running) },
            TestCase { from: Running, input: Stop, to: Some(Stopped) },
            TestCase { from: Stopped, input: Resume, to: Some(Running) },
            TestCase { from: Running, input: Exit, to: Some(Finishing) },
            TestCase { from: Stopped, input: Exit, to: Some(Finishing) },
            TestCase { from: Finishing, input: Finish, to: Some(Finished) },
            TestCase { from: Starting, input: Abort, to: Some(Unstarted) },
            TestCase { from: Starting, input: Crash, to: Some(Crashed) },
            TestCase { from: Running, input: Abort, to: None },
            TestCase { from: Stopped, input: Crash, to: Some(Crashed) },
            TestCase { from: Unstarted, input: Stop, to: None },
            TestCase { from: Starting, input: Stop, to: None },
            TestCase { from: Running, input: Resume, to: None },
            TestCase { from: Stopped, input: Stop, to: None },
            TestCase { from: Finished, input: Crash, to: None },
            TestCase { from: Crashed, input: Start, to: None },
            TestCase { from: Finished, input: Start, to: None },
        ];

        for tc in cases {
            assert_eq!(tc.from.next(tc.input), tc.to, "{} + {}", tc.from, tc.input);
        }
    }

    #[test]
    fn test_illegal_input_is_ignored() {
        let mut sm = StateMachine::default();
        assert_eq!(sm.apply(Stop), None);
        assert_eq!(sm.state(), Unstarted);

        assert_eq!(sm.apply(Start), Some((Unstarted, Starting)));
        assert!(sm.started_at().is_some());
        assert!(!sm.reached_running());
        assert_eq!(sm.apply(Resume), None);
        assert_eq!(sm.state(), Starting);

        sm.apply(Ready);
        assert!(sm.reached_running());
        sm.apply(Stop);
        sm.apply(Exit);
        sm.apply(Finish);
        assert_eq!(sm.state(), Finished);
        assert!(sm.stopped_at().is_some());
        assert_eq!(sm.apply(Crash), None);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(Stopped.to_string(), "stopped");
        assert_eq!("finishing".parse::<SessionState>().unwrap(), Finishing);
    }
}
