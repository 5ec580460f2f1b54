use mdbg::debugger::backend::script::ScriptBackend;
use mdbg::debugger::{
    AttachMode, BreakpointId, Config, ConnectionProgress, EventHook, Frame, Resolution, Session,
    SessionState, StopReason, Target, ThreadId, WatchItem,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct StopInfo {
    pub thread: ThreadId,
    pub line: Option<u64>,
    pub function: Option<String>,
    pub reason: StopReason,
}

#[derive(Debug, Default)]
pub struct TestInfo {
    pub states: Vec<SessionState>,
    pub resolutions: Vec<(BreakpointId, Resolution)>,
    pub stops: Vec<StopInfo>,
    pub log: Vec<String>,
    pub progress: Vec<ConnectionProgress>,
    pub watch_updates: usize,
}

/// Hook that records everything the session reports.
#[derive(Clone, Default)]
pub struct TestHooks {
    pub info: Arc<Mutex<TestInfo>>,
}

impl TestHooks {
    pub fn last_stop(&self) -> Option<StopInfo> {
        self.info.lock().unwrap().stops.last().cloned()
    }

    pub fn log_contains(&self, line: &str) -> bool {
        self.info.lock().unwrap().log.iter().any(|l| l == line)
    }
}

impl EventHook for TestHooks {
    fn on_state_changed(&self, _: SessionState, new: SessionState) {
        self.info.lock().unwrap().states.push(new);
    }

    fn on_breakpoint_resolved(&self, id: BreakpointId, resolution: &Resolution) {
        self.info
            .lock()
            .unwrap()
            .resolutions
            .push((id, resolution.clone()));
    }

    fn on_stop(
        &self,
        thread: ThreadId,
        frame: Option<&Frame>,
        reason: &StopReason,
    ) -> anyhow::Result<()> {
        self.info.lock().unwrap().stops.push(StopInfo {
            thread,
            line: frame.and_then(|f| f.location.line),
            function: frame.and_then(|f| f.location.function.clone()),
            reason: reason.clone(),
        });
        Ok(())
    }

    fn on_watch_updated(&self, _: &[WatchItem]) {
        self.info.lock().unwrap().watch_updates += 1;
    }

    fn on_log_line(&self, line: &str) {
        self.info.lock().unwrap().log.push(line.to_string());
    }

    fn on_connection_progress(&self, progress: &ConnectionProgress) {
        self.info.lock().unwrap().progress.push(progress.clone());
    }
}

pub fn script(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("scripts")
        .join(name)
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.session.poll_interval_ms = 5;
    config
}

/// Unstarted session over the script backend.
pub fn script_session(config: Config) -> (Session<TestHooks>, TestHooks) {
    let hooks = TestHooks::default();
    let backend = Box::new(ScriptBackend::new(&config.script));
    let session = Session::new(config, backend, hooks.clone());
    (session, hooks)
}

/// Launch `program` and wait for the first stop (or the end).
pub fn launch(session: &mut Session<TestHooks>, program: &str) {
    session
        .start(AttachMode::Launch, Target::new(script(program)))
        .unwrap();
    assert!(session.wait_for_stop(TIMEOUT).unwrap());
}

pub fn resume_and_wait(session: &mut Session<TestHooks>, command: mdbg::debugger::ResumeCommand) {
    session.resume(command).unwrap();
    assert!(session.wait_for_stop(TIMEOUT).unwrap());
}

/// Line of the current frame.
pub fn current_line(session: &Session<TestHooks>) -> Option<u64> {
    session.frames().first().and_then(|f| f.location.line)
}

pub fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("mdbg-test-{}-{name}", std::process::id()))
}
