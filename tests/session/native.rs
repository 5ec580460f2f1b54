//! Native backends against the `sample` debuggee, they need gdb and ptrace permissions.
use crate::common::{current_line, resume_and_wait, TestHooks, TIMEOUT};
use mdbg::debugger::backend::gdb::GdbBackend;
use mdbg::debugger::backend::ptrace::PtraceBackend;
use mdbg::debugger::{
    AttachMode, Backend, BreakpointRequest, Config, ResumeCommand, Session, SessionState,
    StepKind, StopReason, Target,
};
use serial_test::serial;
use std::path::PathBuf;

const SAMPLE_APP: &str = env!("CARGO_BIN_EXE_sample");

fn session_at_line(backend: Box<dyn Backend>, line: u64) -> (Session<TestHooks>, TestHooks) {
    let hooks = TestHooks::default();
    let mut session = Session::new(Config::default(), backend, hooks.clone());
    let id = session
        .add_breakpoint(
            BreakpointRequest::Line {
                file: PathBuf::from("sample.rs"),
                line,
            },
            None,
            0,
        )
        .unwrap();
    session
        .start(AttachMode::Launch, Target::new(SAMPLE_APP))
        .unwrap();
    assert!(session.wait_for_stop(TIMEOUT).unwrap());
    assert_eq!(session.last_stop(), Some(&StopReason::Breakpoint(id)));
    assert_eq!(current_line(&session), Some(line));
    (session, hooks)
}

#[test]
#[serial]
fn test_gdb_breakpoint_step_and_locals() {
    let config = Config::default();
    let (mut session, hooks) = session_at_line(Box::new(GdbBackend::new(&config.gdb)), 16);

    assert_eq!(session.find_watch_item("local.x").unwrap().value, "1");

    resume_and_wait(&mut session, ResumeCommand::Step(StepKind::Over));
    assert_eq!(current_line(&session), Some(17));
    assert_eq!(session.evaluate("y", false).unwrap().value, "3");

    resume_and_wait(&mut session, ResumeCommand::Continue);
    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(session.exit_code(), Some(0));
    assert!(hooks.info.lock().unwrap().states.contains(&SessionState::Stopped));
}

#[test]
#[serial]
fn test_ptrace_breakpoint_and_registers() {
    let config = Config::default();
    let (mut session, _) = session_at_line(Box::new(PtraceBackend::new(&config.ptrace)), 16);

    let registers = session.registers().unwrap();
    assert!(registers.iter().any(|(name, _)| name == "rip"));
    assert!(!session.frames().is_empty());

    resume_and_wait(&mut session, ResumeCommand::Continue);
    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(session.exit_code(), Some(0));
}

#[test]
#[serial]
fn test_ptrace_stop_session_kills_debuggee() {
    let config = Config::default();
    let (mut session, _) = session_at_line(Box::new(PtraceBackend::new(&config.ptrace)), 16);
    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Finished);
    assert!(session.threads().is_empty());
}
