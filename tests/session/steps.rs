use crate::common::{current_line, launch, resume_and_wait, script, script_session, test_config};
use mdbg::debugger::{
    BreakpointRequest, CancellationToken, Error, ResumeCommand, SessionState, StepKind, StopReason,
};

fn stopped_at_entry(program: &str) -> mdbg::debugger::Session<crate::common::TestHooks> {
    let mut config = test_config();
    config.session.stop_at_entry = true;
    let (mut session, _) = script_session(config);
    launch(&mut session, program);
    assert_eq!(current_line(&session), Some(7));
    session
}

#[test]
fn test_step_into_and_out() {
    let mut session = stopped_at_entry("calc.mds");

    resume_and_wait(&mut session, ResumeCommand::Step(StepKind::Into));
    assert_eq!(current_line(&session), Some(8));
    assert_eq!(session.last_stop(), Some(&StopReason::Step));

    resume_and_wait(&mut session, ResumeCommand::Step(StepKind::Into));
    assert_eq!(current_line(&session), Some(2));
    assert_eq!(session.frames().len(), 2);
    assert_eq!(
        session.frames()[0].location.function.as_deref(),
        Some("add")
    );

    resume_and_wait(&mut session, ResumeCommand::Step(StepKind::Out));
    assert_eq!(current_line(&session), Some(10));
    assert_eq!(session.frames().len(), 1);
}

#[test]
fn test_step_over() {
    let mut session = stopped_at_entry("calc.mds");

    resume_and_wait(&mut session, ResumeCommand::Step(StepKind::Over));
    assert_eq!(current_line(&session), Some(8));
    // the call of `add` is stepped over
    resume_and_wait(&mut session, ResumeCommand::Step(StepKind::Over));
    assert_eq!(current_line(&session), Some(10));
    assert_eq!(session.frames().len(), 1);
    assert_eq!(session.evaluate("y", false).unwrap().value, "3");
}

#[test]
fn test_run_to_line_and_function() {
    let mut session = stopped_at_entry("calc.mds");

    resume_and_wait(
        &mut session,
        ResumeCommand::RunToFunction("add".to_string()),
    );
    assert_eq!(current_line(&session), Some(2));

    resume_and_wait(
        &mut session,
        ResumeCommand::RunToLine {
            file: script("calc.mds"),
            line: 12,
        },
    );
    assert_eq!(current_line(&session), Some(12));
    assert_eq!(session.frames()[0].location.function.as_deref(), Some("main"));
}

#[test]
fn test_select_frame() {
    let (mut session, _) = script_session(test_config());
    session
        .add_breakpoint(BreakpointRequest::Function("add".to_string()), None, 0)
        .unwrap();
    launch(&mut session, "calc.mds");

    assert_eq!(session.current_frame(), 0);
    assert!(session.evaluate("a", false).unwrap().in_scope);

    session.select_frame(1).unwrap();
    assert_eq!(session.current_frame(), 1);
    assert_eq!(session.evaluate("x", false).unwrap().value, "1");
    assert!(session.find_watch_item("local.x").is_some());
    assert!(session.find_watch_item("local.a").is_none());

    assert!(matches!(session.select_frame(7), Err(Error::NotFound(_))));
    assert_eq!(session.current_frame(), 1);
}

#[test]
fn test_threads() {
    let (mut session, _) = script_session(test_config());
    session
        .add_breakpoint(
            BreakpointRequest::Line {
                file: script("threads.mds"),
                line: 11,
            },
            None,
            0,
        )
        .unwrap();
    launch(&mut session, "threads.mds");

    assert_eq!(session.threads().len(), 2);
    let main = session.current_thread().unwrap();
    let worker = session
        .threads()
        .iter()
        .map(|t| t.id)
        .find(|id| *id != main)
        .unwrap();

    session.select_thread(worker).unwrap();
    assert_eq!(session.current_thread(), Some(worker));
    assert_eq!(
        session.frames()[0].location.function.as_deref(),
        Some("worker")
    );
    assert!(session.threads().iter().any(|t| t.id == worker && t.is_current));

    let reload = session.reload_stack(&CancellationToken::new()).unwrap();
    assert!(reload.complete);
    assert!(reload.threads.iter().all(|t| !t.frames.is_empty()));

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let reload = session.reload_stack(&cancelled).unwrap();
    assert!(!reload.complete);

    session.select_thread(main).unwrap();
    resume_and_wait(&mut session, ResumeCommand::Continue);
    assert_eq!(session.state(), SessionState::Finished);
}

#[test]
fn test_interrupt_long_loop() {
    let (mut session, _) = script_session(test_config());
    session
        .start(
            mdbg::debugger::AttachMode::Launch,
            mdbg::debugger::Target::new(script("threads.mds")),
        )
        .unwrap();
    // the program may already be gone
    match session.interrupt() {
        Ok(()) => {
            assert!(session.wait_for_stop(crate::common::TIMEOUT).unwrap());
            if session.state() == SessionState::Stopped {
                assert_eq!(session.last_stop(), Some(&StopReason::Interrupted));
            }
        }
        Err(e) => assert!(matches!(
            e,
            Error::InvalidState { .. } | Error::BackendRejected { .. }
        )),
    }
}

#[test]
fn test_registers_and_memory() {
    let mut session = stopped_at_entry("calc.mds");
    let registers = session.registers().unwrap();
    assert!(registers.iter().count() > 0);
    assert_eq!(session.read_memory(0, 4).unwrap().len(), 4);
}
