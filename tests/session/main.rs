mod breakpoints;
mod common;
#[cfg(feature = "int_test")]
mod native;
mod remote;
mod snapshot;
mod steps;
mod watches;

use crate::common::{launch, script_session, test_config, TestHooks, TIMEOUT};
use mdbg::debugger::worker::SessionWorker;
use mdbg::debugger::{AttachMode, Error, ResumeCommand, SessionState, StopReason, Target};
use std::time::Duration;

#[test]
fn test_run_to_completion() {
    let (mut session, hooks) = script_session(test_config());
    launch(&mut session, "calc.mds");

    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(session.exit_code(), Some(0));
    assert!(hooks.log_contains("3"));
    assert!(hooks.log_contains("process exited with code 0"));

    let states = hooks.info.lock().unwrap().states.clone();
    assert_eq!(
        states,
        vec![
            SessionState::Starting,
            SessionState::Running,
            SessionState::Finishing,
            SessionState::Finished
        ]
    );
}

#[test]
fn test_commands_in_wrong_state() {
    let (mut session, _) = script_session(test_config());

    let err = session.resume(ResumeCommand::Continue).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            state: SessionState::Unstarted,
            ..
        }
    ));
    assert!(session.evaluate("x", false).is_err());

    launch(&mut session, "calc.mds");
    assert_eq!(session.state(), SessionState::Finished);

    // a session is started once
    let err = session
        .start(AttachMode::Launch, Target::new("calc.mds"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert!(session.interrupt().is_err());
}

#[test]
fn test_failed_start_may_be_retried() {
    let (mut session, hooks) = script_session(test_config());
    let err = session
        .start(AttachMode::Launch, Target::new("/no/such/program.mds"))
        .unwrap_err();
    assert!(matches!(err, Error::IO(_)));
    assert_eq!(session.state(), SessionState::Unstarted);
    assert_eq!(
        hooks.info.lock().unwrap().states,
        vec![SessionState::Starting, SessionState::Unstarted]
    );

    launch(&mut session, "calc.mds");
    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(session.exit_code(), Some(0));
}

#[test]
fn test_unsupported_attach_mode() {
    let (mut session, _) = script_session(test_config());
    let err = session
        .start(AttachMode::AttachToProcess(1), Target::new("calc.mds"))
        .unwrap_err();
    assert!(matches!(err, Error::NotSupported { .. }));
    // nothing happened, the session may still be started
    assert_eq!(session.state(), SessionState::Unstarted);
}

#[test]
fn test_stop_at_entry_and_stop() {
    let mut config = test_config();
    config.session.stop_at_entry = true;
    let (mut session, hooks) = script_session(config);
    launch(&mut session, "calc.mds");

    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(session.last_stop(), Some(&StopReason::Interrupted));
    assert_eq!(common::current_line(&session), Some(7));
    assert_eq!(hooks.last_stop().unwrap().line, Some(7));

    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Finished);
    assert!(session.threads().is_empty());
    assert_eq!(session.exit_code(), None);
}

#[test]
fn test_worker_drives_session() {
    let (session, hooks) = script_session(test_config());
    let worker = SessionWorker::spawn(session).unwrap();

    worker
        .request(|s| {
            s.add_breakpoint(
                mdbg::debugger::BreakpointRequest::Function("add".to_string()),
                None,
                0,
            )
        })
        .unwrap()
        .unwrap();
    worker
        .request(|s| s.start(AttachMode::Launch, Target::new(common::script("calc.mds"))))
        .unwrap()
        .unwrap();

    // the worker pumps events by itself
    let deadline = std::time::Instant::now() + TIMEOUT;
    while hooks.last_stop().is_none() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    let stop = hooks.last_stop().unwrap();
    assert_eq!(stop.function.as_deref(), Some("add"));
    assert_eq!(
        worker.request(|s| s.state()).unwrap(),
        SessionState::Stopped
    );

    worker.shutdown();
}

#[test]
fn test_hooks_shared_between_sessions() {
    let hooks = std::sync::Arc::new(TestHooks::default());
    for _ in 0..2 {
        let backend = Box::new(mdbg::debugger::backend::script::ScriptBackend::new(
            &test_config().script,
        ));
        let mut session =
            mdbg::debugger::Session::with_shared_hooks(test_config(), backend, hooks.clone());
        session
            .start(AttachMode::Launch, Target::new(common::script("loop.mds")))
            .unwrap();
        assert!(session.wait_for_stop(TIMEOUT).unwrap());
        assert_eq!(session.exit_code(), Some(10));
    }
    let info = hooks.info.lock().unwrap();
    assert_eq!(
        info.states
            .iter()
            .filter(|s| **s == SessionState::Finished)
            .count(),
        2
    );
}
