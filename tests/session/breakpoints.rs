use crate::common::{
    current_line, launch, resume_and_wait, script, script_session, test_config,
};
use mdbg::debugger::{
    BreakpointId, BreakpointRequest, Error, Resolution, ResumeCommand, SessionState, StopReason,
};

fn line(program: &str, line: u64) -> BreakpointRequest {
    BreakpointRequest::Line {
        file: script(program),
        line,
    }
}

#[test]
fn test_line_breakpoint_moves_to_code() {
    let (mut session, hooks) = script_session(test_config());
    let id = session
        .add_breakpoint(line("calc.mds", 9), None, 0)
        .unwrap();
    assert_eq!(id, BreakpointId(1));
    // nothing is installed before start
    assert!(session.breakpoint(id).unwrap().obtained.is_none());

    launch(&mut session, "calc.mds");
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(session.last_stop(), Some(&StopReason::Breakpoint(id)));
    assert_eq!(current_line(&session), Some(10));

    let bp = session.breakpoint(id).unwrap();
    assert_eq!(bp.hit_count, 1);
    assert_eq!(bp.obtained.as_ref().and_then(|l| l.line), Some(10));

    let resolutions = hooks.info.lock().unwrap().resolutions.clone();
    assert_eq!(resolutions.len(), 1);
    match &resolutions[0] {
        (rid, Resolution::Adjusted { obtained, .. }) => {
            assert_eq!(*rid, id);
            assert_eq!(obtained.line, Some(10));
        }
        other => panic!("unexpected resolution: {other:?}"),
    }

    resume_and_wait(&mut session, ResumeCommand::Continue);
    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(session.exit_code(), Some(0));
}

#[test]
fn test_pending_breakpoint_in_module() {
    let (mut session, hooks) = script_session(test_config());
    let id = session
        .add_breakpoint(BreakpointRequest::Function("square".to_string()), None, 0)
        .unwrap();
    launch(&mut session, "modules.mds");

    assert_eq!(session.last_stop(), Some(&StopReason::Breakpoint(id)));
    let stop = hooks.last_stop().unwrap();
    assert_eq!(stop.function.as_deref(), Some("square"));
    assert_eq!(stop.line, Some(3));

    let resolutions = hooks.info.lock().unwrap().resolutions.clone();
    assert!(matches!(resolutions.first(), Some((_, Resolution::Failed(_)))));
    assert!(matches!(resolutions.last(), Some((_, Resolution::Exact(_)))));

    resume_and_wait(&mut session, ResumeCommand::Continue);
    assert_eq!(session.exit_code(), Some(4));
}

#[test]
fn test_condition_and_ignore_count() {
    let (mut session, _) = script_session(test_config());
    session
        .add_breakpoint(line("loop.mds", 4), Some("i >= 5".to_string()), 1)
        .unwrap();
    launch(&mut session, "loop.mds");

    assert_eq!(current_line(&session), Some(4));
    let i = session.evaluate("i", false).unwrap();
    assert_eq!(i.value, "6");
}

#[test]
fn test_disable_enable_delete() {
    let (mut session, _) = script_session(test_config());
    let id = session
        .add_breakpoint(line("loop.mds", 4), None, 0)
        .unwrap();
    launch(&mut session, "loop.mds");
    assert_eq!(session.evaluate("i", false).unwrap().value, "0");

    resume_and_wait(&mut session, ResumeCommand::Continue);
    assert_eq!(session.evaluate("i", false).unwrap().value, "1");
    assert_eq!(session.breakpoint(id).unwrap().hit_count, 2);

    session.disable_breakpoint(id).unwrap();
    assert!(!session.breakpoint(id).unwrap().enabled);
    assert!(session.breakpoint(id).unwrap().obtained.is_none());
    session.enable_breakpoint(id).unwrap();
    assert!(session.breakpoint(id).unwrap().obtained.is_some());

    resume_and_wait(&mut session, ResumeCommand::Continue);
    assert_eq!(session.evaluate("i", false).unwrap().value, "2");

    session.delete_breakpoint(id).unwrap();
    assert!(session.breakpoint(id).is_none());
    assert!(matches!(
        session.delete_breakpoint(id),
        Err(Error::NotFound(_))
    ));

    resume_and_wait(&mut session, ResumeCommand::Continue);
    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(session.exit_code(), Some(10));
}

#[test]
fn test_breakpoint_added_while_stopped() {
    let mut config = test_config();
    config.session.stop_at_entry = true;
    let (mut session, _) = script_session(config);
    launch(&mut session, "calc.mds");

    let id = session
        .add_breakpoint(BreakpointRequest::Function("add".to_string()), None, 0)
        .unwrap();
    assert!(session.breakpoint(id).unwrap().obtained.is_some());

    resume_and_wait(&mut session, ResumeCommand::Continue);
    assert_eq!(session.last_stop(), Some(&StopReason::Breakpoint(id)));
    assert_eq!(current_line(&session), Some(2));
}

#[test]
fn test_unresolvable_breakpoint() {
    let (mut session, hooks) = script_session(test_config());
    let id = session
        .add_breakpoint(BreakpointRequest::Function("nope".to_string()), None, 0)
        .unwrap();
    launch(&mut session, "calc.mds");

    // the program runs to the end, the breakpoint stays pending
    assert_eq!(session.state(), SessionState::Finished);
    let resolutions = hooks.info.lock().unwrap().resolutions.clone();
    assert!(resolutions
        .iter()
        .all(|(rid, r)| *rid == id && matches!(r, Resolution::Failed(_))));
    assert!(session.breakpoint(id).unwrap().obtained.is_none());
}
