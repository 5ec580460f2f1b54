use crate::common::{
    current_line, launch, resume_and_wait, script, script_session, temp_path, test_config,
    TestHooks,
};
use mdbg::debugger::{
    BackendVariant, BreakpointRequest, Error, ResumeCommand, Session, SessionState, StopReason,
};
use serial_test::serial;
use std::fs;
use std::sync::Arc;

fn stopped_in_main() -> (Session<TestHooks>, TestHooks) {
    let (mut session, hooks) = script_session(test_config());
    session
        .add_breakpoint(
            BreakpointRequest::Line {
                file: script("calc.mds"),
                line: 12,
            },
            None,
            0,
        )
        .unwrap();
    launch(&mut session, "calc.mds");
    assert_eq!(session.state(), SessionState::Stopped);
    (session, hooks)
}

#[test]
#[serial]
fn test_snapshot_round_trip() {
    let (mut session, _) = stopped_in_main();
    session.add_watch("y * 2", false).unwrap();
    session.expand("local.p").unwrap();

    let path = temp_path("round-trip.mdsnap");
    let written = session.create_snapshot(Some(&path)).unwrap();
    assert_eq!(written, path);

    // the live session is untouched
    assert_eq!(session.state(), SessionState::Stopped);
    resume_and_wait(&mut session, ResumeCommand::Continue);
    assert_eq!(session.state(), SessionState::Finished);

    let hooks = Arc::new(TestHooks::default());
    let mut replay = Session::open_snapshot(test_config(), &path, hooks.clone()).unwrap();
    assert_eq!(replay.variant(), BackendVariant::Replay);
    assert_eq!(replay.state(), SessionState::Stopped);
    assert_eq!(replay.last_stop(), Some(&StopReason::Snapshot));
    assert_eq!(current_line(&replay), Some(12));
    assert_eq!(hooks.last_stop().unwrap().reason, StopReason::Snapshot);

    assert_eq!(replay.find_watch_item("local.y").unwrap().value, "3");
    let children = replay.expand("local.p").unwrap();
    assert_eq!(children.len(), 2);
    assert_eq!(replay.evaluate("y * 2", false).unwrap().value, "6");

    assert!(!replay.capabilities().resumable);
    assert!(matches!(
        replay.resume(ResumeCommand::Continue),
        Err(Error::NotSupported { .. })
    ));

    replay.stop().unwrap();
    assert_eq!(replay.state(), SessionState::Finished);
    fs::remove_file(path).unwrap();
}

#[test]
#[serial]
fn test_snapshot_into_directory() {
    let dir = temp_path("snapshots");
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();

    let mut config = test_config();
    config.snapshot.directory = dir.clone();
    let (mut session, _) = script_session(config);
    session
        .add_breakpoint(BreakpointRequest::Function("add".to_string()), None, 0)
        .unwrap();
    launch(&mut session, "calc.mds");

    let path = session.create_snapshot(None).unwrap();
    assert!(path.starts_with(&dir));
    assert!(path.exists());
    fs::remove_dir_all(dir).unwrap();
}

#[test]
#[serial]
fn test_reload_snapshot_replaces_debuggee() {
    let (mut session, hooks) = stopped_in_main();
    let path = temp_path("reload.mdsnap");
    session.create_snapshot(Some(&path)).unwrap();

    session.reload_snapshot(&path).unwrap();
    assert_eq!(session.variant(), BackendVariant::Replay);
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(session.last_stop(), Some(&StopReason::Snapshot));
    assert_eq!(hooks.last_stop().unwrap().reason, StopReason::Snapshot);
    assert_eq!(current_line(&session), Some(12));
    assert!(session.resume(ResumeCommand::Continue).is_err());
    fs::remove_file(path).unwrap();
}

#[test]
#[serial]
fn test_corrupt_snapshot() {
    let path = temp_path("corrupt.mdsnap");
    fs::write(&path, "definitely not a snapshot\n").unwrap();

    let err = Session::open_snapshot(test_config(), &path, Arc::new(TestHooks::default()))
        .err()
        .unwrap();
    assert!(matches!(err, Error::ArtifactCorrupt { .. }));

    let missing = temp_path("missing.mdsnap");
    let err = Session::open_snapshot(test_config(), &missing, Arc::new(TestHooks::default()))
        .err()
        .unwrap();
    assert!(matches!(err, Error::ArtifactCorrupt { .. }));
    fs::remove_file(path).unwrap();
}

#[test]
fn test_snapshot_needs_stopped_session() {
    let (mut session, _) = script_session(test_config());
    let err = session
        .create_snapshot(Some(&temp_path("never.mdsnap")))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
}

#[test]
#[serial]
fn test_snapshot_leaves_live_threads_untouched() {
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
    let main = session.current_thread().unwrap();
    let worker = session
        .threads()
        .iter()
        .map(|t| t.id)
        .find(|id| *id != main)
        .unwrap();
    let threads = session.threads().to_vec();
    assert!(threads.iter().any(|t| t.id == worker && t.frames.is_empty()));

    let path = temp_path("threads.mdsnap");
    session.create_snapshot(Some(&path)).unwrap();
    assert_eq!(session.threads(), threads.as_slice());

    // the artifact still carries the frames of every thread
    let mut replay =
        Session::open_snapshot(test_config(), &path, Arc::new(TestHooks::default())).unwrap();
    replay.select_thread(worker).unwrap();
    assert_eq!(
        replay.frames()[0].location.function.as_deref(),
        Some("worker")
    );
    fs::remove_file(path).unwrap();
}
