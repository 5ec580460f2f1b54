use crate::common::{current_line, resume_and_wait, script, temp_path, test_config, TestHooks};
use mdbg::debugger::backend::remote::RemoteBackend;
use mdbg::debugger::backend::script::ScriptBackend;
use mdbg::debugger::config::ScriptSection;
use mdbg::debugger::remote::{Agent, BackendFactory};
use mdbg::debugger::transport::{MemoryTransport, Transport};
use mdbg::debugger::{
    AttachMode, BreakpointRequest, CancellationToken, Error, ResumeCommand, Session, SessionState,
    Target,
};
use serial_test::serial;
use std::fs;
use std::io;
use std::sync::Mutex;
use std::thread;

#[test]
#[serial]
fn test_remote_session_over_memory_transport() {
    let root = temp_path("agent-root");
    let _ = fs::remove_dir_all(&root);
    fs::create_dir_all(&root).unwrap();

    let (host, agent_end) = MemoryTransport::pair();
    let cancel = CancellationToken::new();
    let agent = {
        let cancel = cancel.clone();
        let root = root.clone();
        thread::spawn(move || {
            let factory: BackendFactory =
                Box::new(|| Box::new(ScriptBackend::new(&ScriptSection::default())));
            let mut agent = Agent::new(Box::new(agent_end), root, factory);
            agent.serve(&cancel)
        })
    };

    let host = Mutex::new(Some(host));
    let config = test_config();
    let backend = RemoteBackend::new(
        &config.remote,
        "memory",
        Box::new(move || {
            host.lock()
                .unwrap()
                .take()
                .map(|t| Box::new(t) as Box<dyn Transport>)
                .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))
        }),
    );
    let hooks = TestHooks::default();
    let mut session = Session::new(config, Box::new(backend), hooks.clone());
    session
        .add_breakpoint(BreakpointRequest::Function("add".to_string()), None, 0)
        .unwrap();
    session
        .start(AttachMode::AttachToRemote, Target::new(script("calc.mds")))
        .unwrap();
    assert!(session.wait_for_stop(crate::common::TIMEOUT).unwrap());

    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(current_line(&session), Some(2));
    assert_eq!(session.evaluate("a", false).unwrap().value, "1");
    assert_eq!(hooks.info.lock().unwrap().progress.len(), 1);

    // the program was deployed under the agent root
    let deployed = session.frames()[0].location.file.clone().unwrap();
    assert!(deployed.starts_with(&root) || deployed.is_relative());

    resume_and_wait(&mut session, ResumeCommand::Continue);
    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(session.exit_code(), Some(0));
    assert!(hooks.log_contains("3"));

    drop(session);
    cancel.cancel();
    let _ = agent.join().unwrap();
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn test_connection_attempts_exhausted() {
    let mut config = test_config();
    config.remote.max_attempts = 2;
    config.remote.retry_interval_ms = 1;
    let backend = RemoteBackend::new(
        &config.remote,
        "nowhere",
        Box::new(|| Err(io::Error::from(io::ErrorKind::ConnectionRefused))),
    );
    let hooks = TestHooks::default();
    let mut session = Session::new(config, Box::new(backend), hooks.clone());

    let err = session
        .start(AttachMode::AttachToRemote, Target::new(script("calc.mds")))
        .unwrap_err();
    match err {
        Error::ConnectionTimeout { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Unstarted);

    let info = hooks.info.lock().unwrap();
    assert_eq!(info.progress.len(), 2);
    assert_eq!(info.progress[1].attempt, 2);
    assert!(info.progress[1].last_error.is_some());
}

#[test]
fn test_cancelled_connection() {
    let config = test_config();
    let backend = RemoteBackend::new(
        &config.remote,
        "nowhere",
        Box::new(|| Err(io::Error::from(io::ErrorKind::ConnectionRefused))),
    );
    let mut session = Session::new(config, Box::new(backend), TestHooks::default());
    session.cancellation_token().cancel();

    let err = session
        .start(AttachMode::AttachToRemote, Target::new(script("calc.mds")))
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(session.state(), SessionState::Unstarted);
    assert!(!session.cancellation_token().is_cancelled());
}
