//! Dedicated session thread and the handle other threads use to reach it.
//!
//! A session is driven by one thread only: commands are shipped to it as closures and results come
//! back through a per-command reply channel. Between commands the worker pumps backend events.
use crate::debugger::cancel::CancellationToken;
use crate::debugger::error::Error;
use crate::debugger::session::Session;
use crate::debugger::EventHook;
use crate::muted_error;
use log::{debug, warn};
use std::any::Any;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Reply = Box<dyn Any + Send + 'static>;
type Task<H> = Box<dyn FnOnce(&mut Session<H>) -> Reply + Send>;

enum Request<H: EventHook + Send + Sync + 'static> {
    Task(Task<H>, mpsc::SyncSender<Reply>),
    Exit,
}

/// Owner of the session thread.
pub struct SessionWorker<H: EventHook + Send + Sync + 'static> {
    requests: Sender<Request<H>>,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl<H: EventHook + Send + Sync + 'static> SessionWorker<H> {
    /// Move `session` onto a new thread.
    ///
    /// Backends that bind the debuggee to one OS thread (ptrace) create it on `start`, so the
    /// session must be started through the worker, not before.
    pub fn spawn(session: Session<H>) -> Result<Self, Error> {
        let (tx, rx) = mpsc::channel();
        let cancel = session.cancellation_token();
        let thread = thread::Builder::new()
            .name(format!("mdbg-session-{}", session.id().simple()))
            .spawn(move || run(session, rx))?;

        Ok(Self {
            requests: tx,
            cancel,
            thread: Some(thread),
        })
    }

    /// Run `f` on the session thread and wait for its result.
    pub fn request<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session<H>) -> T + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let task: Task<H> = Box::new(move |session| Box::new(f(session)) as Reply);
        self.requests
            .send(Request::Task(task, reply_tx))
            .map_err(|_| Error::WorkerStopped)?;
        let reply = reply_rx.recv().map_err(|_| Error::WorkerStopped)?;
        reply
            .downcast::<T>()
            .map(|t| *t)
            .map_err(|_| Error::WorkerStopped)
    }

    /// Cancel long running session operations (connection attempts, stack reloads).
    ///
    /// The token is shared with the session, so this works while the worker is busy.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the worker. The session is dropped on its own thread, which terminates the debuggee.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.requests.send(Request::Exit);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(target: "session", "session worker panicked");
            }
        }
    }
}

impl<H: EventHook + Send + Sync + 'static> Drop for SessionWorker<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<H: EventHook + Send + Sync + 'static>(mut session: Session<H>, requests: Receiver<Request<H>>) {
    let poll = session.config().poll_interval();
    debug!(target: "session", "worker of session {} started", session.id());

    loop {
        match requests.recv_timeout(poll) {
            Ok(Request::Task(task, reply)) => {
                let result = task(&mut session);
                // the requester may have gone away, nothing to do then
                let _ = reply.send(result);
            }
            Ok(Request::Exit) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        muted_error!(session.pump(Duration::ZERO), "pump events:");
    }

    debug!(target: "session", "worker of session {} stopped", session.id());
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::backend::script::ScriptBackend;
    use crate::debugger::backend::{AttachMode, Target};
    use crate::debugger::config::Config;
    use crate::debugger::state::SessionState;
    use crate::debugger::NopHook;

    #[test]
    fn test_requests_run_on_worker_thread() {
        let config = Config::default();
        let session = Session::new(
            config.clone(),
            Box::new(ScriptBackend::new(&config.script)),
            NopHook,
        );
        let worker = SessionWorker::spawn(session).unwrap();

        let caller = thread::current().id();
        let (state, on_worker) = worker
            .request(move |s| (s.state(), thread::current().id() != caller))
            .unwrap();
        assert_eq!(state, SessionState::Unstarted);
        assert!(on_worker);

        let err = worker
            .request(|s| s.resume(crate::debugger::command::ResumeCommand::Continue))
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        let err = worker
            .request(|s| s.start(AttachMode::Launch, Target::new("/nonexistent/prog.mds")))
            .unwrap()
            .unwrap_err();
        assert!(!matches!(err, Error::WorkerStopped));
        let state = worker.request(|s| s.state()).unwrap();
        assert_eq!(state, SessionState::Crashed);

        worker.shutdown();
    }
}
