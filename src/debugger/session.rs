//! Debug session: owns a backend and drives it through the session state machine.
use crate::debugger::backend::replay::ReplayBackend;
use crate::debugger::backend::{
    AttachMode, Backend, BackendVariant, Capabilities, FrameRef, Target,
};
use crate::debugger::breakpoint::{
    Breakpoint, BreakpointId, BreakpointRequest, BreakpointSynchronizer,
};
use crate::debugger::cancel::CancellationToken;
use crate::debugger::command::ResumeCommand;
use crate::debugger::config::Config;
use crate::debugger::connect::ConnectionStarter;
use crate::debugger::error::Error;
use crate::debugger::event::{DebugEvent, StopReason};
use crate::debugger::location::{Frame, Location};
use crate::debugger::register::RegisterSet;
use crate::debugger::snapshot::{LocalsRecord, MemoryRecord, MemoryTracker, Snapshot, ThreadRecord};
use crate::debugger::state::{SessionState, StateMachine, Transition};
use crate::debugger::thread::{Thread, ThreadId};
use crate::debugger::variable::dumper::{DumperRegistry, MemoryReader};
use crate::debugger::variable::format::FormatHint;
use crate::debugger::variable::value::Variable;
use crate::debugger::variable::{InspectionPipeline, InspectionSource, WatchItem};
use crate::debugger::EventHook;
use crate::{muted_error, weak_error};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, error, info, trace, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Events handled by one `pump` call at most, keeps a chatty backend from starving commands.
const MAX_EVENTS_PER_PUMP: usize = 256;

/// Result of a full stack reload.
#[derive(Clone, Debug, PartialEq)]
pub struct StackReload {
    pub threads: Vec<Thread>,
    /// False if the reload was cancelled before every thread was visited.
    pub complete: bool,
}

/// Inspection queries routed to the backend, memory reads are remembered for snapshots.
struct SessionSource<'a> {
    backend: &'a mut dyn Backend,
    tracker: &'a mut MemoryTracker,
    stopped: bool,
}

impl SessionSource<'_> {
    fn check(&self, command: &'static str) -> Result<(), Error> {
        if !self.stopped {
            return Err(Error::NotSupported {
                command,
                reason: "debuggee is not stopped".to_string(),
            });
        }
        Ok(())
    }
}

impl MemoryReader for SessionSource<'_> {
    fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>, Error> {
        self.check("read-memory")?;
        let bytes = self.backend.read_memory(address, len)?;
        self.tracker.record(address, bytes.len());
        Ok(bytes)
    }
}

impl InspectionSource for SessionSource<'_> {
    fn locals(&mut self, frame: FrameRef) -> Result<Vec<Variable>, Error> {
        self.check("locals")?;
        self.backend.locals(frame)
    }

    fn evaluate(&mut self, frame: FrameRef, expression: &str) -> Result<Variable, Error> {
        self.check("evaluate")?;
        self.backend.evaluate(frame, expression)
    }

    fn children(&mut self, frame: FrameRef, parent: &Variable) -> Result<Vec<Variable>, Error> {
        self.check("children")?;
        self.backend.children(frame, parent)
    }

    fn may_have_side_effects(&self, expression: &str) -> bool {
        self.backend.may_have_side_effects(expression)
    }
}

/// Map of expanded parent expression to its captured children.
fn collect_expanded(items: &[WatchItem], out: &mut IndexMap<String, Vec<Variable>>) {
    for item in items {
        let (Some(children), Some(raw)) = (&item.children, item.raw()) else {
            continue;
        };
        out.insert(
            raw.expression.clone(),
            children.iter().filter_map(|c| c.raw().cloned()).collect(),
        );
        collect_expanded(children, out);
    }
}

/// One debugging session.
///
/// All debuggee changes arrive as [`DebugEvent`]s through [`Session::pump`], commands only ask
/// the backend to act. Fatal backend errors move the session into [`SessionState::Crashed`],
/// after which every command fails with [`Error::InvalidState`].
pub struct Session<H: EventHook + Send + Sync + 'static> {
    id: Uuid,
    config: Config,
    hooks: Arc<H>,
    backend: Box<dyn Backend>,
    capabilities: Capabilities,
    mode: AttachMode,
    target: Target,
    state: StateMachine,
    breakpoints: BreakpointSynchronizer,
    pipeline: InspectionPipeline,
    tracker: MemoryTracker,
    threads: Vec<Thread>,
    current_thread: Option<ThreadId>,
    current_frame: u32,
    last_stop: Option<StopReason>,
    /// Resume sent, `Running` event not seen yet.
    resume_pending: bool,
    exit_code: Option<i32>,
    cancel: CancellationToken,
}

impl<H: EventHook + Send + Sync + 'static> Session<H> {
    pub fn new(config: Config, backend: Box<dyn Backend>, hooks: H) -> Self {
        Self::with_shared_hooks(config, backend, Arc::new(hooks))
    }

    pub fn with_shared_hooks(config: Config, mut backend: Box<dyn Backend>, hooks: Arc<H>) -> Self {
        let arbiter_hooks = hooks.clone();
        backend.set_timeout_arbiter(Box::new(move |command, waited| {
            arbiter_hooks.on_response_timeout(command, waited)
        }));

        let id = Uuid::new_v4();
        debug!(target: "session", "new session {id} with {} backend", backend.variant());
        Self {
            id,
            capabilities: backend.capabilities(),
            breakpoints: BreakpointSynchronizer::new(config.breakpoints.confirm_adjusted),
            pipeline: InspectionPipeline::new(DumperRegistry::default(), &config.inspection),
            tracker: MemoryTracker::new(
                config.snapshot.max_regions,
                config.snapshot.max_region_size,
            ),
            config,
            hooks,
            backend,
            mode: AttachMode::Launch,
            target: Target::default(),
            state: StateMachine::default(),
            threads: vec![],
            current_thread: None,
            current_frame: 0,
            last_stop: None,
            resume_pending: false,
            exit_code: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Open a snapshot artifact as a detached, non-resumable session stopped at the captured
    /// position.
    pub fn open_snapshot(config: Config, path: &Path, hooks: Arc<H>) -> Result<Self, Error> {
        let snapshot = Snapshot::read(path)?;
        let target = Target::new(snapshot.header.target.clone().unwrap_or_default());
        let backend = Box::new(ReplayBackend::new(snapshot));
        let mut session = Self::with_shared_hooks(config, backend, hooks);
        session.start(AttachMode::Launch, target)?;
        let timeout = session.config.start_timeout();
        session.wait_for_stop(timeout)?;
        Ok(session)
    }

    // ---------------------------------------- accessors ------------------------------------------

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.state()
    }

    pub fn variant(&self) -> BackendVariant {
        self.backend.variant()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn mode(&self) -> &AttachMode {
        &self.mode
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.started_at()
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.state.stopped_at()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn last_stop(&self) -> Option<&StopReason> {
        self.last_stop.as_ref()
    }

    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current_thread
    }

    pub fn current_frame(&self) -> u32 {
        self.current_frame
    }

    /// Frames of the current thread.
    pub fn frames(&self) -> &[Frame] {
        self.current_thread
            .and_then(|id| self.threads.iter().find(|t| t.id == id))
            .map(|t| t.frames.as_slice())
            .unwrap_or_default()
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }

    pub fn breakpoint(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.get(id)
    }

    /// Inspection roots, locals first.
    pub fn watch_items(&self) -> Vec<WatchItem> {
        self.pipeline.roots()
    }

    pub fn find_watch_item(&self, id: &str) -> Option<&WatchItem> {
        self.pipeline.find(id)
    }

    pub fn pipeline_mut(&mut self) -> &mut InspectionPipeline {
        &mut self.pipeline
    }

    /// Token observed by long running operations (connection, stack reload).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ---------------------------------------- internals ------------------------------------------

    fn ensure(&self, command: &'static str, allowed: &[SessionState]) -> Result<(), Error> {
        let state = self.state();
        if !allowed.contains(&state) {
            return Err(Error::InvalidState { command, state });
        }
        Ok(())
    }

    fn ensure_stopped(&self, command: &'static str) -> Result<(), Error> {
        self.ensure(command, &[SessionState::Stopped])
    }

    /// Breakpoint mutation is rejected while starting, finishing, resuming and in terminal states.
    fn ensure_breakpoints_mutable(&self, command: &'static str) -> Result<(), Error> {
        self.ensure(
            command,
            &[
                SessionState::Unstarted,
                SessionState::Running,
                SessionState::Stopped,
            ],
        )?;
        // a resume is sent but not confirmed, the debuggee may already run
        if self.resume_pending {
            return Err(Error::InvalidState {
                command,
                state: SessionState::Running,
            });
        }
        Ok(())
    }

    fn ensure_not_terminal(&self, command: &'static str) -> Result<(), Error> {
        let state = self.state();
        if state.is_terminal() {
            return Err(Error::InvalidState { command, state });
        }
        Ok(())
    }

    fn transition(&mut self, input: Transition) -> Option<(SessionState, SessionState)> {
        let change = self.state.apply(input);
        if let Some((old, new)) = change {
            self.hooks.on_state_changed(old, new);
        }
        change
    }

    /// Move into `Crashed` and release the backend.
    fn crash(&mut self, reason: &Error) {
        error!(target: "session", "session {} crashed: {reason:#}", self.id);
        if self.transition(Transition::Crash).is_some() {
            muted_error!(self.backend.terminate(), "terminate after crash:");
            self.breakpoints.reset_installation();
            self.pipeline.clear();
            self.resume_pending = false;
        }
    }

    /// Crash on fatal errors, pass every result through.
    fn guard<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.crash(e);
            }
        }
        result
    }

    fn source(&mut self) -> (&mut InspectionPipeline, SessionSource<'_>) {
        let stopped = self.state.state() == SessionState::Stopped;
        (
            &mut self.pipeline,
            SessionSource {
                backend: self.backend.as_mut(),
                tracker: &mut self.tracker,
                stopped,
            },
        )
    }

    fn current_frame_ref(&self) -> Option<FrameRef> {
        self.current_thread.map(|thread| FrameRef {
            thread,
            level: self.current_frame,
        })
    }

    fn sync_breakpoints(&mut self) -> Result<(), Error> {
        let hooks = self.hooks.clone();
        let mut confirm = |id: BreakpointId, requested: &BreakpointRequest, obtained: &Location| {
            hooks.on_breakpoint_adjusted(id, requested, obtained)
        };
        let result = self.breakpoints.sync(self.backend.as_mut(), &mut confirm);
        let resolutions = self.guard(result)?;
        for (id, resolution) in &resolutions {
            self.hooks.on_breakpoint_resolved(*id, resolution);
        }
        Ok(())
    }

    /// Apply breakpoint changes now if the backend can take them in the current state.
    fn apply_breakpoints(&mut self) -> Result<(), Error> {
        match self.state() {
            SessionState::Stopped => self.sync_breakpoints(),
            SessionState::Running if self.capabilities.live_breakpoints => self.sync_breakpoints(),
            state => {
                debug!(target: "breakpoint", "breakpoint changes deferred while {state}");
                Ok(())
            }
        }
    }

    fn rebuild_inspection(&mut self) -> Result<(), Error> {
        let Some(frame) = self.current_frame_ref() else {
            return Ok(());
        };
        let (pipeline, mut src) = self.source();
        let result = pipeline.rebuild(&mut src, frame);
        let roots = self.guard(result)?;
        self.hooks.on_watch_updated(&roots);
        Ok(())
    }

    /// Re-read the thread list and the frames of the current thread.
    fn refresh_threads(&mut self, stopped_thread: ThreadId, location: &Location) -> Result<(), Error> {
        let infos = match self.backend.threads() {
            Ok(infos) => infos,
            Err(e) if e.is_fatal() => return self.guard(Err(e)),
            Err(e) => {
                warn!(target: "session", "thread list: {e:#}");
                vec![]
            }
        };
        let mut threads: Vec<Thread> = infos.into_iter().map(Thread::from).collect();
        if !threads.iter().any(|t| t.id == stopped_thread) {
            threads.push(Thread {
                id: stopped_thread,
                label: format!("thread {stopped_thread}"),
                frames: vec![],
                is_current: false,
            });
        }

        let frames = match self.backend.frames(stopped_thread) {
            Ok(frames) if !frames.is_empty() => frames,
            Ok(_) => vec![Frame {
                level: 0,
                location: location.clone(),
            }],
            Err(e) if e.is_fatal() => return self.guard(Err(e)),
            Err(e) => {
                debug!(target: "session", "frames of thread {stopped_thread}: {e}");
                vec![Frame {
                    level: 0,
                    location: location.clone(),
                }]
            }
        };

        for thread in threads.iter_mut() {
            thread.is_current = thread.id == stopped_thread;
            if thread.is_current {
                thread.frames = frames.clone();
            }
        }
        self.threads = threads;
        self.current_thread = Some(stopped_thread);
        self.current_frame = 0;
        Ok(())
    }

    fn report_stop(&mut self, thread: ThreadId, reason: &StopReason) {
        let frame = self
            .frames()
            .iter()
            .find(|f| f.level == self.current_frame)
            .cloned();
        if let Err(e) = self.hooks.on_stop(thread, frame.as_ref(), reason) {
            warn!(target: "session", "stop hook: {:#}", Error::Hook(e));
        }
    }

    // ---------------------------------------- events ---------------------------------------------

    /// Process pending backend events, waiting at most `timeout` for the first one.
    ///
    /// Returns true if at least one event was handled.
    pub fn pump(&mut self, timeout: Duration) -> Result<bool, Error> {
        if matches!(
            self.state(),
            SessionState::Unstarted | SessionState::Finished | SessionState::Crashed
        ) {
            thread::sleep(timeout);
            return Ok(false);
        }

        let mut handled = 0;
        let mut wait = timeout;
        while handled < MAX_EVENTS_PER_PUMP {
            let result = self.backend.next_event(wait);
            let event = match self.guard(result) {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(target: "session", "backend event: {e:#}");
                    break;
                }
            };
            handled += 1;
            wait = Duration::ZERO;
            self.handle_event(event)?;
            if self.state().is_terminal() {
                break;
            }
        }
        Ok(handled > 0)
    }

    /// Pump events until `predicate` holds or `timeout` elapses. Returns the final predicate value.
    pub fn wait_until(
        &mut self,
        timeout: Duration,
        mut predicate: impl FnMut(&Self) -> bool,
    ) -> Result<bool, Error> {
        let deadline = Instant::now() + timeout;
        let tick = self.config.poll_interval().max(Duration::from_millis(1));
        loop {
            if predicate(self) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.pump(tick.min(deadline - now))?;
        }
    }

    /// Wait until the debuggee stops or goes away. A resume the backend has not confirmed yet
    /// does not count as a stop.
    pub fn wait_for_stop(&mut self, timeout: Duration) -> Result<bool, Error> {
        self.wait_until(timeout, |s| match s.state() {
            SessionState::Stopped => !s.resume_pending,
            SessionState::Finished | SessionState::Crashed => true,
            _ => false,
        })
    }

    fn handle_event(&mut self, event: DebugEvent) -> Result<(), Error> {
        trace!(target: "session", "event {event:?} in {} state", self.state());
        match event {
            DebugEvent::Ready { process } => {
                info!(target: "session", "debuggee ready (process {process})");
                if self.transition(Transition::Ready).is_some() {
                    self.on_first_running()?;
                }
            }
            DebugEvent::Running => {
                self.resume_pending = false;
                if self.state() == SessionState::Running {
                    trace!(target: "session", "already running");
                } else {
                    self.transition(Transition::Resume);
                }
            }
            DebugEvent::Stopped {
                thread,
                reason,
                location,
            } => self.on_stopped(thread, reason, location)?,
            DebugEvent::ModuleLoaded { name } | DebugEvent::ModuleUnloaded { name } => {
                debug!(target: "session", "module {name} changed");
                self.breakpoints.on_module_changed();
                self.apply_breakpoints()?;
            }
            DebugEvent::ThreadCreated { thread } => {
                if !self.threads.iter().any(|t| t.id == thread) {
                    self.threads.push(Thread {
                        id: thread,
                        label: format!("thread {thread}"),
                        frames: vec![],
                        is_current: false,
                    });
                }
            }
            DebugEvent::ThreadExited { thread } => {
                self.threads.retain(|t| t.id != thread);
                if self.current_thread == Some(thread) {
                    self.current_thread = self.threads.first().map(|t| t.id);
                }
            }
            DebugEvent::Output(line) => {
                debug!(target: "session", "output: {line}");
                if self.config.session.log_backend_chatter {
                    self.hooks.on_log_line(&line);
                }
            }
            DebugEvent::Exited { code } => {
                info!(target: "session", "debuggee exited with code {code}");
                self.exit_code = Some(code);
                self.hooks
                    .on_log_line(&format!("process exited with code {code}"));
                if self.transition(Transition::Exit).is_some() {
                    self.teardown();
                }
            }
        }
        Ok(())
    }

    /// `Starting -> Running`: install breakpoints, then let the debuggee go (or hold it at entry).
    fn on_first_running(&mut self) -> Result<(), Error> {
        self.sync_breakpoints()?;

        if !self.capabilities.resumable || self.mode.is_post_mortem() {
            // the backend reports the captured stop itself
            return Ok(());
        }
        if self.config.session.stop_at_entry {
            let result = self.backend.interrupt();
            return self.guard(result);
        }

        let result = self.backend.threads();
        let threads = self.guard(result)?;
        let Some(main) = threads.first() else {
            return Err(Error::BackendRejected {
                command: "start".to_string(),
                message: "debuggee has no threads".to_string(),
            });
        };
        let result = self.backend.resume(main.id, &ResumeCommand::Continue);
        self.guard(result)
    }

    fn on_stopped(
        &mut self,
        thread: ThreadId,
        reason: StopReason,
        location: Location,
    ) -> Result<(), Error> {
        if let StopReason::Breakpoint(id) = &reason {
            let id = *id;
            if self.breakpoints.is_stale_hit(id) && self.state() == SessionState::Running {
                debug!(target: "breakpoint", "hit of removed or disabled breakpoint {id}, continue");
                self.sync_breakpoints()?;
                let result = self.backend.resume(thread, &ResumeCommand::Continue);
                return self.guard(result);
            }
            self.breakpoints.record_hit(id);
        }

        self.resume_pending = false;
        if self.transition(Transition::Stop).is_none() {
            return Ok(());
        }
        debug!(target: "session", "stopped at {location} ({reason})");

        self.refresh_threads(thread, &location)?;
        self.sync_breakpoints()?;
        self.rebuild_inspection()?;
        self.report_stop(thread, &reason);
        self.last_stop = Some(reason);
        Ok(())
    }

    /// Debuggee is gone: release it and finish the session.
    fn teardown(&mut self) {
        weak_error!(self.backend.terminate(), "terminate:");
        self.breakpoints.reset_installation();
        self.pipeline.clear();
        self.threads.clear();
        self.current_thread = None;
        self.current_frame = 0;
        self.resume_pending = false;
        self.transition(Transition::Finish);
        self.hooks.on_watch_updated(&self.pipeline.roots());
    }

    // ---------------------------------------- lifecycle ------------------------------------------

    /// Connect the backend, create (or attach) the debuggee and wait for it to become ready.
    ///
    /// A fatal failure moves the session into `Crashed`. After any other failure the session
    /// returns to `Unstarted` and the start may be retried.
    pub fn start(&mut self, mode: AttachMode, target: Target) -> Result<(), Error> {
        self.ensure("start", &[SessionState::Unstarted])?;
        let supported = match &mode {
            AttachMode::Launch | AttachMode::AttachToRemote => true,
            AttachMode::AttachToProcess(_) => self.capabilities.attach_process,
            AttachMode::AttachToCore(_) => self.capabilities.attach_core,
        };
        if !supported {
            return Err(Error::NotSupported {
                command: "start",
                reason: format!("{} backend cannot {mode:?}", self.variant()),
            });
        }

        self.mode = mode;
        self.target = target;
        self.transition(Transition::Start);
        info!(
            target: "session",
            "start {} with {} backend ({:?})",
            self.target.program.display(),
            self.variant(),
            self.mode
        );

        match self.connect_and_start() {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => {
                self.crash(&e);
                Err(e)
            }
            Err(e) => {
                self.abort_start(&e);
                Err(e)
            }
        }
    }

    /// Roll a failed start back to `Unstarted`.
    fn abort_start(&mut self, reason: &Error) {
        if self.state() != SessionState::Starting {
            return;
        }
        warn!(target: "session", "start of session {} failed: {reason:#}", self.id);
        if matches!(reason, Error::Cancelled) {
            self.cancel.reset();
        }
        muted_error!(self.backend.terminate(), "terminate after failed start:");
        self.breakpoints.reset_installation();
        self.pipeline.clear();
        self.threads.clear();
        self.current_thread = None;
        self.current_frame = 0;
        self.resume_pending = false;
        self.transition(Transition::Abort);
    }

    fn connect_and_start(&mut self) -> Result<(), Error> {
        let policy = self.backend.retry_policy();
        let starter = ConnectionStarter::new(policy.max_attempts, policy.interval);
        let description = self.backend.connection_target();
        let hooks = self.hooks.clone();
        let backend = &mut self.backend;
        starter.connect(
            &description,
            &self.cancel,
            |progress| hooks.on_connection_progress(progress),
            |attempt| backend.connect(attempt),
        )?;

        self.backend.start(&self.mode, &self.target)?;

        let timeout = self.config.start_timeout();
        let ready = self.wait_until(timeout, |s| s.state() != SessionState::Starting)?;
        if !ready {
            return Err(Error::ResponseTimeout {
                command: "start".to_string(),
                waited: timeout,
            });
        }
        Ok(())
    }

    /// Stop the session, the debuggee is killed (or detached from).
    pub fn stop(&mut self) -> Result<(), Error> {
        self.ensure(
            "stop",
            &[
                SessionState::Starting,
                SessionState::Running,
                SessionState::Stopped,
            ],
        )?;
        info!(target: "session", "stop session {}", self.id);
        if self.transition(Transition::Exit).is_some() {
            self.teardown();
        }
        Ok(())
    }

    // ---------------------------------------- execution ------------------------------------------

    /// Resume the debuggee. The session moves into `Running` once the backend confirms.
    pub fn resume(&mut self, command: ResumeCommand) -> Result<(), Error> {
        self.ensure_stopped("resume")?;
        if self.resume_pending {
            return Err(Error::InvalidState {
                command: "resume",
                state: SessionState::Running,
            });
        }
        if !self.capabilities.resumable {
            return Err(Error::NotSupported {
                command: "resume",
                reason: "post-mortem sessions cannot run".to_string(),
            });
        }
        let thread = self
            .current_thread
            .ok_or_else(|| Error::NotFound("current thread".to_string()))?;

        debug!(target: "session", "{command} (thread {thread})");
        self.pipeline.invalidate();
        let result = self.backend.resume(thread, &command);
        self.guard(result)?;
        self.resume_pending = true;
        Ok(())
    }

    /// Ask a running debuggee to stop.
    pub fn interrupt(&mut self) -> Result<(), Error> {
        self.ensure("interrupt", &[SessionState::Running])?;
        let result = self.backend.interrupt();
        self.guard(result)
    }

    // ---------------------------------------- breakpoints ----------------------------------------

    pub fn add_breakpoint(
        &mut self,
        request: BreakpointRequest,
        condition: Option<String>,
        ignore_count: u32,
    ) -> Result<BreakpointId, Error> {
        self.ensure_breakpoints_mutable("add-breakpoint")?;
        let id = self.breakpoints.add(request, condition, ignore_count);
        self.apply_breakpoints()?;
        Ok(id)
    }

    pub fn enable_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error> {
        self.ensure_breakpoints_mutable("enable-breakpoint")?;
        self.breakpoints.enable(id)?;
        self.apply_breakpoints()
    }

    pub fn disable_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error> {
        self.ensure_breakpoints_mutable("disable-breakpoint")?;
        self.breakpoints.disable(id)?;
        self.apply_breakpoints()
    }

    pub fn delete_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error> {
        self.ensure_breakpoints_mutable("delete-breakpoint")?;
        self.breakpoints.delete(id)?;
        self.apply_breakpoints()
    }

    // ---------------------------------------- inspection -----------------------------------------

    /// Add a user watch, evaluated at once if the session is stopped.
    pub fn add_watch(&mut self, expression: &str, force: bool) -> Result<WatchItem, Error> {
        self.ensure_not_terminal("add-watch")?;
        let evaluate_now = self.state() == SessionState::Stopped;
        let (pipeline, mut src) = self.source();
        let result = pipeline.add_watch(&mut src, expression, force, evaluate_now);
        let item = self.guard(result)?;
        self.hooks.on_watch_updated(std::slice::from_ref(&item));
        Ok(item)
    }

    pub fn remove_watch(&mut self, id: &str) -> Result<(), Error> {
        self.ensure_not_terminal("remove-watch")?;
        self.pipeline.remove_watch(id)?;
        self.hooks.on_watch_updated(&self.pipeline.roots());
        Ok(())
    }

    /// Populate one level of children of a watch item.
    pub fn expand(&mut self, id: &str) -> Result<Vec<WatchItem>, Error> {
        self.ensure_stopped("expand")?;
        let (pipeline, mut src) = self.source();
        let result = pipeline.expand(&mut src, id);
        let children = self.guard(result)?;
        if let Some(item) = self.pipeline.find(id) {
            self.hooks.on_watch_updated(std::slice::from_ref(item));
        }
        Ok(children)
    }

    pub fn collapse(&mut self, id: &str) -> Result<(), Error> {
        self.ensure_not_terminal("collapse")?;
        self.pipeline.collapse(id)?;
        if let Some(item) = self.pipeline.find(id) {
            self.hooks.on_watch_updated(std::slice::from_ref(item));
        }
        Ok(())
    }

    /// Set (or reset) the sticky format of a type and re-render affected items.
    pub fn set_format(&mut self, type_name: &str, hint: Option<FormatHint>) -> Result<(), Error> {
        self.ensure_not_terminal("set-format")?;
        let (pipeline, mut src) = self.source();
        let result = pipeline.set_format(&mut src, type_name, hint);
        let roots = self.guard(result)?;
        self.hooks.on_watch_updated(&roots);
        Ok(())
    }

    /// One-shot evaluation in the current frame, nothing is stored.
    pub fn evaluate(&mut self, expression: &str, force: bool) -> Result<WatchItem, Error> {
        self.ensure_stopped("evaluate")?;
        let frame = self
            .current_frame_ref()
            .ok_or_else(|| Error::NotFound("current frame".to_string()))?;
        let (pipeline, mut src) = self.source();
        let result = pipeline.evaluate(&mut src, frame, expression, force);
        self.guard(result)
    }

    /// Switch the current thread. Breakpoints are never touched.
    pub fn select_thread(&mut self, id: ThreadId) -> Result<(), Error> {
        self.ensure_stopped("select-thread")?;
        let pos = self
            .threads
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| Error::NotFound(format!("thread {id}")))?;

        let result = self.backend.frames(id);
        let frames = self.guard(result)?;
        for (i, thread) in self.threads.iter_mut().enumerate() {
            thread.is_current = i == pos;
        }
        self.threads[pos].frames = frames;
        self.current_thread = Some(id);
        self.current_frame = 0;
        self.rebuild_inspection()
    }

    pub fn select_frame(&mut self, level: u32) -> Result<(), Error> {
        self.ensure_stopped("select-frame")?;
        if !self.frames().iter().any(|f| f.level == level) {
            return Err(Error::NotFound(format!("frame #{level}")));
        }
        self.current_frame = level;
        self.rebuild_inspection()
    }

    pub fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>, Error> {
        self.ensure_stopped("read-memory")?;
        let (_, mut src) = self.source();
        let result = src.read_memory(address, len);
        self.guard(result)
    }

    pub fn registers(&mut self) -> Result<RegisterSet, Error> {
        self.ensure_stopped("registers")?;
        let thread = self
            .current_thread
            .ok_or_else(|| Error::NotFound("current thread".to_string()))?;
        let result = self.backend.registers(thread);
        self.guard(result)
    }

    /// Re-derive frames of every thread. A cancelled reload keeps what it got so far.
    pub fn reload_stack(&mut self, cancel: &CancellationToken) -> Result<StackReload, Error> {
        self.ensure_stopped("reload-stack")?;
        let mut complete = true;
        for i in 0..self.threads.len() {
            if cancel.is_cancelled() {
                debug!(target: "session", "stack reload cancelled after {i} threads");
                complete = false;
                break;
            }
            let id = self.threads[i].id;
            let result = self.backend.frames(id);
            match self.guard(result) {
                Ok(frames) => self.threads[i].frames = frames,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(target: "session", "frames of thread {id}: {e:#}"),
            }
        }
        Ok(StackReload {
            threads: self.threads.clone(),
            complete,
        })
    }

    // ---------------------------------------- snapshots ------------------------------------------

    fn capture(&mut self) -> Result<Snapshot, Error> {
        let mut snapshot = Snapshot::new(
            self.variant(),
            self.id,
            Some(self.target.program.display().to_string()),
        );
        snapshot.header.current_thread = self.current_thread;

        // frames of other threads go into the snapshot only
        let threads: Vec<_> = self
            .threads
            .iter()
            .map(|t| (t.id, t.label.clone(), t.is_current, t.frames.clone()))
            .collect();
        for (id, label, is_current, mut frames) in threads {
            if frames.is_empty() {
                let result = self.backend.frames(id);
                if let Some(fetched) = muted_error!(self.guard(result)) {
                    frames = fetched;
                }
            }
            let result = self.backend.registers(id);
            let registers = muted_error!(self.guard(result)).unwrap_or_default();
            snapshot.threads.push(ThreadRecord {
                thread: id,
                label,
                is_current,
                frames,
                registers,
            });
        }
        self.ensure_stopped("create-snapshot")?;

        let regions = self.tracker.regions();
        let contents = self.backend.read_memory_many(&regions);
        for ((address, _), bytes) in regions.into_iter().zip(contents) {
            if let Some(bytes) = muted_error!(self.guard(bytes)) {
                snapshot.memory.push(MemoryRecord { address, bytes });
            }
        }

        if let Some(thread) = self.current_thread {
            let levels: Vec<u32> = self.frames().iter().map(|f| f.level).collect();
            for level in levels {
                let frame = FrameRef { thread, level };
                let result = self.backend.locals(frame);
                let Some(variables) = muted_error!(self.guard(result)) else {
                    continue;
                };
                let mut record = LocalsRecord {
                    thread,
                    frame: level,
                    variables,
                    expanded: IndexMap::new(),
                    evaluated: vec![],
                };
                if level == self.current_frame {
                    collect_expanded(self.pipeline.locals(), &mut record.expanded);
                    let watches: Vec<WatchItem> = self.pipeline.watches().cloned().collect();
                    collect_expanded(&watches, &mut record.expanded);
                    record.evaluated = watches
                        .iter()
                        .filter(|w| w.in_scope)
                        .filter_map(|w| {
                            w.raw().map(|raw| Variable {
                                expression: w.expression.clone(),
                                ..raw.clone()
                            })
                        })
                        .collect();
                }
                snapshot.locals.push(record);
            }
        }
        self.ensure_stopped("create-snapshot")?;
        Ok(snapshot)
    }

    /// Capture the stopped session into an artifact at `path` (or a generated name in the
    /// configured snapshot directory). The live session is not changed.
    pub fn create_snapshot(&mut self, path: Option<&Path>) -> Result<PathBuf, Error> {
        self.ensure_stopped("create-snapshot")?;
        let snapshot = self.capture()?;
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => snapshot.default_path(&self.config.snapshot.directory),
        };
        snapshot.write(&path)?;
        info!(target: "snapshot", "session {} captured into {}", self.id, path.display());
        Ok(path)
    }

    /// Replace the live debuggee with a snapshot: the debuggee is terminated and the session
    /// continues as a non-resumable replay stopped at the captured position.
    pub fn reload_snapshot(&mut self, path: &Path) -> Result<(), Error> {
        self.ensure_stopped("reload-snapshot")?;
        let snapshot = Snapshot::read(path)?;
        info!(target: "snapshot", "session {} reloads {}", self.id, path.display());

        weak_error!(self.backend.terminate(), "terminate before snapshot reload:");
        self.breakpoints.reset_installation();
        self.tracker.clear();

        let current = snapshot
            .header
            .current_thread
            .or_else(|| snapshot.threads.first().map(|t| t.thread));
        let location = snapshot
            .threads
            .iter()
            .find(|t| Some(t.thread) == current)
            .and_then(|t| t.frames.first())
            .map(|f| f.location.clone())
            .unwrap_or_default();

        self.backend = Box::new(ReplayBackend::new(snapshot));
        self.capabilities = self.backend.capabilities();
        self.pipeline.clear();

        let Some(thread) = current else {
            self.threads.clear();
            self.current_thread = None;
            return Ok(());
        };
        self.refresh_threads(thread, &location)?;
        self.rebuild_inspection()?;
        self.report_stop(thread, &StopReason::Snapshot);
        self.last_stop = Some(StopReason::Snapshot);
        Ok(())
    }
}

impl<H: EventHook + Send + Sync + 'static> Drop for Session<H> {
    fn drop(&mut self) {
        if matches!(
            self.state(),
            SessionState::Starting | SessionState::Running | SessionState::Stopped
        ) {
            muted_error!(self.backend.terminate(), "terminate on drop:");
        }
    }
}
