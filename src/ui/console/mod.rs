//! Line oriented terminal front end.
//!
//! Three threads cooperate: the input thread owns the line editor and ships every line as a
//! [`Control`] message, the application loop parses and handles commands on the main thread,
//! and the session worker drives the session. Stops and other session events are printed by
//! [`TerminalHook`] from the worker thread.
use crate::debugger::backend::Backend;
use crate::debugger::breakpoint::Breakpoint;
use crate::debugger::variable::{LOCALS_ROOT, WATCHES_ROOT};
use crate::debugger::worker::SessionWorker;
use crate::debugger::{
    AttachMode, BackendVariant, CancellationToken, Config, Error, Frame, Session, SessionState,
    Target, WatchItem,
};
use crate::ui::command::parser::{QUIT_COMMAND, QUIT_COMMAND_SHORT};
use crate::ui::command::{
    BreakpointCommand, Command, CommandError, SnapshotCommand, WatchCommand,
};
use crate::ui::console::editor::{create_editor, RLHelper};
use crate::ui::console::file::FileView;
use crate::ui::console::help::help_for_command;
use crate::ui::console::hook::TerminalHook;
use crate::ui::console::print::style::{ErrorView, KeywordView};
use crate::ui::console::print::{render_location, ExternalPrinter};
use crate::ui::console::variable::render_watch_item;
use crate::weak_error;
use anyhow::anyhow;
use itertools::Itertools;
use rustyline::error::ReadlineError;
use rustyline::history::MemHistory;
use rustyline::Editor;
use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

mod editor;
mod file;
mod help;
pub mod hook;
pub mod print;
mod variable;

const WELCOME_TEXT: &str = r#"
mdbg greets
"#;
const PROMT: &str = "(mdbg) ";
const CONTROL_POLL: Duration = Duration::from_millis(50);

type MdbgEditor = Editor<RLHelper, MemHistory>;
type Worker = SessionWorker<TerminalHook>;

/// Creates the backend of every new session.
pub type BackendFactory = Box<dyn Fn() -> Result<Box<dyn Backend>, Error>>;

/// What `run` starts.
pub struct Launch {
    pub factory: BackendFactory,
    pub mode: AttachMode,
    pub target: Target,
}

pub struct AppBuilder {
    config: Config,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Application with an unstarted session, the program starts with the `run` command.
    pub fn build(self, launch: Launch) -> anyhow::Result<TerminalApplication> {
        let backend = (launch.factory)()?;
        self.build_with(Some(launch), move |config, hook| {
            Ok(Session::with_shared_hooks(config, backend, hook))
        })
    }

    /// Application with a session opened from a snapshot file.
    pub fn build_from_snapshot(
        self,
        path: &Path,
        launch: Option<Launch>,
    ) -> anyhow::Result<TerminalApplication> {
        self.build_with(launch, |config, hook| {
            Session::open_snapshot(config, path, hook)
        })
    }

    fn build_with(
        self,
        launch: Option<Launch>,
        session: impl FnOnce(Config, Arc<TerminalHook>) -> Result<Session<TerminalHook>, Error>,
    ) -> anyhow::Result<TerminalApplication> {
        let (control_tx, control_rx) = mpsc::channel::<Control>();
        let mut editor = create_editor(PROMT)?;
        let completer = Arc::clone(
            &editor
                .helper_mut()
                .ok_or_else(|| anyhow!("line editor without helper"))?
                .completer,
        );

        let prompter = Arc::new(Prompter {
            control_rx: Mutex::new(control_rx),
            asking: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            printer: ExternalPrinter::new(&mut editor)?,
        });
        let hook = Arc::new(TerminalHook::new(
            ExternalPrinter::new(&mut editor)?,
            prompter.clone(),
            completer,
        ));
        let worker = SessionWorker::spawn(session(self.config.clone(), hook.clone())?)?;

        Ok(TerminalApplication {
            app_loop: AppLoop {
                config: self.config,
                launch,
                worker,
                hook,
                prompter,
                printer: ExternalPrinter::new(&mut editor)?,
                file_view: FileView::new(),
                busy: Arc::new(Mutex::new(None)),
                quit: false,
            },
            editor,
            control_tx,
        })
    }
}

enum Control {
    /// New command from user received
    Cmd(String),
    /// Ctrl-C
    Interrupt,
    /// Terminate application
    Terminate,
}

/// Owner of the control channel. Questions asked from the session thread (adjusted breakpoints,
/// response timeouts) take the next input line away from the application loop.
pub(super) struct Prompter {
    control_rx: Mutex<Receiver<Control>>,
    asking: AtomicBool,
    /// The input thread is gone, a question swallowed its last message.
    terminated: AtomicBool,
    printer: ExternalPrinter,
}

impl Prompter {
    fn next(&self) -> Option<Control> {
        loop {
            if self.terminated.load(Ordering::SeqCst) {
                return Some(Control::Terminate);
            }
            if self.asking.load(Ordering::SeqCst) {
                thread::sleep(CONTROL_POLL);
                continue;
            }

            let rx = self.control_rx.lock().unwrap();
            match rx.recv_timeout(CONTROL_POLL) {
                Ok(control) => return Some(control),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    pub(super) fn yes(&self, question: &str) -> bool {
        self.asking.store(true, Ordering::SeqCst);
        let answer = {
            let rx = self.control_rx.lock().unwrap();
            self.printer.println(question);
            match rx.recv() {
                Ok(Control::Cmd(cmd)) => {
                    let cmd = cmd.trim().to_lowercase();
                    cmd == "y" || cmd == "yes"
                }
                Ok(Control::Interrupt) => false,
                Ok(Control::Terminate) | Err(_) => {
                    self.terminated.store(true, Ordering::SeqCst);
                    false
                }
            }
        };
        self.asking.store(false, Ordering::SeqCst);
        answer
    }
}

/// Ctrl-C cancels a long operation (connecting, stack reload) if one is in progress, otherwise
/// it interrupts the debuggee.
fn interrupt(control_tx: &Sender<Control>, busy: &Mutex<Option<CancellationToken>>) {
    match busy.lock().unwrap().as_ref() {
        Some(token) => token.cancel(),
        None => {
            _ = control_tx.send(Control::Interrupt);
        }
    }
}

pub struct TerminalApplication {
    app_loop: AppLoop,
    editor: MdbgEditor,
    control_tx: Sender<Control>,
}

impl TerminalApplication {
    pub fn run(self) -> anyhow::Result<()> {
        let busy = self.app_loop.busy.clone();
        {
            let control_tx = self.control_tx.clone();
            let busy = busy.clone();
            weak_error!(
                ctrlc::set_handler(move || interrupt(&control_tx, &busy)),
                "set ctrl-c handler:"
            );
        }

        let mut editor = self.editor;
        let control_tx = self.control_tx;
        thread::Builder::new()
            .name("mdbg-input".to_string())
            .spawn(move || {
                println!("{WELCOME_TEXT}");

                loop {
                    match editor.readline(PROMT) {
                        Ok(input) => {
                            let trimmed = input.trim();
                            if trimmed == QUIT_COMMAND || trimmed == QUIT_COMMAND_SHORT {
                                _ = control_tx.send(Control::Terminate);
                                break;
                            }
                            _ = editor.add_history_entry(&input);
                            if control_tx.send(Control::Cmd(input)).is_err() {
                                break;
                            }
                        }
                        Err(ReadlineError::Interrupted) => interrupt(&control_tx, &busy),
                        Err(ReadlineError::Eof) => {
                            _ = control_tx.send(Control::Terminate);
                            break;
                        }
                        Err(err) => {
                            println!("error: {err:#}");
                            _ = control_tx.send(Control::Terminate);
                            break;
                        }
                    }
                }
            })?;

        self.app_loop.run();
        Ok(())
    }
}

/// Settings of a session that survive a restart.
#[derive(Default)]
struct Carried {
    breakpoints: Vec<Breakpoint>,
    watches: Vec<String>,
}

impl Carried {
    fn from_session(session: &Session<TerminalHook>) -> Self {
        Self {
            breakpoints: session.breakpoints().cloned().collect(),
            watches: session
                .watch_items()
                .into_iter()
                .filter(|item| is_root_of(item, WATCHES_ROOT))
                .map(|item| item.expression)
                .collect(),
        }
    }
}

fn is_root_of(item: &WatchItem, root: &str) -> bool {
    item.id
        .strip_prefix(root)
        .is_some_and(|rest| rest.starts_with('.'))
}

fn render_memory(address: u64, data: &[u8]) -> String {
    data.chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let bytes = chunk.iter().map(|b| format!("{b:02x}")).join(" ");
            format!("{:#018x}: {bytes}", address + (i * 16) as u64)
        })
        .join("\n")
}

struct AppLoop {
    config: Config,
    launch: Option<Launch>,
    worker: Worker,
    hook: Arc<TerminalHook>,
    prompter: Arc<Prompter>,
    printer: ExternalPrinter,
    file_view: FileView,
    /// Token of the long running request in progress.
    busy: Arc<Mutex<Option<CancellationToken>>>,
    quit: bool,
}

impl AppLoop {
    fn yes(&self, question: &str) -> bool {
        self.prompter.yes(question)
    }

    fn cancellable<T>(&self, token: CancellationToken, f: impl FnOnce() -> T) -> T {
        *self.busy.lock().unwrap() = Some(token);
        let result = f();
        *self.busy.lock().unwrap() = None;
        result
    }

    fn launch(&self) -> Result<&Launch, Error> {
        self.launch.as_ref().ok_or_else(|| Error::NotSupported {
            command: "run",
            reason: "no program given, the session was opened from a snapshot".to_string(),
        })
    }

    fn start(&mut self) -> Result<(), CommandError> {
        let launch = self.launch()?;
        let (mode, target) = (launch.mode.clone(), launch.target.clone());
        let token = self.worker.cancellation_token();
        self.cancellable(token, || {
            self.worker.request(move |s| s.start(mode, target))
        })??;
        Ok(())
    }

    /// Replace the session with a fresh one, carrying breakpoints and watches over.
    fn restart(&mut self) -> Result<(), CommandError> {
        let backend = (self.launch()?.factory)()?;
        let carried = self
            .worker
            .request(|s| Carried::from_session(s))
            .unwrap_or_default();

        let session = Session::with_shared_hooks(self.config.clone(), backend, self.hook.clone());
        self.replace_worker(session)?;

        for bp in carried.breakpoints {
            let enabled = bp.enabled;
            let id = self.worker.request(move |s| {
                s.add_breakpoint(bp.request, bp.condition, bp.ignore_count)
            })??;
            if !enabled {
                self.worker.request(move |s| s.disable_breakpoint(id))??;
            }
        }
        for expression in carried.watches {
            weak_error!(
                self.worker
                    .request(move |s| s.add_watch(&expression, false).map(|_| ())),
                "carry watch:"
            );
        }

        self.start()
    }

    fn replace_worker(&mut self, session: Session<TerminalHook>) -> Result<(), Error> {
        let old = mem::replace(&mut self.worker, SessionWorker::spawn(session)?);
        old.shutdown();
        Ok(())
    }

    fn run_program(&mut self) -> Result<(), CommandError> {
        let state = self.worker.request(|s| s.state())?;
        match state {
            SessionState::Unstarted => self.start(),
            state if state.is_terminal() => self.restart(),
            _ => {
                if self.yes("Restart a program? (y or n)") {
                    self.restart()
                } else {
                    Ok(())
                }
            }
        }
    }

    fn print_frame(&self, frame: &Frame) {
        self.printer.println(format!(
            "#{} {}",
            frame.level,
            render_location(&frame.location)
        ));
        if let Some(source) = weak_error!(self.file_view.render_source(&frame.location, 0)) {
            self.printer.print(source);
        }
    }

    fn print_frames(&self, frames: &[Frame], selected: Option<u32>) {
        for frame in frames {
            let mark = if Some(frame.level) == selected { "*" } else { " " };
            self.printer.println(format!(
                "{mark} #{} {}",
                frame.level,
                render_location(&frame.location)
            ));
        }
    }

    fn print_current_frame(&self) -> Result<(), CommandError> {
        let frame = self
            .worker
            .request(|s| s.frames().get(s.current_frame() as usize).cloned())?;
        match frame {
            Some(frame) => self.print_frame(&frame),
            None => self.printer.println("No frame selected"),
        }
        Ok(())
    }

    fn print_items(&self, items: &[WatchItem], empty: &str) {
        if items.is_empty() {
            self.printer.println(empty);
        }
        for item in items {
            self.printer.println(render_watch_item(item, 0));
        }
    }

    fn handle_breakpoint(&mut self, cmd: BreakpointCommand) -> Result<(), CommandError> {
        match cmd {
            BreakpointCommand::Add {
                request,
                condition,
                ignore_count,
            } => {
                let id = self
                    .worker
                    .request(move |s| s.add_breakpoint(request, condition, ignore_count))??;
                let bp = self.worker.request(move |s| s.breakpoint(id).cloned())?;
                // installed ones are reported by the hook
                if let Some(bp) = bp.filter(|bp| bp.obtained.is_none() && bp.last_error.is_none())
                {
                    self.printer
                        .println(format!("Breakpoint {} at {} (pending)", bp.id, bp.request));
                }
            }
            BreakpointCommand::Enable(id) => {
                self.worker.request(move |s| s.enable_breakpoint(id))??
            }
            BreakpointCommand::Disable(id) => {
                self.worker.request(move |s| s.disable_breakpoint(id))??
            }
            BreakpointCommand::Delete(id) => {
                self.worker.request(move |s| s.delete_breakpoint(id))??
            }
            BreakpointCommand::Info => {
                let breakpoints = self
                    .worker
                    .request(|s| s.breakpoints().cloned().collect::<Vec<_>>())?;
                if breakpoints.is_empty() {
                    self.printer.println("No breakpoints");
                }
                for bp in breakpoints {
                    let state = if bp.enabled { "enabled" } else { "disabled" };
                    let mut line = format!(
                        "{} {} {state}, hits: {}",
                        KeywordView::from(bp.id),
                        bp.request,
                        bp.hit_count
                    );
                    match (&bp.obtained, &bp.last_error) {
                        (Some(obtained), _) => {
                            line = format!("{line}, at {}", render_location(obtained))
                        }
                        (None, Some(error)) => line = format!("{line}, pending: {error}"),
                        (None, None) => {}
                    }
                    if bp.ignore_count > 0 {
                        line = format!("{line}, ignore next {}", bp.ignore_count);
                    }
                    if let Some(condition) = &bp.condition {
                        line = format!("{line}, if {condition}");
                    }
                    self.printer.println(line);
                }
            }
        }
        Ok(())
    }

    fn handle_watch(&mut self, cmd: WatchCommand) -> Result<(), CommandError> {
        match cmd {
            WatchCommand::Add { expression, force } => {
                let item = self
                    .worker
                    .request(move |s| s.add_watch(&expression, force))??;
                self.printer.println(render_watch_item(&item, 0));
            }
            WatchCommand::Remove(id) => self.worker.request(move |s| s.remove_watch(&id))??,
            WatchCommand::Expand(id) => {
                let children = self.worker.request(move |s| s.expand(&id))??;
                self.print_items(&children, "No children");
            }
            WatchCommand::Collapse(id) => self.worker.request(move |s| s.collapse(&id))??,
            WatchCommand::Format { type_name, hint } => {
                self.worker
                    .request(move |s| s.set_format(&type_name, hint))??
            }
            WatchCommand::Info => {
                let items = self.worker.request(|s| s.watch_items())?;
                let watches: Vec<_> = items
                    .into_iter()
                    .filter(|item| is_root_of(item, WATCHES_ROOT))
                    .collect();
                self.print_items(&watches, "No watches");
            }
        }
        Ok(())
    }

    fn handle_snapshot(&mut self, cmd: SnapshotCommand) -> Result<(), CommandError> {
        match cmd {
            SnapshotCommand::Save(path) => {
                let path = self
                    .worker
                    .request(move |s| s.create_snapshot(path.as_deref()))??;
                self.printer
                    .println(format!("Snapshot saved to {}", path.display()));
            }
            SnapshotCommand::Load(path) => {
                let (variant, state) = self.worker.request(|s| (s.variant(), s.state()))?;
                if variant == BackendVariant::Replay {
                    self.worker.request(move |s| s.reload_snapshot(&path))??;
                    return Ok(());
                }
                if !state.is_terminal()
                    && state != SessionState::Unstarted
                    && !self.yes("The program will be terminated. Continue? (y or n)")
                {
                    return Ok(());
                }
                let session =
                    Session::open_snapshot(self.config.clone(), &path, self.hook.clone())?;
                self.replace_worker(session)?;
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, cmd: &str) -> Result<(), CommandError> {
        match Command::parse(cmd)? {
            Command::Run => self.run_program()?,
            Command::Resume(resume) => self.worker.request(move |s| s.resume(resume))??,
            Command::Interrupt => self.worker.request(|s| s.interrupt())??,
            Command::Breakpoint(cmd) => self.handle_breakpoint(cmd)?,
            Command::Watch(cmd) => self.handle_watch(cmd)?,
            Command::Print { expression, force } => {
                let item = self
                    .worker
                    .request(move |s| s.evaluate(&expression, force))??;
                self.printer.println(render_watch_item(&item, 0));
            }
            Command::Locals => {
                let items = self.worker.request(|s| s.watch_items())?;
                let locals: Vec<_> = items
                    .into_iter()
                    .filter(|item| is_root_of(item, LOCALS_ROOT))
                    .collect();
                self.print_items(&locals, "No locals");
            }
            Command::Backtrace { all: false } => {
                let (frames, selected) = self
                    .worker
                    .request(|s| (s.frames().to_vec(), s.current_frame()))?;
                self.print_frames(&frames, Some(selected));
            }
            Command::Backtrace { all: true } => {
                let token = CancellationToken::new();
                let reload = {
                    let token = token.clone();
                    self.cancellable(token.clone(), || {
                        self.worker.request(move |s| s.reload_stack(&token))
                    })??
                };
                for thread in &reload.threads {
                    let mark = if thread.is_current { "*" } else { " " };
                    self.printer.println(format!(
                        "{mark} thread {} {}",
                        KeywordView::from(thread.id),
                        thread.label
                    ));
                    self.print_frames(&thread.frames, None);
                }
                if !reload.complete {
                    self.printer.println(ErrorView::from("Stack reload cancelled"));
                }
            }
            Command::Thread(None) => {
                let (threads, current) = self
                    .worker
                    .request(|s| (s.threads().to_vec(), s.current_thread()))?;
                if threads.is_empty() {
                    self.printer.println("No threads");
                }
                for thread in threads {
                    let mark = if Some(thread.id) == current { "*" } else { " " };
                    let location = thread
                        .frames
                        .first()
                        .map(|f| render_location(&f.location))
                        .unwrap_or_default();
                    self.printer.println(format!(
                        "{mark} {} {} {location}",
                        KeywordView::from(thread.id),
                        thread.label
                    ));
                }
            }
            Command::Thread(Some(id)) => {
                self.worker.request(move |s| s.select_thread(id))??;
                self.printer
                    .println(format!("Switched to thread {id}"));
                self.print_current_frame()?;
            }
            Command::Frame(None) => self.print_current_frame()?,
            Command::Frame(Some(level)) => {
                self.worker.request(move |s| s.select_frame(level))??;
                self.print_current_frame()?;
            }
            Command::Memory { address, len } => {
                let data = self
                    .worker
                    .request(move |s| s.read_memory(address, len))??;
                self.printer.println(render_memory(address, &data));
            }
            Command::Registers => {
                let registers = self.worker.request(|s| s.registers())??;
                for (name, value) in registers.iter() {
                    self.printer
                        .println(format!("{} {value:#018x}", KeywordView::from(format!("{name:<8}"))));
                }
            }
            Command::Snapshot(cmd) => self.handle_snapshot(cmd)?,
            Command::Help(topic) => self.printer.println(help_for_command(topic.as_deref())),
            Command::Quit => self.quit = true,
        }
        Ok(())
    }

    fn run(mut self) {
        while !self.quit {
            let Some(action) = self.prompter.next() else {
                break;
            };

            match action {
                Control::Cmd(command) => {
                    if command.trim().is_empty() {
                        continue;
                    }
                    if let Err(e) = self.handle_command(&command) {
                        match e {
                            CommandError::Parsing(_) => {
                                self.printer.println(ErrorView::from(e));
                            }
                            CommandError::Handle(ref err) if err.is_fatal() => {
                                self.printer
                                    .println(ErrorView::from(format!("fatal debugger error: {e:#}")));
                            }
                            CommandError::Handle(_) => {
                                self.printer
                                    .println(ErrorView::from(format!("debugger error: {e:#}")));
                            }
                        }
                    }
                }
                Control::Interrupt => {
                    match self.worker.request(|s| s.interrupt()) {
                        Ok(Ok(())) | Ok(Err(Error::InvalidState { .. })) => {}
                        Ok(Err(e)) | Err(e) => {
                            self.printer
                                .println(ErrorView::from(format!("debugger error: {e:#}")));
                        }
                    }
                }
                Control::Terminate => break,
            }
        }

        self.worker.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_render_memory() {
        let data: Vec<u8> = (0..20).collect();
        let rendered = render_memory(0x1000, &data);
        assert_eq!(
            rendered,
            "0x0000000000001000: 00 01 02 03 04 05 06 07 08 09 0a 0b 0c 0d 0e 0f\n\
             0x0000000000001010: 10 11 12 13"
        );
    }
}
