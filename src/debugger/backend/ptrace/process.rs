use crate::debugger::backend::Target;
use crate::debugger::error::Error;
use crate::debugger::error::Error::{Ptrace, Waitpid};
use log::debug;
use nix::libc;
use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::ptrace::Options;
use nix::sys::signal::{Signal, SIGSTOP};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use os_pipe::PipeWriter;
use std::collections::HashSet;
use std::iter;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use sysinfo::{RefreshKind, System};

/// Process state.
pub trait State {}

/// Process running and attached with `ptrace` system call.
pub struct Installed {
    pid: Pid,
    /// Threads stopped when the process was taken.
    threads: Vec<Pid>,
}

impl State for Installed {}

/// Process prepared for instantiation by a `fork` call.
pub struct Template;

impl State for Template {}

fn trace_options() -> Options {
    Options::PTRACE_O_TRACECLONE
        .union(Options::PTRACE_O_TRACEEXEC)
        .union(Options::PTRACE_O_TRACEEXIT)
}

/// Debuggee process, traced with `PTRACE_SEIZE`.
pub struct Child<S: State> {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    external: bool,
    state: S,
}

impl Child<Template> {
    /// Describe a process, nothing is started yet.
    pub fn new(target: &Target) -> Self {
        Self {
            program: target.program.clone(),
            args: target.args.clone(),
            cwd: target.cwd.clone(),
            external: false,
            state: Template,
        }
    }

    /// Instantiate the process by a `fork()` call with caller as a parent process.
    /// The process returns stopped right after `execve`, nothing of the program ran yet.
    pub fn install(
        &self,
        stdout: PipeWriter,
        stderr: PipeWriter,
        disable_aslr: bool,
    ) -> Result<Child<Installed>, Error> {
        let mut debugee_cmd = Command::new(&self.program);
        let debugee_cmd = debugee_cmd.args(&self.args).stdout(stdout).stderr(stderr);
        if let Some(cwd) = self.cwd.as_deref() {
            debugee_cmd.current_dir(cwd);
        }
        if disable_aslr {
            unsafe {
                debugee_cmd.pre_exec(|| {
                    sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                    Ok(())
                });
            }
        }

        match unsafe { fork() }.map_err(|e| Error::Syscall("fork", e))? {
            ForkResult::Parent { child: pid } => {
                waitpid(pid, Some(WaitPidFlag::WSTOPPED)).map_err(Waitpid)?;
                sys::ptrace::seize(pid, trace_options()).map_err(Ptrace)?;
                sys::ptrace::cont(pid, None).map_err(Ptrace)?;
                wait_exec(pid)?;
                debug!(target: "ptrace", "process {pid} started: {}", self.program.display());

                Ok(Child {
                    program: self.program.clone(),
                    args: self.args.clone(),
                    cwd: self.cwd.clone(),
                    external: false,
                    state: Installed {
                        pid,
                        threads: vec![pid],
                    },
                })
            }
            ForkResult::Child => {
                if sys::signal::raise(SIGSTOP).is_ok() {
                    let err = debugee_cmd.exec();
                    eprintln!("cannot execute {}: {err}", self.program.display());
                }
                unsafe { libc::_exit(127) }
            }
        }
    }
}

/// Wait until a freshly seized child passes `execve`.
fn wait_exec(pid: Pid) -> Result<(), Error> {
    loop {
        match waitpid(pid, None).map_err(Waitpid)? {
            WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_EXEC) => return Ok(()),
            WaitStatus::Stopped(_, signal) if signal != Signal::SIGSTOP => {
                sys::ptrace::cont(pid, signal).map_err(Ptrace)?
            }
            WaitStatus::Exited(_, code) => {
                return Err(Error::BackendRejected {
                    command: "launch".to_string(),
                    message: format!("program exited with code {code} before it started"),
                })
            }
            WaitStatus::Signaled(_, signal, _) => {
                return Err(Error::BackendRejected {
                    command: "launch".to_string(),
                    message: format!("program killed by {signal} before it started"),
                })
            }
            _ => sys::ptrace::cont(pid, None).map_err(Ptrace)?,
        }
    }
}

impl Child<Installed> {
    pub fn pid(&self) -> Pid {
        self.state.pid
    }

    /// Create [`Child`] from an already running external process, all its threads end up stopped.
    pub fn from_external(pid: Pid) -> Result<Self, Error> {
        let sys =
            System::new_with_specifics(RefreshKind::everything().without_cpu().without_memory());
        let not_found = || Error::NotFound(format!("process {pid}"));

        let external_process = System::process(&sys, sysinfo::Pid::from_u32(pid.as_raw() as u32))
            .ok_or_else(not_found)?;
        let program = external_process.exe().ok_or_else(not_found)?.to_path_buf();
        let cwd = external_process.cwd().map(ToOwned::to_owned);

        let mut interrupted = HashSet::new();
        // threads may be spawned while the first round goes on, they are caught by the second one
        for _ in 0..2 {
            let threads: Vec<Pid> = match external_process.tasks() {
                Some(tasks) => iter::once(pid)
                    .chain(tasks.iter().map(|tid| Pid::from_raw(tid.as_u32() as i32)))
                    .collect(),
                None => vec![pid],
            };
            let threads: Vec<Pid> = threads
                .into_iter()
                .filter(|t| !interrupted.contains(t))
                .collect();

            for tid in &threads {
                sys::ptrace::seize(*tid, trace_options()).map_err(Error::Attach)?;
            }
            for tid in &threads {
                sys::ptrace::interrupt(*tid).map_err(Error::Attach)?;
            }
            for tid in &threads {
                let status = waitpid(*tid, Some(WaitPidFlag::__WALL)).map_err(Error::Attach)?;
                debug!(target: "ptrace", "thread {tid} attached: {status:?}");
            }
            interrupted.extend(threads);
        }

        Ok(Self {
            program,
            args: external_process.cmd().iter().skip(1).cloned().collect(),
            cwd,
            external: true,
            state: Installed {
                pid,
                threads: interrupted.into_iter().collect(),
            },
        })
    }

    pub fn threads(&self) -> &[Pid] {
        &self.state.threads
    }
}

impl<S: State> Child<S> {
    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// True when the process was attached by its pid.
    pub fn is_external(&self) -> bool {
        self.external
    }
}
