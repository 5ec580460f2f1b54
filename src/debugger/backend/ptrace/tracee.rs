use crate::debugger::error::Error;
use crate::debugger::error::Error::{Ptrace, Waitpid};
use indexmap::IndexMap;
use log::{debug, warn};
use nix::errno::Errno;
use nix::libc::{self, c_long, c_void, pid_t};
use nix::sys;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::mem;

pub const TRAP_BRKPT: i32 = 0x1;
pub const TRAP_TRACE: i32 = 0x2;
pub const SI_KERNEL: i32 = 0x80;

/// Signals delivered to the debuggee right away, they never stop a session.
pub static QUIET_SIGNALS: [Signal; 6] = [
    Signal::SIGALRM,
    Signal::SIGURG,
    Signal::SIGCHLD,
    Signal::SIGIO,
    Signal::SIGVTALRM,
    Signal::SIGPROF,
];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceeStatus {
    Stopped,
    Running,
}

/// Thread attached to the debugger with ptrace.
#[derive(Clone, Debug, PartialEq)]
pub struct Tracee {
    pub tid: Pid,
    pub status: TraceeStatus,
    /// Signal to deliver on the next resume.
    pub pending_signal: Option<Signal>,
}

impl Tracee {
    fn new(tid: Pid, status: TraceeStatus) -> Self {
        Self {
            tid,
            status,
            pending_signal: None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.status == TraceeStatus::Stopped
    }

    fn r#continue(&mut self) -> nix::Result<()> {
        let signal = self.pending_signal.take();
        debug!(target: "ptrace", "continue thread {} with signal {signal:?}", self.tid);
        sys::ptrace::cont(self.tid, signal)?;
        self.status = TraceeStatus::Running;
        Ok(())
    }
}

/// Stop of a single thread, as seen by the tracer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadStop {
    /// `SIGTRAP` with its `si_code`.
    Trap(i32),
    Signal(Signal),
    /// A new thread is being created.
    Cloned(Pid),
    /// `PTRACE_EVENT_STOP`: interrupt, group stop or start of a new thread.
    EventStop,
    /// The thread is about to exit.
    Exiting,
    Exited(i32),
    /// Nothing of interest (exec event, syscall stop).
    Other,
}

/// Turn a wait status into a thread stop.
pub fn classify(status: WaitStatus) -> Result<Option<(Pid, ThreadStop)>, Error> {
    let stop = match status {
        WaitStatus::StillAlive => return Ok(None),
        WaitStatus::Exited(tid, code) => (tid, ThreadStop::Exited(code)),
        WaitStatus::Signaled(tid, signal, _) => (tid, ThreadStop::Exited(128 + signal as i32)),
        WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_CLONE) => {
            let new = sys::ptrace::getevent(tid).map_err(Ptrace)?;
            (tid, ThreadStop::Cloned(Pid::from_raw(new as pid_t)))
        }
        WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_STOP) => (tid, ThreadStop::EventStop),
        WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_EXIT) => (tid, ThreadStop::Exiting),
        WaitStatus::Stopped(tid, Signal::SIGTRAP) => match sys::ptrace::getsiginfo(tid) {
            Ok(info) => (tid, ThreadStop::Trap(info.si_code)),
            Err(Errno::ESRCH) => (tid, ThreadStop::Other),
            Err(e) => return Err(Ptrace(e)),
        },
        WaitStatus::Stopped(tid, signal) => (tid, ThreadStop::Signal(signal)),
        status => match status.pid() {
            Some(tid) => (tid, ThreadStop::Other),
            None => return Ok(None),
        },
    };
    Ok(Some(stop))
}

/// Wait for the next stop of `tid`.
pub fn wait_thread(tid: Pid, block: bool) -> Result<Option<ThreadStop>, Error> {
    let mut flags = WaitPidFlag::__WALL;
    if !block {
        flags |= WaitPidFlag::WNOHANG;
    }
    let status = match waitpid(tid, Some(flags)) {
        Ok(status) => status,
        // reaped already
        Err(Errno::ECHILD) => return Ok(Some(ThreadStop::Exited(0))),
        Err(e) => return Err(Waitpid(e)),
    };
    if !matches!(status, WaitStatus::StillAlive) {
        debug!(target: "ptrace", "thread {tid} status: {status:?}");
    }
    Ok(classify(status)?.map(|(_, stop)| stop))
}

/// Threads of the debuggee.
pub struct TraceeCtl {
    proc_pid: Pid,
    threads: IndexMap<Pid, Tracee>,
}

impl TraceeCtl {
    /// All `threads` are stopped.
    pub fn new(proc_pid: Pid, threads: &[Pid]) -> Self {
        let mut ctl = Self {
            proc_pid,
            threads: IndexMap::new(),
        };
        ctl.threads
            .insert(proc_pid, Tracee::new(proc_pid, TraceeStatus::Stopped));
        for tid in threads {
            ctl.threads
                .insert(*tid, Tracee::new(*tid, TraceeStatus::Stopped));
        }
        ctl
    }

    pub fn proc_pid(&self) -> Pid {
        self.proc_pid
    }

    pub fn contains(&self, tid: Pid) -> bool {
        self.threads.contains_key(&tid)
    }

    pub fn get_mut(&mut self, tid: Pid) -> Option<&mut Tracee> {
        self.threads.get_mut(&tid)
    }

    /// New threads start running, their first stop is reported separately.
    pub fn add_running(&mut self, tid: Pid) {
        debug!(target: "ptrace", "add new thread {tid}");
        self.threads
            .entry(tid)
            .or_insert_with(|| Tracee::new(tid, TraceeStatus::Running));
    }

    pub fn remove(&mut self, tid: Pid) -> Option<Tracee> {
        debug!(target: "ptrace", "remove thread {tid}");
        self.threads.shift_remove(&tid)
    }

    pub fn set_stopped(&mut self, tid: Pid) {
        if let Some(tracee) = self.threads.get_mut(&tid) {
            tracee.status = TraceeStatus::Stopped;
        }
    }

    pub fn set_pending_signal(&mut self, tid: Pid, signal: Signal) {
        if let Some(tracee) = self.threads.get_mut(&tid) {
            tracee.pending_signal = Some(signal);
        }
    }

    pub fn tids(&self) -> Vec<Pid> {
        self.threads.keys().copied().collect()
    }

    pub fn running(&self) -> Vec<Pid> {
        self.threads
            .values()
            .filter(|t| !t.is_stopped())
            .map(|t| t.tid)
            .collect()
    }

    /// Some stopped thread, the process leader if it is stopped.
    pub fn stopped_one(&self) -> Option<Pid> {
        match self.threads.get(&self.proc_pid) {
            Some(leader) if leader.is_stopped() => Some(leader.tid),
            _ => self.threads.values().find(|t| t.is_stopped()).map(|t| t.tid),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Continue one stopped thread.
    pub fn cont(&mut self, tid: Pid) -> Result<(), Error> {
        let Some(tracee) = self.threads.get_mut(&tid) else {
            return Ok(());
        };
        match tracee.r#continue() {
            // removed later, on its exit event
            Err(Errno::ESRCH) => {
                warn!(target: "ptrace", "thread {tid} not found, ESRCH");
                Ok(())
            }
            result => result.map_err(Ptrace),
        }
    }

    /// Continue all currently stopped threads.
    pub fn cont_stopped(&mut self) -> Result<(), Error> {
        for tid in self.tids() {
            if self.threads.get(&tid).is_some_and(Tracee::is_stopped) {
                self.cont(tid)?;
            }
        }
        Ok(())
    }
}

/// Read debuggee memory word by word.
pub fn read_memory_by_pid(pid: Pid, addr: u64, read_n: usize) -> nix::Result<Vec<u8>> {
    let word = mem::size_of::<c_long>();
    let mut result = Vec::with_capacity(read_n + word);

    let mut addr = addr;
    while result.len() < read_n {
        let value = sys::ptrace::read(pid, addr as *mut c_void)?;
        result.extend_from_slice(&value.to_ne_bytes());
        addr += word as u64;
    }
    result.truncate(read_n);
    Ok(result)
}

/// Write debuggee memory, partially covered words keep their other bytes.
pub fn write_memory_by_pid(pid: Pid, addr: u64, data: &[u8]) -> nix::Result<()> {
    let word = mem::size_of::<c_long>();
    let mut offset = 0;
    while offset < data.len() {
        let at = addr + offset as u64;
        let chunk = &data[offset..(offset + word).min(data.len())];
        let mut bytes = if chunk.len() < word {
            sys::ptrace::read(pid, at as *mut c_void)?.to_ne_bytes()
        } else {
            [0; mem::size_of::<c_long>()]
        };
        bytes[..chunk.len()].copy_from_slice(chunk);
        let value = c_long::from_ne_bytes(bytes);
        unsafe {
            sys::ptrace::write(pid, at as *mut c_void, value as *mut c_void)?;
        }
        offset += chunk.len();
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_thread_table() {
        let main = Pid::from_raw(100);
        let mut ctl = TraceeCtl::new(main, &[Pid::from_raw(101)]);
        ctl.add_running(Pid::from_raw(102));

        assert_eq!(
            ctl.tids(),
            vec![Pid::from_raw(100), Pid::from_raw(101), Pid::from_raw(102)]
        );
        assert_eq!(ctl.running(), vec![Pid::from_raw(102)]);

        ctl.set_stopped(Pid::from_raw(102));
        ctl.set_pending_signal(Pid::from_raw(102), Signal::SIGUSR1);
        assert!(ctl.running().is_empty());
        assert_eq!(ctl.stopped_one(), Some(main));
        assert_eq!(
            ctl.get_mut(Pid::from_raw(102)).unwrap().pending_signal,
            Some(Signal::SIGUSR1)
        );

        ctl.remove(Pid::from_raw(101));
        assert!(!ctl.contains(Pid::from_raw(101)));
        assert_eq!(ctl.proc_pid(), main);
    }

    #[test]
    fn test_classify_exit_statuses() {
        struct TestCase {
            status: WaitStatus,
            expected: Option<(Pid, ThreadStop)>,
        }

        let tid = Pid::from_raw(42);
        let cases = vec![
            TestCase {
                status: WaitStatus::Exited(tid, 3),
                expected: Some((tid, ThreadStop::Exited(3))),
            },
            TestCase {
                status: WaitStatus::Signaled(tid, Signal::SIGKILL, false),
                expected: Some((tid, ThreadStop::Exited(137))),
            },
            TestCase {
                status: WaitStatus::Stopped(tid, Signal::SIGSEGV),
                expected: Some((tid, ThreadStop::Signal(Signal::SIGSEGV))),
            },
            TestCase {
                status: WaitStatus::PtraceEvent(tid, Signal::SIGTRAP, libc::PTRACE_EVENT_STOP),
                expected: Some((tid, ThreadStop::EventStop)),
            },
            TestCase {
                status: WaitStatus::StillAlive,
                expected: None,
            },
        ];

        for tc in cases {
            assert_eq!(classify(tc.status).unwrap(), tc.expected);
        }
    }
}
