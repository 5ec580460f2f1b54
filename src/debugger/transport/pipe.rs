use crate::debugger::transport::{recv_ticking, Transport, READ_TICK};
use log::debug;
use std::ffi::OsStr;
use std::io;
use std::io::{Stdin, Stdout, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use timeout_readwrite::TimeoutReader;

/// Standard input/output pipes of a spawned child process.
pub struct PipeTransport {
    name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: TimeoutReader<ChildStdout>,
}

impl PipeTransport {
    /// Spawn `program` with piped stdin and stdout, stderr is discarded.
    pub fn spawn<I, S>(program: &Path, args: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "child process pipes are not available",
            ));
        };

        debug!(target: "transport", "spawn {} (pid {})", program.display(), child.id());
        Ok(Self {
            name: format!("pipe {} (pid {})", program.display(), child.id()),
            stdin,
            stdout: TimeoutReader::new(stdout, READ_TICK),
            child,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Wait for the child to exit on its own for `grace`, then kill it.
    pub fn shutdown(&mut self, grace: Duration) -> io::Result<()> {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.child.try_wait()?.is_some() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(10));
        }
        debug!(target: "transport", "kill {}", self.name);
        self.child.kill()?;
        self.child.wait().map(|_| ())
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

impl Transport for PipeTransport {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.stdin.write_all(data)?;
        self.stdin.flush()
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        recv_ticking(&mut self.stdout, buf, timeout)
    }
}

/// Standard input/output of the current process, the agent side of a pipe transport.
pub struct StdioTransport {
    stdin: TimeoutReader<Stdin>,
    stdout: Stdout,
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self {
            stdin: TimeoutReader::new(io::stdin(), READ_TICK),
            stdout: io::stdout(),
        }
    }
}

impl Transport for StdioTransport {
    fn describe(&self) -> String {
        "stdio".to_string()
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut out = self.stdout.lock();
        out.write_all(data)?;
        out.flush()
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        recv_ticking(&mut self.stdin, buf, timeout)
    }
}
