//! Byte-stream channels to a debuggee or to its proxy.
//!
//! Every transport supports a read with a deadline: `recv` returns `Ok(0)` when the peer closed
//! the channel and an error of kind [`io::ErrorKind::TimedOut`] when no byte arrived in time.
mod memory;
mod pipe;
mod serial;
mod tcp;

pub use memory::MemoryTransport;
pub use pipe::{PipeTransport, StdioTransport};
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

use std::io;
use std::time::Duration;

/// Granularity of deadline reads on file descriptors.
const READ_TICK: Duration = Duration::from_millis(20);

pub trait Transport: Send {
    /// Human readable transport description, used in errors and logs.
    fn describe(&self) -> String;

    /// Write all of `data`.
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read available bytes into `buf`, waiting at most `timeout` for the first one.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).send(data)
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        (**self).recv(buf, timeout)
    }
}

/// True if the error only means "nothing arrived before the deadline".
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "no data before deadline")
}

/// Deadline read over a reader that itself times out every [`READ_TICK`].
fn recv_ticking<R: io::Read>(reader: &mut R, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if is_timeout(&e) => {
                if std::time::Instant::now() >= deadline {
                    return Err(timed_out());
                }
            }
            Err(e) => return Err(e),
        }
    }
}
