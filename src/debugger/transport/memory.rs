use crate::debugger::transport::{timed_out, Transport};
use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// One end of an in-process duplex channel.
pub struct MemoryTransport {
    name: String,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

impl MemoryTransport {
    /// Create two connected ends.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = channel();
        let (b_tx, a_rx) = channel();
        (
            MemoryTransport {
                name: "memory (host end)".to_string(),
                tx: a_tx,
                rx: a_rx,
                pending: VecDeque::new(),
            },
            MemoryTransport {
                name: "memory (agent end)".to_string(),
                tx: b_tx,
                rx: b_rx,
                pending: VecDeque::new(),
            },
        )
    }

    fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }
        n
    }
}

impl Transport for MemoryTransport {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer end dropped"))
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.rx.recv_timeout(timeout) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => return Err(timed_out()),
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        // take everything that is already queued
        while let Ok(chunk) = self.rx.try_recv() {
            self.pending.extend(chunk);
        }
        Ok(self.drain_into(buf))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::transport::is_timeout;

    #[test]
    fn test_pair_exchange() {
        let (mut host, mut agent) = MemoryTransport::pair();
        host.send(b"hello").unwrap();
        host.send(b" world").unwrap();

        let mut buf = [0; 4];
        let n = agent.recv(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(&buf[..n], b"hell");
        let mut buf = [0; 32];
        let n = agent.recv(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(&buf[..n], b"o world");

        let err = agent.recv(&mut buf, Duration::from_millis(10)).unwrap_err();
        assert!(is_timeout(&err));

        drop(host);
        assert_eq!(agent.recv(&mut buf, Duration::from_millis(10)).unwrap(), 0);
    }
}
