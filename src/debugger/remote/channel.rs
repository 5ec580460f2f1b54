//! Request/response channel to a remote agent.
//!
//! At most one request is on the wire at a time, later requests wait in a queue and go out
//! as soon as the previous response arrives. Unsolicited event frames (sequence 0) may arrive
//! at any time and are buffered in arrival order.
use crate::debugger::backend::{TimeoutArbiter, TimeoutDecision};
use crate::debugger::error::Error;
use crate::debugger::event::DebugEvent;
use crate::debugger::remote::codec::{from_payload, Decode, FrameDecoder, WireFrame};
use crate::debugger::remote::proto::{Opcode, Request, EVENT_SEQ};
use crate::debugger::transport::{is_timeout, Transport};
use bytes::Bytes;
use log::{debug, trace, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Handle of a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    seq: u32,
    command: &'static str,
}

impl Ticket {
    pub fn seq(&self) -> u32 {
        self.seq
    }
}

struct InFlight {
    seq: u32,
    command: &'static str,
    sent_at: Instant,
}

pub struct RemoteChannel {
    transport: Box<dyn Transport>,
    decoder: FrameDecoder,
    next_seq: u32,
    in_flight: Option<InFlight>,
    queue: VecDeque<(&'static str, WireFrame)>,
    completed: HashMap<u32, Result<Bytes, Error>>,
    abandoned: HashSet<u32>,
    events: VecDeque<DebugEvent>,
    response_timeout: Duration,
    max_extensions: u32,
    arbiter: Option<TimeoutArbiter>,
    lost: Option<String>,
}

impl RemoteChannel {
    pub fn new(
        transport: Box<dyn Transport>,
        response_timeout: Duration,
        max_extensions: u32,
    ) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::default(),
            next_seq: 1,
            in_flight: None,
            queue: VecDeque::new(),
            completed: HashMap::new(),
            abandoned: HashSet::new(),
            events: VecDeque::new(),
            response_timeout,
            max_extensions,
            arbiter: None,
            lost: None,
        }
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    pub fn set_timeout_arbiter(&mut self, arbiter: TimeoutArbiter) {
        self.arbiter = Some(arbiter);
    }

    /// Requests submitted but not answered yet, including the one on the wire.
    pub fn pending(&self) -> usize {
        self.queue.len() + self.in_flight.is_some() as usize
    }

    /// Responses received but not collected by [`RemoteChannel::wait`] yet.
    pub fn unclaimed(&self) -> usize {
        self.completed.len()
    }

    /// Send a request and wait for its typed result.
    pub fn call<T: Decode>(&mut self, request: &Request) -> Result<T, Error> {
        let ticket = self.submit(request)?;
        let payload = self.wait(ticket)?;
        from_payload(payload)
    }

    /// Queue a request, it is written out immediately if nothing else is in flight.
    pub fn submit(&mut self, request: &Request) -> Result<Ticket, Error> {
        self.check_lost(request.name())?;

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        let frame = request.to_frame(seq);
        let ticket = Ticket {
            seq,
            command: request.name(),
        };

        if self.in_flight.is_none() {
            self.send_frame(ticket.command, frame)?;
        } else {
            trace!(target: "remote", "queue `{}` (seq {seq})", ticket.command);
            self.queue.push_back((ticket.command, frame));
        }
        Ok(ticket)
    }

    /// Wait for the response of a submitted request.
    ///
    /// When the request on the wire gets no response within the response timeout the arbiter
    /// decides between waiting longer (bounded by the extension limit) and abandoning it.
    pub fn wait(&mut self, ticket: Ticket) -> Result<Bytes, Error> {
        let mut extensions = 0;
        let mut waiting_for = None;

        loop {
            if let Some(result) = self.completed.remove(&ticket.seq) {
                return result;
            }
            let Some(in_flight) = &self.in_flight else {
                self.check_lost(ticket.command)?;
                return Err(Error::Protocol {
                    command: ticket.command.to_string(),
                    message: format!("request {} is not pending", ticket.seq),
                });
            };
            if waiting_for != Some(in_flight.seq) {
                waiting_for = Some(in_flight.seq);
                extensions = 0;
            }

            let elapsed = in_flight.sent_at.elapsed();
            let budget = self.response_timeout * (extensions + 1);
            if elapsed >= budget {
                let (seq, command) = (in_flight.seq, in_flight.command);
                let decision = match self.arbiter.as_mut() {
                    Some(arbiter) if extensions < self.max_extensions => arbiter(command, elapsed),
                    _ => TimeoutDecision::Abort,
                };
                match decision {
                    TimeoutDecision::WaitLonger => {
                        extensions += 1;
                        debug!(target: "remote", "wait longer for `{command}` ({elapsed:?} so far)");
                    }
                    TimeoutDecision::Abort => {
                        warn!(target: "remote", "abandon `{command}` (seq {seq}) after {elapsed:?}");
                        self.in_flight = None;
                        self.abandoned.insert(seq);
                        self.completed.insert(
                            seq,
                            Err(Error::ResponseTimeout {
                                command: command.to_string(),
                                waited: elapsed,
                            }),
                        );
                        self.send_next()?;
                    }
                }
                continue;
            }

            self.pump(budget - elapsed)?;
        }
    }

    /// Next buffered or incoming event, waiting at most `timeout`.
    pub fn poll_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>, Error> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        self.check_lost("receive event")?;
        self.pump(timeout)?;
        Ok(self.events.pop_front())
    }

    fn check_lost(&self, command: &str) -> Result<(), Error> {
        match &self.lost {
            Some(message) => Err(Error::TransportLost {
                command: command.to_string(),
                transport: self.transport.describe(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn current_command(&self) -> &'static str {
        self.in_flight
            .as_ref()
            .map(|f| f.command)
            .unwrap_or("receive")
    }

    fn transport_lost(&mut self, message: String) -> Error {
        warn!(target: "remote", "transport {} lost: {message}", self.transport.describe());
        let command = self.current_command();
        self.lost = Some(message.clone());
        Error::TransportLost {
            command: command.to_string(),
            transport: self.transport.describe(),
            message,
        }
    }

    fn send_frame(&mut self, command: &'static str, frame: WireFrame) -> Result<(), Error> {
        let seq = frame.seq;
        let bytes = frame.to_bytes()?;
        trace!(target: "remote", "send `{command}` (seq {seq}, {} bytes)", bytes.len());
        if let Err(e) = self.transport.send(&bytes) {
            return Err(self.transport_lost(e.to_string()));
        }
        self.in_flight = Some(InFlight {
            seq,
            command,
            sent_at: Instant::now(),
        });
        Ok(())
    }

    fn send_next(&mut self) -> Result<(), Error> {
        if let Some((command, frame)) = self.queue.pop_front() {
            self.send_frame(command, frame)?;
        }
        Ok(())
    }

    /// Read from the transport for at most `timeout` and dispatch every complete frame.
    fn pump(&mut self, timeout: Duration) -> Result<(), Error> {
        let mut buf = [0u8; 4096];
        match self.transport.recv(&mut buf, timeout) {
            Ok(0) => return Err(self.transport_lost("connection closed by peer".to_string())),
            Ok(n) => self.decoder.feed(&buf[..n]),
            Err(e) if is_timeout(&e) => return Ok(()),
            Err(e) => return Err(self.transport_lost(e.to_string())),
        }

        while let Some(frame) = self.decoder.next_frame()? {
            self.dispatch(frame)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, frame: WireFrame) -> Result<(), Error> {
        let result = match Opcode::try_from(frame.opcode)? {
            Opcode::Event => {
                if frame.seq != EVENT_SEQ {
                    warn!(target: "remote", "event frame with sequence {}", frame.seq);
                }
                let event: DebugEvent = from_payload(frame.payload)?;
                trace!(target: "remote", "event {event:?}");
                self.events.push_back(event);
                return Ok(());
            }
            Opcode::Ok => Ok(frame.payload),
            Opcode::Fail => {
                let message: String = from_payload(frame.payload)?;
                Err(message)
            }
            op => {
                return Err(Error::Protocol {
                    command: self.current_command().to_string(),
                    message: format!("unexpected {op:?} frame from agent"),
                })
            }
        };

        match &self.in_flight {
            Some(in_flight) if in_flight.seq == frame.seq => {
                let command = in_flight.command;
                self.in_flight = None;
                let result = result.map_err(|message| Error::BackendRejected {
                    command: command.to_string(),
                    message,
                });
                self.completed.insert(frame.seq, result);
                self.send_next()
            }
            _ if self.abandoned.remove(&frame.seq) => {
                debug!(target: "remote", "drop late response to abandoned request {}", frame.seq);
                Ok(())
            }
            _ => Err(Error::Protocol {
                command: self.current_command().to_string(),
                message: format!("response with unexpected sequence {}", frame.seq),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::remote::codec::{to_payload, Blob};
    use crate::debugger::remote::proto::Response;
    use crate::debugger::transport::MemoryTransport;
    use std::sync::{Arc, Mutex};

    /// Agent end driven by hand.
    struct FakeAgent {
        transport: MemoryTransport,
        decoder: FrameDecoder,
    }

    impl FakeAgent {
        fn new(transport: MemoryTransport) -> Self {
            Self {
                transport,
                decoder: FrameDecoder::default(),
            }
        }

        /// Every request frame that arrives within `timeout`.
        fn received(&mut self, timeout: Duration) -> Vec<WireFrame> {
            let mut buf = [0u8; 4096];
            if let Ok(n) = self.transport.recv(&mut buf, timeout) {
                self.decoder.feed(&buf[..n]);
            }
            let mut frames = vec![];
            while let Some(frame) = self.decoder.next_frame().unwrap() {
                frames.push(frame);
            }
            frames
        }

        fn send(&mut self, frame: WireFrame) {
            self.transport.send(&frame.to_bytes().unwrap()).unwrap();
        }
    }

    fn channel(timeout: Duration) -> (RemoteChannel, FakeAgent) {
        let (host, agent) = MemoryTransport::pair();
        (
            RemoteChannel::new(Box::new(host), timeout, 3),
            FakeAgent::new(agent),
        )
    }

    fn read(address: u64) -> Request {
        Request::ReadMemory { address, len: 1 }
    }

    #[test]
    fn test_requests_are_serialized() {
        let (mut channel, mut agent) = channel(Duration::from_secs(5));

        let tickets: Vec<_> = (0..3).map(|i| channel.submit(&read(i)).unwrap()).collect();
        assert_eq!(
            tickets.iter().map(|t| t.seq()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(channel.pending(), 3);

        for (i, ticket) in tickets.into_iter().enumerate() {
            let frames = agent.received(Duration::from_millis(50));
            assert_eq!(frames.len(), 1, "only one request may be on the wire");
            assert_eq!(frames[0].seq, i as u32 + 1);
            assert_eq!(
                Request::from_frame(&frames[0]).unwrap(),
                read(i as u64)
            );

            agent.send(WireFrame::new(
                Opcode::Event as u8,
                EVENT_SEQ,
                to_payload(&DebugEvent::Output(format!("line {i}"))),
            ));
            agent.send(Response::ok(&Blob(vec![i as u8])).to_frame(frames[0].seq));

            let payload = channel.wait(ticket).unwrap();
            assert_eq!(from_payload::<Blob>(payload).unwrap(), Blob(vec![i as u8]));
        }
        assert_eq!(channel.pending(), 0);

        for i in 0..3 {
            assert_eq!(
                channel.poll_event(Duration::ZERO).unwrap(),
                Some(DebugEvent::Output(format!("line {i}")))
            );
        }
    }

    #[test]
    fn test_fail_response() {
        let (mut channel, mut agent) = channel(Duration::from_secs(5));
        let ticket = channel.submit(&Request::Threads).unwrap();
        let frame = agent.received(Duration::from_millis(50)).remove(0);
        agent.send(Response::Fail("no process".to_string()).to_frame(frame.seq));

        match channel.wait(ticket) {
            Err(Error::BackendRejected { command, message }) => {
                assert_eq!(command, "threads");
                assert_eq!(message, "no process");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_arbitration() {
        let (mut channel, mut agent) = channel(Duration::from_millis(20));
        let asked = Arc::new(Mutex::new(vec![]));
        let asked_in_arbiter = asked.clone();
        channel.set_timeout_arbiter(Box::new(move |command, waited| {
            let mut asked = asked_in_arbiter.lock().unwrap();
            asked.push((command.to_string(), waited));
            if asked.len() == 1 {
                TimeoutDecision::WaitLonger
            } else {
                TimeoutDecision::Abort
            }
        }));

        let err = channel.call::<()>(&Request::Ping).unwrap_err();
        assert!(matches!(err, Error::ResponseTimeout { ref command, .. } if command == "ping"));
        {
            let asked = asked.lock().unwrap();
            assert_eq!(asked.len(), 2);
            assert!(asked[1].1 >= Duration::from_millis(40));
        }

        // late answer to the abandoned request is dropped, the next request still works
        let frames = agent.received(Duration::from_millis(50));
        assert_eq!(frames.len(), 1);
        agent.send(Response::ok(&()).to_frame(frames[0].seq));

        let ticket = channel.submit(&Request::Ping).unwrap();
        let frames = agent.received(Duration::from_millis(50));
        assert_eq!(frames[0].seq, ticket.seq());
        agent.send(Response::ok(&()).to_frame(ticket.seq()));
        assert!(channel.wait(ticket).is_ok());
    }

    #[test]
    fn test_transport_loss_is_fatal() {
        let (mut channel, agent) = channel(Duration::from_secs(5));
        drop(agent);

        let err = channel.call::<()>(&Request::Ping).unwrap_err();
        assert!(matches!(err, Error::TransportLost { .. }));
        assert!(err.is_fatal());
        assert!(matches!(
            channel.poll_event(Duration::ZERO),
            Err(Error::TransportLost { .. })
        ));
    }

    #[test]
    fn test_unexpected_sequence() {
        let (mut channel, mut agent) = channel(Duration::from_secs(5));
        let ticket = channel.submit(&Request::Ping).unwrap();
        agent.send(Response::ok(&()).to_frame(ticket.seq() + 10));
        assert!(matches!(channel.wait(ticket), Err(Error::Protocol { .. })));
    }
}
