//! Remote agent frame codec.
//!
//! Frame: `u32 LE length` (of the rest) + `u8 opcode` + `u32 LE sequence` + payload.
//! Payload values: integers are little endian, strings are `u32 LE length + UTF-8`,
//! options and enums start with a `u8` tag.
use crate::debugger::backend::{FrameRef, InstallRequest};
use crate::debugger::breakpoint::{BreakpointId, BreakpointRequest};
use crate::debugger::command::{ResumeCommand, StepKind};
use crate::debugger::error::Error;
use crate::debugger::event::{DebugEvent, StopReason};
use crate::debugger::location::{Frame, Location};
use crate::debugger::register::RegisterSet;
use crate::debugger::thread::{ThreadId, ThreadInfo};
use crate::debugger::variable::value::{RawValue, Variable};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::PathBuf;

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
/// Opcode and sequence number.
const FRAME_HEAD: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireFrame {
    pub opcode: u8,
    pub seq: u32,
    pub payload: Bytes,
}

impl WireFrame {
    pub fn new(opcode: u8, seq: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            seq,
            payload: payload.into(),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        let len = FRAME_HEAD + self.payload.len();
        if len > MAX_FRAME_LEN {
            return Err(protocol(format!("frame of {len} bytes exceeds the limit")));
        }
        dst.reserve(4 + len);
        dst.put_u32_le(len as u32);
        dst.put_u8(self.opcode);
        dst.put_u32_le(self.seq);
        dst.put_slice(&self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn protocol(message: impl Into<String>) -> Error {
    Error::Protocol {
        command: "decode frame".to_string(),
        message: message.into(),
    }
}

/// Incremental frame decoder over a byte stream.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<WireFrame>, Error> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if !(FRAME_HEAD..=MAX_FRAME_LEN).contains(&len) {
            return Err(protocol(format!("invalid frame length {len}")));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }

        self.buf.advance(4);
        let mut frame = self.buf.split_to(len);
        let opcode = frame.get_u8();
        let seq = frame.get_u32_le();
        Ok(Some(WireFrame {
            opcode,
            seq,
            payload: frame.freeze(),
        }))
    }
}

pub trait Encode {
    fn encode(&self, buf: &mut BytesMut);
}

pub trait Decode: Sized {
    fn decode(buf: &mut Bytes) -> Result<Self, Error>;
}

/// Encode a value into a fresh payload.
pub fn to_payload<T: Encode + ?Sized>(value: &T) -> Bytes {
    let mut buf = BytesMut::new();
    value.encode(&mut buf);
    buf.freeze()
}

/// Decode a whole payload, trailing bytes are a protocol error.
pub fn from_payload<T: Decode>(mut payload: Bytes) -> Result<T, Error> {
    let value = T::decode(&mut payload)?;
    if payload.has_remaining() {
        return Err(protocol(format!("{} trailing bytes", payload.remaining())));
    }
    Ok(value)
}

fn need(buf: &Bytes, n: usize) -> Result<(), Error> {
    if buf.remaining() < n {
        return Err(protocol(format!(
            "truncated payload, need {n} bytes, {} left",
            buf.remaining()
        )));
    }
    Ok(())
}

fn unknown_tag(what: &str, tag: u8) -> Error {
    protocol(format!("unknown {what} tag {tag}"))
}

macro_rules! impl_int {
    ($t: ty, $put: ident, $get: ident, $size: expr) => {
        impl Encode for $t {
            fn encode(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }
        }

        impl Decode for $t {
            fn decode(buf: &mut Bytes) -> Result<Self, Error> {
                need(buf, $size)?;
                Ok(buf.$get())
            }
        }
    };
}

impl_int!(u8, put_u8, get_u8, 1);
impl_int!(u32, put_u32_le, get_u32_le, 4);
impl_int!(u64, put_u64_le, get_u64_le, 8);
impl_int!(i32, put_i32_le, get_i32_le, 4);
impl_int!(i64, put_i64_le, get_i64_le, 8);
impl_int!(f64, put_f64_le, get_f64_le, 8);

impl Encode for () {
    fn encode(&self, _: &mut BytesMut) {}
}

impl Decode for () {
    fn decode(_: &mut Bytes) -> Result<Self, Error> {
        Ok(())
    }
}

impl Encode for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(*self as u8);
    }
}

impl Decode for bool {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(unknown_tag("bool", tag)),
        }
    }
}

impl Encode for str {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        buf.put_slice(self.as_bytes());
    }
}

impl Encode for String {
    fn encode(&self, buf: &mut BytesMut) {
        self.as_str().encode(buf)
    }
}

impl Decode for String {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        let len = u32::decode(buf)? as usize;
        need(buf, len)?;
        let raw = buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|e| protocol(format!("invalid string: {e}")))
    }
}

impl Encode for PathBuf {
    fn encode(&self, buf: &mut BytesMut) {
        self.to_string_lossy().encode(buf)
    }
}

impl Decode for PathBuf {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        String::decode(buf).map(PathBuf::from)
    }
}

/// Raw byte block, encoded like a string without UTF-8 validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl Encode for Blob {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.0.len() as u32);
        buf.put_slice(&self.0);
    }
}

impl Decode for Blob {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        let len = u32::decode(buf)? as usize;
        need(buf, len)?;
        Ok(Blob(buf.split_to(len).to_vec()))
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            None => buf.put_u8(0),
            Some(v) => {
                buf.put_u8(1);
                v.encode(buf);
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        match u8::decode(buf)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(buf)?)),
            tag => Err(unknown_tag("option", tag)),
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        self.iter().for_each(|v| v.encode(buf));
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        let len = u32::decode(buf)? as usize;
        // every element takes at least one byte
        need(buf, len.min(buf.remaining() + 1))?;
        (0..len).map(|_| T::decode(buf)).collect()
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
        self.1.encode(buf);
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Ok((A::decode(buf)?, B::decode(buf)?))
    }
}

impl Encode for ThreadId {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf)
    }
}

impl Decode for ThreadId {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        u64::decode(buf).map(ThreadId)
    }
}

impl Encode for BreakpointId {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf)
    }
}

impl Decode for BreakpointId {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        u32::decode(buf).map(BreakpointId)
    }
}

impl Encode for ThreadInfo {
    fn encode(&self, buf: &mut BytesMut) {
        self.id.encode(buf);
        self.label.encode(buf);
    }
}

impl Decode for ThreadInfo {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Ok(ThreadInfo {
            id: ThreadId::decode(buf)?,
            label: String::decode(buf)?,
        })
    }
}

impl Encode for Location {
    fn encode(&self, buf: &mut BytesMut) {
        self.function.encode(buf);
        self.file.encode(buf);
        self.line.encode(buf);
        self.address.encode(buf);
    }
}

impl Decode for Location {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Ok(Location {
            function: Option::decode(buf)?,
            file: Option::decode(buf)?,
            line: Option::decode(buf)?,
            address: Option::decode(buf)?,
        })
    }
}

impl Encode for Frame {
    fn encode(&self, buf: &mut BytesMut) {
        self.level.encode(buf);
        self.location.encode(buf);
    }
}

impl Decode for Frame {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Ok(Frame {
            level: u32::decode(buf)?,
            location: Location::decode(buf)?,
        })
    }
}

impl Encode for FrameRef {
    fn encode(&self, buf: &mut BytesMut) {
        self.thread.encode(buf);
        self.level.encode(buf);
    }
}

impl Decode for FrameRef {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Ok(FrameRef {
            thread: ThreadId::decode(buf)?,
            level: u32::decode(buf)?,
        })
    }
}

impl Encode for RegisterSet {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        for (name, value) in self.iter() {
            name.encode(buf);
            value.encode(buf);
        }
    }
}

impl Decode for RegisterSet {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        let pairs: Vec<(String, u64)> = Vec::decode(buf)?;
        Ok(pairs.into_iter().collect())
    }
}

impl Encode for BreakpointRequest {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            BreakpointRequest::Function(name) => {
                buf.put_u8(0);
                name.encode(buf);
            }
            BreakpointRequest::Line { file, line } => {
                buf.put_u8(1);
                file.encode(buf);
                line.encode(buf);
            }
            BreakpointRequest::Address(addr) => {
                buf.put_u8(2);
                addr.encode(buf);
            }
        }
    }
}

impl Decode for BreakpointRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Ok(match u8::decode(buf)? {
            0 => BreakpointRequest::Function(String::decode(buf)?),
            1 => BreakpointRequest::Line {
                file: PathBuf::decode(buf)?,
                line: u64::decode(buf)?,
            },
            2 => BreakpointRequest::Address(u64::decode(buf)?),
            tag => return Err(unknown_tag("breakpoint request", tag)),
        })
    }
}

impl Encode for InstallRequest {
    fn encode(&self, buf: &mut BytesMut) {
        self.id.encode(buf);
        self.request.encode(buf);
        self.condition.encode(buf);
        self.ignore_count.encode(buf);
    }
}

impl Decode for InstallRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Ok(InstallRequest {
            id: BreakpointId::decode(buf)?,
            request: BreakpointRequest::decode(buf)?,
            condition: Option::decode(buf)?,
            ignore_count: u32::decode(buf)?,
        })
    }
}

impl Encode for ResumeCommand {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            ResumeCommand::Continue => buf.put_u8(0),
            ResumeCommand::Step(kind) => {
                buf.put_u8(1);
                buf.put_u8(match kind {
                    StepKind::Over => 0,
                    StepKind::Into => 1,
                    StepKind::Out => 2,
                    StepKind::Instruction => 3,
                });
            }
            ResumeCommand::RunToLine { file, line } => {
                buf.put_u8(2);
                file.encode(buf);
                line.encode(buf);
            }
            ResumeCommand::RunToFunction(name) => {
                buf.put_u8(3);
                name.encode(buf);
            }
            ResumeCommand::ReturnFromFrame => buf.put_u8(4),
        }
    }
}

impl Decode for ResumeCommand {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Ok(match u8::decode(buf)? {
            0 => ResumeCommand::Continue,
            1 => ResumeCommand::Step(match u8::decode(buf)? {
                0 => StepKind::Over,
                1 => StepKind::Into,
                2 => StepKind::Out,
                3 => StepKind::Instruction,
                tag => return Err(unknown_tag("step kind", tag)),
            }),
            2 => ResumeCommand::RunToLine {
                file: PathBuf::decode(buf)?,
                line: u64::decode(buf)?,
            },
            3 => ResumeCommand::RunToFunction(String::decode(buf)?),
            4 => ResumeCommand::ReturnFromFrame,
            tag => return Err(unknown_tag("resume command", tag)),
        })
    }
}

impl Encode for StopReason {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            StopReason::Breakpoint(id) => {
                buf.put_u8(0);
                id.encode(buf);
            }
            StopReason::Step => buf.put_u8(1),
            StopReason::Signal(sig) => {
                buf.put_u8(2);
                sig.encode(buf);
            }
            StopReason::Interrupted => buf.put_u8(3),
            StopReason::Snapshot => buf.put_u8(4),
        }
    }
}

impl Decode for StopReason {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Ok(match u8::decode(buf)? {
            0 => StopReason::Breakpoint(BreakpointId::decode(buf)?),
            1 => StopReason::Step,
            2 => StopReason::Signal(String::decode(buf)?),
            3 => StopReason::Interrupted,
            4 => StopReason::Snapshot,
            tag => return Err(unknown_tag("stop reason", tag)),
        })
    }
}

impl Encode for RawValue {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            RawValue::Int(v) => {
                buf.put_u8(0);
                v.encode(buf);
            }
            RawValue::UInt(v) => {
                buf.put_u8(1);
                v.encode(buf);
            }
            RawValue::Float(v) => {
                buf.put_u8(2);
                v.encode(buf);
            }
            RawValue::Bool(v) => {
                buf.put_u8(3);
                v.encode(buf);
            }
            RawValue::Text(v) => {
                buf.put_u8(4);
                v.encode(buf);
            }
            RawValue::Pointer(v) => {
                buf.put_u8(5);
                v.encode(buf);
            }
            RawValue::Aggregate { summary, children } => {
                buf.put_u8(6);
                summary.encode(buf);
                children.map(|c| c as u64).encode(buf);
            }
            RawValue::Unavailable(reason) => {
                buf.put_u8(7);
                reason.encode(buf);
            }
        }
    }
}

impl Decode for RawValue {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Ok(match u8::decode(buf)? {
            0 => RawValue::Int(i64::decode(buf)?),
            1 => RawValue::UInt(u64::decode(buf)?),
            2 => RawValue::Float(f64::decode(buf)?),
            3 => RawValue::Bool(bool::decode(buf)?),
            4 => RawValue::Text(String::decode(buf)?),
            5 => RawValue::Pointer(u64::decode(buf)?),
            6 => RawValue::Aggregate {
                summary: Option::decode(buf)?,
                children: Option::<u64>::decode(buf)?.map(|c| c as usize),
            },
            7 => RawValue::Unavailable(String::decode(buf)?),
            tag => return Err(unknown_tag("value", tag)),
        })
    }
}

impl Encode for Variable {
    fn encode(&self, buf: &mut BytesMut) {
        self.name.encode(buf);
        self.expression.encode(buf);
        self.type_name.encode(buf);
        self.address.encode(buf);
        self.value.encode(buf);
    }
}

impl Decode for Variable {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Ok(Variable {
            name: String::decode(buf)?,
            expression: String::decode(buf)?,
            type_name: String::decode(buf)?,
            address: Option::decode(buf)?,
            value: RawValue::decode(buf)?,
        })
    }
}

impl Encode for DebugEvent {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            DebugEvent::Ready { process } => {
                buf.put_u8(0);
                process.encode(buf);
            }
            DebugEvent::Running => buf.put_u8(1),
            DebugEvent::Stopped {
                thread,
                reason,
                location,
            } => {
                buf.put_u8(2);
                thread.encode(buf);
                reason.encode(buf);
                location.encode(buf);
            }
            DebugEvent::ModuleLoaded { name } => {
                buf.put_u8(3);
                name.encode(buf);
            }
            DebugEvent::ModuleUnloaded { name } => {
                buf.put_u8(4);
                name.encode(buf);
            }
            DebugEvent::ThreadCreated { thread } => {
                buf.put_u8(5);
                thread.encode(buf);
            }
            DebugEvent::ThreadExited { thread } => {
                buf.put_u8(6);
                thread.encode(buf);
            }
            DebugEvent::Output(line) => {
                buf.put_u8(7);
                line.encode(buf);
            }
            DebugEvent::Exited { code } => {
                buf.put_u8(8);
                code.encode(buf);
            }
        }
    }
}

impl Decode for DebugEvent {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Ok(match u8::decode(buf)? {
            0 => DebugEvent::Ready {
                process: u64::decode(buf)?,
            },
            1 => DebugEvent::Running,
            2 => DebugEvent::Stopped {
                thread: ThreadId::decode(buf)?,
                reason: StopReason::decode(buf)?,
                location: Location::decode(buf)?,
            },
            3 => DebugEvent::ModuleLoaded {
                name: String::decode(buf)?,
            },
            4 => DebugEvent::ModuleUnloaded {
                name: String::decode(buf)?,
            },
            5 => DebugEvent::ThreadCreated {
                thread: ThreadId::decode(buf)?,
            },
            6 => DebugEvent::ThreadExited {
                thread: ThreadId::decode(buf)?,
            },
            7 => DebugEvent::Output(String::decode(buf)?),
            8 => DebugEvent::Exited {
                code: i32::decode(buf)?,
            },
            tag => return Err(unknown_tag("event", tag)),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = WireFrame::new(0x20, 7, Bytes::from_static(b"abc"));
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[8, 0, 0, 0, 0x20, 7, 0, 0, 0, b'a', b'b', b'c']
        );
    }

    #[test]
    fn test_decoder_handles_partial_and_batched_input() {
        let mut wire = BytesMut::new();
        WireFrame::new(1, 1, Bytes::new()).encode(&mut wire).unwrap();
        WireFrame::new(2, 0, Bytes::from_static(b"xyz"))
            .encode(&mut wire)
            .unwrap();

        let mut decoder = FrameDecoder::default();
        decoder.feed(&wire[..3]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.feed(&wire[3..]);

        let first = decoder.next_frame().unwrap().unwrap();
        assert_eq!((first.opcode, first.seq), (1, 1));
        let second = decoder.next_frame().unwrap().unwrap();
        assert_eq!((second.opcode, second.seq), (2, 0));
        assert_eq!(second.payload.as_ref(), b"xyz");
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn test_invalid_frame_length() {
        struct TestCase {
            len: u32,
        }
        let cases = vec![
            TestCase { len: 0 },
            TestCase { len: 4 },
            TestCase {
                len: MAX_FRAME_LEN as u32 + 1,
            },
        ];
        for tc in cases {
            let mut decoder = FrameDecoder::default();
            decoder.feed(&tc.len.to_le_bytes());
            assert!(matches!(
                decoder.next_frame(),
                Err(Error::Protocol { .. })
            ));
        }
    }

    #[test]
    fn test_payload_values() {
        let event = DebugEvent::Stopped {
            thread: ThreadId(3),
            reason: StopReason::Breakpoint(BreakpointId(2)),
            location: Location::at_line("main.mds", 12).with_function("main"),
        };
        assert_eq!(from_payload::<DebugEvent>(to_payload(&event)).unwrap(), event);

        let var = Variable::new(
            "p",
            "p",
            "record",
            RawValue::Aggregate {
                summary: None,
                children: Some(2),
            },
        );
        assert_eq!(from_payload::<Variable>(to_payload(&var)).unwrap(), var);

        let s = to_payload("héllo");
        assert_eq!(&s[..4], &[6, 0, 0, 0]);
    }

    #[test]
    fn test_malformed_payloads() {
        struct TestCase {
            payload: &'static [u8],
        }
        let cases = vec![
            // truncated string
            TestCase {
                payload: &[10, 0, 0, 0, b'a'],
            },
            // unknown event tag
            TestCase { payload: &[0xff] },
            // invalid utf-8
            TestCase {
                payload: &[7, 1, 0, 0, 0, 0xff],
            },
            // trailing bytes
            TestCase {
                payload: &[1, 0],
            },
        ];
        for tc in cases {
            let result = from_payload::<DebugEvent>(Bytes::from_static(tc.payload));
            assert!(matches!(result, Err(Error::Protocol { .. })), "{:?}", tc.payload);
        }
    }
}
