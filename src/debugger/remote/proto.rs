//! Agent protocol: opcodes and request payloads.
use crate::debugger::backend::{FrameRef, InstallRequest};
use crate::debugger::breakpoint::BreakpointId;
use crate::debugger::command::ResumeCommand;
use crate::debugger::error::Error;
use crate::debugger::remote::codec::{Blob, Decode, Encode, WireFrame};
use crate::debugger::thread::ThreadId;
use crate::debugger::variable::value::Variable;
use bytes::{Bytes, BytesMut};
use std::path::PathBuf;

pub const PROTOCOL_VERSION: u32 = 1;

/// Sequence number of unsolicited event frames.
pub const EVENT_SEQ: u32 = 0;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Hello = 0x01,
    Ping = 0x02,
    Goodbye = 0x03,

    DeleteFile = 0x10,
    OpenFile = 0x11,
    WriteChunk = 0x12,
    CloseFile = 0x13,
    RenameFile = 0x14,

    CreateProcess = 0x20,
    Terminate = 0x21,
    Resume = 0x22,
    Interrupt = 0x23,

    InsertBreakpoint = 0x30,
    RemoveBreakpoint = 0x31,

    Threads = 0x40,
    Frames = 0x41,
    Registers = 0x42,
    ReadMemory = 0x43,
    WriteMemory = 0x44,

    Locals = 0x50,
    Evaluate = 0x51,
    Children = 0x52,

    Ok = 0x80,
    Fail = 0x81,

    Event = 0xA0,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Opcode::*;
        Result::Ok(match value {
            0x01 => Hello,
            0x02 => Ping,
            0x03 => Goodbye,
            0x10 => DeleteFile,
            0x11 => OpenFile,
            0x12 => WriteChunk,
            0x13 => CloseFile,
            0x14 => RenameFile,
            0x20 => CreateProcess,
            0x21 => Terminate,
            0x22 => Resume,
            0x23 => Interrupt,
            0x30 => InsertBreakpoint,
            0x31 => RemoveBreakpoint,
            0x40 => Threads,
            0x41 => Frames,
            0x42 => Registers,
            0x43 => ReadMemory,
            0x44 => WriteMemory,
            0x50 => Locals,
            0x51 => Evaluate,
            0x52 => Children,
            0x80 => Ok,
            0x81 => Fail,
            0xA0 => Event,
            _ => {
                return Err(Error::Protocol {
                    command: "decode frame".to_string(),
                    message: format!("unknown opcode {value:#04x}"),
                })
            }
        })
    }
}

/// Request sent from the debugger to the agent.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Hello { version: u32 },
    Ping,
    Goodbye,

    DeleteFile { path: PathBuf },
    /// Create (truncate) a file for writing, the response carries a handle.
    OpenFile { path: PathBuf },
    WriteChunk { handle: u32, data: Vec<u8> },
    CloseFile { handle: u32 },
    RenameFile { from: PathBuf, to: PathBuf },

    CreateProcess { program: PathBuf, args: Vec<String> },
    Terminate,
    Resume { thread: ThreadId, command: ResumeCommand },
    Interrupt,

    InsertBreakpoint(InstallRequest),
    RemoveBreakpoint(BreakpointId),

    Threads,
    Frames(ThreadId),
    Registers(ThreadId),
    ReadMemory { address: u64, len: u32 },
    WriteMemory { address: u64, data: Vec<u8> },

    Locals(FrameRef),
    Evaluate { frame: FrameRef, expression: String },
    Children { frame: FrameRef, parent: Variable },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Hello { .. } => Opcode::Hello,
            Request::Ping => Opcode::Ping,
            Request::Goodbye => Opcode::Goodbye,
            Request::DeleteFile { .. } => Opcode::DeleteFile,
            Request::OpenFile { .. } => Opcode::OpenFile,
            Request::WriteChunk { .. } => Opcode::WriteChunk,
            Request::CloseFile { .. } => Opcode::CloseFile,
            Request::RenameFile { .. } => Opcode::RenameFile,
            Request::CreateProcess { .. } => Opcode::CreateProcess,
            Request::Terminate => Opcode::Terminate,
            Request::Resume { .. } => Opcode::Resume,
            Request::Interrupt => Opcode::Interrupt,
            Request::InsertBreakpoint(_) => Opcode::InsertBreakpoint,
            Request::RemoveBreakpoint(_) => Opcode::RemoveBreakpoint,
            Request::Threads => Opcode::Threads,
            Request::Frames(_) => Opcode::Frames,
            Request::Registers(_) => Opcode::Registers,
            Request::ReadMemory { .. } => Opcode::ReadMemory,
            Request::WriteMemory { .. } => Opcode::WriteMemory,
            Request::Locals(_) => Opcode::Locals,
            Request::Evaluate { .. } => Opcode::Evaluate,
            Request::Children { .. } => Opcode::Children,
        }
    }

    /// Command name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self.opcode() {
            Opcode::Hello => "hello",
            Opcode::Ping => "ping",
            Opcode::Goodbye => "goodbye",
            Opcode::DeleteFile => "delete-file",
            Opcode::OpenFile => "open-file",
            Opcode::WriteChunk => "write-chunk",
            Opcode::CloseFile => "close-file",
            Opcode::RenameFile => "rename-file",
            Opcode::CreateProcess => "create-process",
            Opcode::Terminate => "terminate",
            Opcode::Resume => "resume",
            Opcode::Interrupt => "interrupt",
            Opcode::InsertBreakpoint => "insert-breakpoint",
            Opcode::RemoveBreakpoint => "remove-breakpoint",
            Opcode::Threads => "threads",
            Opcode::Frames => "frames",
            Opcode::Registers => "registers",
            Opcode::ReadMemory => "read-memory",
            Opcode::WriteMemory => "write-memory",
            Opcode::Locals => "locals",
            Opcode::Evaluate => "evaluate",
            Opcode::Children => "children",
            Opcode::Ok | Opcode::Fail | Opcode::Event => "response",
        }
    }

    pub fn to_frame(&self, seq: u32) -> WireFrame {
        let mut buf = BytesMut::new();
        match self {
            Request::Hello { version } => version.encode(&mut buf),
            Request::Ping | Request::Goodbye | Request::Terminate | Request::Interrupt => {}
            Request::Threads => {}
            Request::DeleteFile { path } | Request::OpenFile { path } => path.encode(&mut buf),
            Request::WriteChunk { handle, data } => {
                handle.encode(&mut buf);
                Blob(data.clone()).encode(&mut buf);
            }
            Request::CloseFile { handle } => handle.encode(&mut buf),
            Request::RenameFile { from, to } => {
                from.encode(&mut buf);
                to.encode(&mut buf);
            }
            Request::CreateProcess { program, args } => {
                program.encode(&mut buf);
                args.encode(&mut buf);
            }
            Request::Resume { thread, command } => {
                thread.encode(&mut buf);
                command.encode(&mut buf);
            }
            Request::InsertBreakpoint(request) => request.encode(&mut buf),
            Request::RemoveBreakpoint(id) => id.encode(&mut buf),
            Request::Frames(thread) | Request::Registers(thread) => thread.encode(&mut buf),
            Request::ReadMemory { address, len } => {
                address.encode(&mut buf);
                len.encode(&mut buf);
            }
            Request::WriteMemory { address, data } => {
                address.encode(&mut buf);
                Blob(data.clone()).encode(&mut buf);
            }
            Request::Locals(frame) => frame.encode(&mut buf),
            Request::Evaluate { frame, expression } => {
                frame.encode(&mut buf);
                expression.encode(&mut buf);
            }
            Request::Children { frame, parent } => {
                frame.encode(&mut buf);
                parent.encode(&mut buf);
            }
        }
        WireFrame::new(self.opcode() as u8, seq, buf.freeze())
    }

    pub fn from_frame(frame: &WireFrame) -> Result<Self, Error> {
        let buf = &mut frame.payload.clone();
        let request = match Opcode::try_from(frame.opcode)? {
            Opcode::Hello => Request::Hello {
                version: u32::decode(buf)?,
            },
            Opcode::Ping => Request::Ping,
            Opcode::Goodbye => Request::Goodbye,
            Opcode::DeleteFile => Request::DeleteFile {
                path: PathBuf::decode(buf)?,
            },
            Opcode::OpenFile => Request::OpenFile {
                path: PathBuf::decode(buf)?,
            },
            Opcode::WriteChunk => Request::WriteChunk {
                handle: u32::decode(buf)?,
                data: Blob::decode(buf)?.0,
            },
            Opcode::CloseFile => Request::CloseFile {
                handle: u32::decode(buf)?,
            },
            Opcode::RenameFile => Request::RenameFile {
                from: PathBuf::decode(buf)?,
                to: PathBuf::decode(buf)?,
            },
            Opcode::CreateProcess => Request::CreateProcess {
                program: PathBuf::decode(buf)?,
                args: Vec::decode(buf)?,
            },
            Opcode::Terminate => Request::Terminate,
            Opcode::Resume => Request::Resume {
                thread: ThreadId::decode(buf)?,
                command: ResumeCommand::decode(buf)?,
            },
            Opcode::Interrupt => Request::Interrupt,
            Opcode::InsertBreakpoint => Request::InsertBreakpoint(InstallRequest::decode(buf)?),
            Opcode::RemoveBreakpoint => Request::RemoveBreakpoint(BreakpointId::decode(buf)?),
            Opcode::Threads => Request::Threads,
            Opcode::Frames => Request::Frames(ThreadId::decode(buf)?),
            Opcode::Registers => Request::Registers(ThreadId::decode(buf)?),
            Opcode::ReadMemory => Request::ReadMemory {
                address: u64::decode(buf)?,
                len: u32::decode(buf)?,
            },
            Opcode::WriteMemory => Request::WriteMemory {
                address: u64::decode(buf)?,
                data: Blob::decode(buf)?.0,
            },
            Opcode::Locals => Request::Locals(FrameRef::decode(buf)?),
            Opcode::Evaluate => Request::Evaluate {
                frame: FrameRef::decode(buf)?,
                expression: String::decode(buf)?,
            },
            Opcode::Children => Request::Children {
                frame: FrameRef::decode(buf)?,
                parent: Variable::decode(buf)?,
            },
            op @ (Opcode::Ok | Opcode::Fail | Opcode::Event) => {
                return Err(Error::Protocol {
                    command: "decode request".to_string(),
                    message: format!("{op:?} is not a request"),
                })
            }
        };
        Ok(request)
    }
}

/// Agent answer to one request.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// Success, the payload is the request specific result.
    Ok(Bytes),
    /// Rejection with a message.
    Fail(String),
}

impl Response {
    pub fn ok<T: Encode + ?Sized>(value: &T) -> Self {
        Response::Ok(crate::debugger::remote::codec::to_payload(value))
    }

    pub fn to_frame(&self, seq: u32) -> WireFrame {
        match self {
            Response::Ok(payload) => WireFrame::new(Opcode::Ok as u8, seq, payload.clone()),
            Response::Fail(message) => {
                let mut buf = BytesMut::new();
                message.encode(&mut buf);
                WireFrame::new(Opcode::Fail as u8, seq, buf.freeze())
            }
        }
    }
}
