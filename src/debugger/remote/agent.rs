//! Agent side of the remote protocol: serves requests by driving a local backend.
use crate::debugger::backend::{AttachMode, Backend, Target};
use crate::debugger::cancel::CancellationToken;
use crate::debugger::error::Error;
use crate::debugger::remote::codec::{to_payload, Blob, FrameDecoder, WireFrame};
use crate::debugger::remote::proto::{Opcode, Request, Response, EVENT_SEQ, PROTOCOL_VERSION};
use crate::debugger::transport::{is_timeout, Transport};
use crate::weak_error;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Request poll granularity, events of a running debuggee are forwarded between two polls.
const TICK: Duration = Duration::from_millis(5);

/// Creates a fresh backend for each `create-process` request.
pub type BackendFactory = Box<dyn FnMut() -> Box<dyn Backend> + Send>;

pub struct Agent {
    transport: Box<dyn Transport>,
    decoder: FrameDecoder,
    root: PathBuf,
    factory: BackendFactory,
    backend: Option<Box<dyn Backend>>,
    files: HashMap<u32, (File, PathBuf)>,
    next_handle: u32,
}

impl Agent {
    /// Agent serving over `transport`. Deployed files live under `root`.
    pub fn new(transport: Box<dyn Transport>, root: impl Into<PathBuf>, factory: BackendFactory) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::default(),
            root: root.into(),
            factory,
            backend: None,
            files: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Serve until the host says goodbye, closes the transport or `cancel` fires.
    pub fn serve(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        info!(target: "remote", "agent serving on {}", self.transport.describe());
        let mut buf = [0u8; 4096];

        loop {
            if cancel.is_cancelled() {
                self.shutdown();
                return Ok(());
            }
            self.forward_events()?;

            match self.transport.recv(&mut buf, TICK) {
                Ok(0) => {
                    info!(target: "remote", "host closed the connection");
                    self.shutdown();
                    return Ok(());
                }
                Ok(n) => self.decoder.feed(&buf[..n]),
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    self.shutdown();
                    return Err(e.into());
                }
            }

            while let Some(frame) = self.decoder.next_frame()? {
                let seq = frame.seq;
                let request = match Request::from_frame(&frame) {
                    Ok(request) => request,
                    Err(e) => {
                        self.reply(seq, Response::Fail(e.to_string()))?;
                        continue;
                    }
                };
                debug!(target: "remote", "request `{}` (seq {seq})", request.name());

                let goodbye = request == Request::Goodbye;
                let response = self
                    .handle(request)
                    .unwrap_or_else(|e| Response::Fail(failure_text(e)));
                self.reply(seq, response)?;
                if goodbye {
                    self.shutdown();
                    return Ok(());
                }
            }
        }
    }

    fn reply(&mut self, seq: u32, response: Response) -> Result<(), Error> {
        self.send(response.to_frame(seq))
    }

    fn send(&mut self, frame: WireFrame) -> Result<(), Error> {
        self.transport.send(&frame.to_bytes()?)?;
        Ok(())
    }

    fn forward_events(&mut self) -> Result<(), Error> {
        let mut events = vec![];
        if let Some(backend) = self.backend.as_mut() {
            loop {
                match backend.next_event(Duration::ZERO) {
                    Ok(Some(event)) => events.push(event),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(target: "remote", "backend event: {e:#}");
                        break;
                    }
                }
            }
        }
        for event in events {
            self.send(WireFrame::new(Opcode::Event as u8, EVENT_SEQ, to_payload(&event)))?;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            weak_error!(backend.terminate(), "agent shutdown:");
        }
        self.files.clear();
    }

    fn backend(&mut self) -> Result<&mut Box<dyn Backend>, Error> {
        self.backend.as_mut().ok_or_else(|| Error::BackendRejected {
            command: "agent".to_string(),
            message: "no process".to_string(),
        })
    }

    /// Map a host supplied path into the agent root, paths leaving the root are rejected.
    fn resolve(&self, path: &Path) -> Result<PathBuf, Error> {
        let inside = path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !inside || path.as_os_str().is_empty() {
            return Err(Error::BackendRejected {
                command: "resolve path".to_string(),
                message: format!("{} is outside of the agent root", path.display()),
            });
        }
        Ok(self.root.join(path))
    }

    fn handle(&mut self, request: Request) -> Result<Response, Error> {
        let response = match request {
            Request::Hello { version } => {
                if version != PROTOCOL_VERSION {
                    return Ok(Response::Fail(format!(
                        "protocol version {version} is not supported, expect {PROTOCOL_VERSION}"
                    )));
                }
                Response::ok(&format!("mdbg-agent {}", env!("CARGO_PKG_VERSION")))
            }
            Request::Ping | Request::Goodbye => Response::ok(&()),

            Request::DeleteFile { path } => {
                let path = self.resolve(&path)?;
                match fs::remove_file(&path) {
                    Ok(()) => debug!(target: "remote", "{} deleted", path.display()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Response::ok(&())
            }
            Request::OpenFile { path } => {
                let path = self.resolve(&path)?;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let file = File::create(&path)?;
                let handle = self.next_handle;
                self.next_handle += 1;
                self.files.insert(handle, (file, path));
                Response::ok(&handle)
            }
            Request::WriteChunk { handle, data } => {
                let (file, _) = self
                    .files
                    .get_mut(&handle)
                    .ok_or_else(|| Error::NotFound(format!("file handle {handle}")))?;
                file.write_all(&data)?;
                Response::ok(&())
            }
            Request::CloseFile { handle } => {
                let (file, path) = self
                    .files
                    .remove(&handle)
                    .ok_or_else(|| Error::NotFound(format!("file handle {handle}")))?;
                file.sync_all()?;
                debug!(target: "remote", "{} written", path.display());
                Response::ok(&())
            }
            Request::RenameFile { from, to } => {
                fs::rename(self.resolve(&from)?, self.resolve(&to)?)?;
                Response::ok(&())
            }

            Request::CreateProcess { program, args } => {
                let program = self.resolve(&program)?;
                if let Some(mut old) = self.backend.take() {
                    weak_error!(old.terminate(), "terminate previous process:");
                }
                let mut backend = (self.factory)();
                backend.start(
                    &AttachMode::Launch,
                    &Target {
                        program,
                        args,
                        cwd: Some(self.root.clone()),
                    },
                )?;
                self.backend = Some(backend);
                Response::ok(&())
            }
            Request::Terminate => {
                if let Some(mut backend) = self.backend.take() {
                    backend.terminate()?;
                }
                Response::ok(&())
            }
            Request::Resume { thread, command } => {
                self.backend()?.resume(thread, &command)?;
                Response::ok(&())
            }
            Request::Interrupt => {
                self.backend()?.interrupt()?;
                Response::ok(&())
            }

            Request::InsertBreakpoint(request) => {
                Response::ok(&self.backend()?.insert_breakpoint(&request)?)
            }
            Request::RemoveBreakpoint(id) => {
                self.backend()?.remove_breakpoint(id)?;
                Response::ok(&())
            }

            Request::Threads => Response::ok(&self.backend()?.threads()?),
            Request::Frames(thread) => Response::ok(&self.backend()?.frames(thread)?),
            Request::Registers(thread) => Response::ok(&self.backend()?.registers(thread)?),
            Request::ReadMemory { address, len } => {
                let bytes = self.backend()?.read_memory(address, len as usize)?;
                Response::ok(&Blob(bytes))
            }
            Request::WriteMemory { address, data } => {
                self.backend()?.write_memory(address, &data)?;
                Response::ok(&())
            }

            Request::Locals(frame) => Response::ok(&self.backend()?.locals(frame)?),
            Request::Evaluate { frame, expression } => {
                Response::ok(&self.backend()?.evaluate(frame, &expression)?)
            }
            Request::Children { frame, parent } => {
                Response::ok(&self.backend()?.children(frame, &parent)?)
            }
        };
        Ok(response)
    }
}

/// Text of a failure response, backend rejections travel without their command prefix.
fn failure_text(err: Error) -> String {
    match err {
        Error::BackendRejected { message, .. } => message,
        other => other.to_string(),
    }
}
