//! Agent on a remote target, reached over a byte-stream transport.
use crate::debugger::backend::{
    AttachMode, Backend, BackendVariant, Capabilities, FrameRef, InstallRequest, RetryPolicy,
    Target, TimeoutArbiter, TimeoutDecision,
};
use crate::debugger::breakpoint::BreakpointId;
use crate::debugger::command::ResumeCommand;
use crate::debugger::config::RemoteSection;
use crate::debugger::error::Error;
use crate::debugger::event::DebugEvent;
use crate::debugger::location::{Frame, Location};
use crate::debugger::register::RegisterSet;
use crate::debugger::remote::codec::{from_payload, Blob};
use crate::debugger::remote::proto::{Request, PROTOCOL_VERSION};
use crate::debugger::remote::{deploy, RemoteChannel};
use crate::debugger::thread::{ThreadId, ThreadInfo};
use crate::debugger::transport::{PipeTransport, SerialTransport, TcpTransport, Transport};
use crate::debugger::variable::value::Variable;
use crate::weak_error;
use log::info;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Opens a fresh transport for every connection attempt.
pub type TransportOpener = Box<dyn FnMut() -> io::Result<Box<dyn Transport>> + Send>;

pub struct RemoteBackend {
    config: RemoteSection,
    description: String,
    opener: TransportOpener,
    channel: Option<RemoteChannel>,
    arbiter: Option<Arc<Mutex<TimeoutArbiter>>>,
}

impl RemoteBackend {
    pub fn new(
        config: &RemoteSection,
        description: impl Into<String>,
        opener: TransportOpener,
    ) -> Self {
        Self {
            config: config.clone(),
            description: description.into(),
            opener,
            channel: None,
            arbiter: None,
        }
    }

    /// Agent behind a TCP network proxy.
    pub fn tcp(config: &RemoteSection, addr: String) -> Self {
        let timeout = config.response_timeout();
        let description = format!("tcp {addr}");
        Self::new(
            config,
            description,
            Box::new(move || {
                TcpTransport::connect(addr.as_str(), timeout)
                    .map(|t| Box::new(t) as Box<dyn Transport>)
            }),
        )
    }

    /// Agent on a serial line (or an RFCOMM tty).
    pub fn serial(config: &RemoteSection, device: PathBuf) -> Self {
        let baud = config.baud_rate;
        let description = format!("serial {}", device.display());
        Self::new(
            config,
            description,
            Box::new(move || {
                SerialTransport::open(&device, baud).map(|t| Box::new(t) as Box<dyn Transport>)
            }),
        )
    }

    /// Agent spawned as a child process speaking over its standard streams.
    pub fn pipe(config: &RemoteSection, program: PathBuf, args: Vec<String>) -> Self {
        let description = format!("pipe {}", program.display());
        Self::new(
            config,
            description,
            Box::new(move || {
                PipeTransport::spawn(&program, &args).map(|t| Box::new(t) as Box<dyn Transport>)
            }),
        )
    }

    fn channel(&mut self) -> Result<&mut RemoteChannel, Error> {
        self.channel.as_mut().ok_or_else(|| Error::BackendRejected {
            command: "remote".to_string(),
            message: "not connected to an agent".to_string(),
        })
    }

    fn install_arbiter(&mut self) {
        let (Some(arbiter), Some(channel)) = (&self.arbiter, self.channel.as_mut()) else {
            return;
        };
        let arbiter = arbiter.clone();
        channel.set_timeout_arbiter(Box::new(move |command, waited| {
            arbiter
                .lock()
                .map(|mut decide| (*decide)(command, waited))
                .unwrap_or(TimeoutDecision::Abort)
        }));
    }
}

impl Backend for RemoteBackend {
    fn variant(&self) -> BackendVariant {
        BackendVariant::Remote
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            live_breakpoints: false,
            memory: true,
            registers: true,
            locals: true,
            attach_process: false,
            attach_core: false,
            resumable: true,
        }
    }

    fn connection_target(&self) -> String {
        self.description.clone()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.max_attempts,
            interval: self.config.retry_interval(),
        }
    }

    fn connect(&mut self, _attempt: u32) -> Result<(), Error> {
        let transport = (self.opener)()?;
        let mut channel = RemoteChannel::new(
            transport,
            self.config.response_timeout(),
            self.config.max_timeout_extensions,
        );
        let greeting: String = channel.call(&Request::Hello {
            version: PROTOCOL_VERSION,
        })?;
        info!(target: "remote", "connected to {} over {}", greeting, channel.describe());

        self.channel = Some(channel);
        self.install_arbiter();
        Ok(())
    }

    fn start(&mut self, mode: &AttachMode, target: &Target) -> Result<(), Error> {
        if !matches!(mode, AttachMode::Launch | AttachMode::AttachToRemote) {
            return Err(Error::NotSupported {
                command: "start",
                reason: "remote agents only launch deployed programs".to_string(),
            });
        }
        let chunk_size = self.config.chunk_size;
        let deploy_dir = PathBuf::from(&self.config.deploy_dir);
        let channel = self.channel()?;

        let program = deploy(channel, &target.program, &deploy_dir, chunk_size)?;
        channel.call::<()>(&Request::CreateProcess {
            program,
            args: target.args.clone(),
        })
    }

    fn next_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>, Error> {
        match self.channel.as_mut() {
            Some(channel) => channel.poll_event(timeout),
            None => {
                thread::sleep(timeout.min(Duration::from_millis(10)));
                Ok(None)
            }
        }
    }

    fn resume(&mut self, thread: ThreadId, command: &ResumeCommand) -> Result<(), Error> {
        self.channel()?.call(&Request::Resume {
            thread,
            command: command.clone(),
        })
    }

    fn interrupt(&mut self) -> Result<(), Error> {
        self.channel()?.call(&Request::Interrupt)
    }

    fn terminate(&mut self) -> Result<(), Error> {
        if let Some(mut channel) = self.channel.take() {
            weak_error!(channel.call::<()>(&Request::Terminate), "remote terminate:");
            weak_error!(channel.call::<()>(&Request::Goodbye), "remote goodbye:");
        }
        Ok(())
    }

    fn insert_breakpoint(&mut self, request: &InstallRequest) -> Result<Location, Error> {
        self.channel()?
            .call(&Request::InsertBreakpoint(request.clone()))
    }

    fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error> {
        self.channel()?.call(&Request::RemoveBreakpoint(id))
    }

    fn threads(&mut self) -> Result<Vec<ThreadInfo>, Error> {
        self.channel()?.call(&Request::Threads)
    }

    fn frames(&mut self, thread: ThreadId) -> Result<Vec<Frame>, Error> {
        self.channel()?.call(&Request::Frames(thread))
    }

    fn registers(&mut self, thread: ThreadId) -> Result<RegisterSet, Error> {
        self.channel()?.call(&Request::Registers(thread))
    }

    fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>, Error> {
        let blob: Blob = self.channel()?.call(&Request::ReadMemory {
            address,
            len: len as u32,
        })?;
        Ok(blob.0)
    }

    /// Every read is queued at once and answered in order.
    fn read_memory_many(&mut self, regions: &[(u64, usize)]) -> Vec<Result<Vec<u8>, Error>> {
        let channel = match self.channel.as_mut() {
            Some(channel) => channel,
            None => {
                return regions
                    .iter()
                    .map(|_| {
                        Err(Error::BackendRejected {
                            command: "read-memory".to_string(),
                            message: "not connected to an agent".to_string(),
                        })
                    })
                    .collect()
            }
        };

        let tickets: Vec<_> = regions
            .iter()
            .map(|(address, len)| {
                channel.submit(&Request::ReadMemory {
                    address: *address,
                    len: *len as u32,
                })
            })
            .collect();

        tickets
            .into_iter()
            .map(|ticket| {
                let payload = channel.wait(ticket?)?;
                Ok(from_payload::<Blob>(payload)?.0)
            })
            .collect()
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        self.channel()?.call(&Request::WriteMemory {
            address,
            data: data.to_vec(),
        })
    }

    fn locals(&mut self, frame: FrameRef) -> Result<Vec<Variable>, Error> {
        self.channel()?.call(&Request::Locals(frame))
    }

    fn evaluate(&mut self, frame: FrameRef, expression: &str) -> Result<Variable, Error> {
        self.channel()?.call(&Request::Evaluate {
            frame,
            expression: expression.to_string(),
        })
    }

    fn children(&mut self, frame: FrameRef, parent: &Variable) -> Result<Vec<Variable>, Error> {
        self.channel()?.call(&Request::Children {
            frame,
            parent: parent.clone(),
        })
    }

    fn set_timeout_arbiter(&mut self, arbiter: TimeoutArbiter) {
        self.arbiter = Some(Arc::new(Mutex::new(arbiter)));
        self.install_arbiter();
    }
}

impl Drop for RemoteBackend {
    fn drop(&mut self) {
        if self.channel.is_some() {
            weak_error!(self.terminate());
        }
    }
}

