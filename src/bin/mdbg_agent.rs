//! Remote agent: serves the remote protocol over standard streams or a TCP listener and drives
//! a local backend for the host.
use clap::{Parser, ValueEnum};
use log::{info, warn};
use mdbg::debugger::backend::ptrace::PtraceBackend;
use mdbg::debugger::backend::script::ScriptBackend;
use mdbg::debugger::remote::{Agent, BackendFactory};
use mdbg::debugger::transport::{StdioTransport, TcpTransport, Transport};
use mdbg::debugger::{Backend, CancellationToken, Config};
use std::net::TcpListener;
use std::path::PathBuf;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Ptrace,
    Script,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend that runs deployed programs
    #[arg(short, long, value_enum, default_value_t = BackendArg::Script)]
    backend: BackendArg,

    /// Accept host connections on this address instead of serving standard streams
    #[arg(short, long)]
    listen: Option<String>,

    /// Root directory of deployed files
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn factory(backend: BackendArg, config: &Config) -> BackendFactory {
    let config = config.clone();
    match backend {
        BackendArg::Ptrace => {
            Box::new(move || Box::new(PtraceBackend::new(&config.ptrace)) as Box<dyn Backend>)
        }
        BackendArg::Script => {
            Box::new(move || Box::new(ScriptBackend::new(&config.script)) as Box<dyn Backend>)
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_file(args.config.as_deref())?;
    // standard output belongs to the protocol, log records go to stderr
    mdbg::log::init(&config.session.log_filter);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())?;
    }

    let Some(addr) = args.listen.as_deref() else {
        let mut agent = Agent::new(
            Box::new(StdioTransport::default()),
            &args.root,
            factory(args.backend, &config),
        );
        agent.serve(&cancel)?;
        return Ok(());
    };

    let listener = TcpListener::bind(addr)?;
    info!(target: "remote", "agent listens on {}", listener.local_addr()?);
    // one host at a time
    for stream in listener.incoming() {
        if cancel.is_cancelled() {
            break;
        }
        let transport = match stream.and_then(TcpTransport::from_stream) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(target: "remote", "accept connection: {e}");
                continue;
            }
        };
        let transport: Box<dyn Transport> = Box::new(transport);
        let mut agent = Agent::new(transport, &args.root, factory(args.backend, &config));
        if let Err(e) = agent.serve(&cancel) {
            warn!(target: "remote", "session with host ended: {e:#}");
        }
    }
    Ok(())
}
