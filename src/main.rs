use anyhow::bail;
use clap::{Parser, ValueEnum};
use mdbg::debugger::backend::gdb::GdbBackend;
use mdbg::debugger::backend::ptrace::PtraceBackend;
use mdbg::debugger::backend::remote::RemoteBackend;
use mdbg::debugger::backend::script::ScriptBackend;
use mdbg::debugger::{AttachMode, Backend, Config, Target};
use mdbg::ui::console::{AppBuilder, BackendFactory, Launch};
use std::path::PathBuf;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Gdb,
    Ptrace,
    Script,
    Remote,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Debugger backend
    #[arg(short, long, value_enum, default_value_t = BackendArg::Gdb)]
    backend: BackendArg,

    /// Attach to a running process
    #[arg(short, long, conflicts_with = "core")]
    pid: Option<u32>,

    /// Open a core dump of the program
    #[arg(long)]
    core: Option<PathBuf>,

    /// Agent of the remote backend: `tcp:<host:port>`, `serial:<device>` or `pipe:<agent program>`
    #[arg(short, long, env = "MDBG_REMOTE")]
    remote: Option<String>,

    /// Open a session snapshot instead of running a program
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Path to the configuration file, `~/.config/mdbg/config.toml` by default
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Program to debug (a script for the script backend)
    program: Option<PathBuf>,

    /// Arguments of the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn backend_factory(args: &Args, config: &Config) -> anyhow::Result<BackendFactory> {
    let config = config.clone();
    let factory: BackendFactory = match args.backend {
        BackendArg::Gdb => {
            Box::new(move || Ok(Box::new(GdbBackend::new(&config.gdb)) as Box<dyn Backend>))
        }
        BackendArg::Ptrace => Box::new(move || {
            Ok(Box::new(PtraceBackend::new(&config.ptrace)) as Box<dyn Backend>)
        }),
        BackendArg::Script => Box::new(move || {
            Ok(Box::new(ScriptBackend::new(&config.script)) as Box<dyn Backend>)
        }),
        BackendArg::Remote => {
            let Some(remote) = args.remote.clone() else {
                bail!("the remote backend needs an agent, see --remote");
            };
            let Some((kind, address)) = remote.split_once(':') else {
                bail!("malformed agent `{remote}`, expect <tcp|serial|pipe>:<address>");
            };
            let (kind, address) = (kind.to_string(), address.to_string());
            if !matches!(kind.as_str(), "tcp" | "serial" | "pipe") {
                bail!("unknown agent transport `{kind}`");
            }

            Box::new(move || {
                let remote = &config.remote;
                let backend = match kind.as_str() {
                    "tcp" => RemoteBackend::tcp(remote, address.clone()),
                    "serial" => RemoteBackend::serial(remote, PathBuf::from(&address)),
                    _ => {
                        let mut parts = address.split_whitespace().map(ToString::to_string);
                        let program = PathBuf::from(parts.next().unwrap_or_default());
                        RemoteBackend::pipe(remote, program, parts.collect())
                    }
                };
                Ok(Box::new(backend) as Box<dyn Backend>)
            })
        }
    };
    Ok(factory)
}

fn launch(args: &Args, config: &Config) -> anyhow::Result<Option<Launch>> {
    let Some(program) = args.program.clone() else {
        return Ok(None);
    };

    let mode = match (args.pid, &args.core) {
        (Some(pid), _) => AttachMode::AttachToProcess(pid),
        (None, Some(core)) => AttachMode::AttachToCore(core.clone()),
        (None, None) if args.backend == BackendArg::Remote => AttachMode::AttachToRemote,
        (None, None) => AttachMode::Launch,
    };
    let target = Target {
        program,
        args: args.args.clone(),
        cwd: std::env::current_dir().ok(),
    };

    Ok(Some(Launch {
        factory: backend_factory(args, config)?,
        mode,
        target,
    }))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_file(args.config.as_deref())?;
    mdbg::log::init(&config.session.log_filter);

    let launch = launch(&args, &config)?;
    let builder = AppBuilder::new(config);
    let app = match (&args.snapshot, launch) {
        (Some(snapshot), launch) => builder.build_from_snapshot(snapshot, launch)?,
        (None, Some(launch)) => builder.build(launch)?,
        (None, None) => bail!("nothing to debug, give a program or a --snapshot"),
    };
    app.run()
}
