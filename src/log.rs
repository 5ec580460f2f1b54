use env_logger::{Builder, Env};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);

#[inline(always)]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

/// Silence log output (for example while an interactive prompt owns the terminal).
pub fn disable() {
    ENABLED.store(false, Ordering::SeqCst)
}

pub fn enable() {
    ENABLED.store(true, Ordering::SeqCst)
}

/// Install the global logger.
///
/// `RUST_LOG` takes precedence over `default_filter`. Records are prefixed with their target
/// (`session`, `remote`, `gdb`...), which is how components are told apart in the output.
pub fn init(default_filter: &str) {
    let mut builder = Builder::from_env(Env::default().default_filter_or(default_filter));
    builder.format(|buf, record| {
        if !is_enabled() {
            return Ok(());
        }
        writeln!(
            buf,
            "[{} {:<5} {}] {}",
            buf.timestamp_millis(),
            record.level(),
            record.target(),
            record.args()
        )
    });
    // a second init (tests, embedded use) keeps the first logger
    let _ = builder.try_init();
}
