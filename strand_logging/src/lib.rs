pub use tracing::{self, debug, error, info, instrument, trace, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Directives used when `RUST_LOG` is unset: engine events at info, the
/// rest of the process at warn
pub const DEFAULT_DIRECTIVES: &str = "warn,strand=info";

/// Installs the subscriber and a panic hook that logs the panic before exiting.
/// Calling this more than once is harmless; only the first subscriber sticks.
pub fn setup_log() {
    std::panic::set_hook(Box::new(|info| {
        error!(target: "strand", "Panic occurred: {}", info);
        std::process::exit(1);
    }));

    setup_log_no_panic_hook()
}

/// Installs the fmt subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_DIRECTIVES`]
pub fn setup_log_no_panic_hook() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let _ = SubscriberBuilder::default()
        .with_line_number(true)
        .with_file(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::NONE)
        .with_env_filter(filter)
        .finish()
        .try_init();
}
