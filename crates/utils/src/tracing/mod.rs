use taskgate_core::TASKGATE_LOG_VAR;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, instrument, span, trace, warn, Level, Span};

/// Initialize the tracing system
///
/// The filter comes from `TASKGATE_LOG` when set, otherwise `info`, or `debug`
/// when the debug-logging flag is on. Output goes to stderr so that task
/// output written to stdout stays clean.
pub fn init(debug_logging: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = build_filter(debug_logging)?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(is_tty())
        .compact()
        .with_target(debug_logging)
        .with_thread_ids(false)
        .with_level(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

fn build_filter(debug_logging: bool) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    match std::env::var(TASKGATE_LOG_VAR) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives),
        _ if debug_logging => EnvFilter::try_new("debug"),
        _ => EnvFilter::try_new("info"),
    }
}

/// Check if we're running in a TTY environment
fn is_tty() -> bool {
    std::io::IsTerminal::is_terminal(&std::io::stderr())
}

/// Create a span for one task invocation
pub fn task_span(task: &str, run_id: u64) -> Span {
    span!(Level::INFO, "task", task = %task, run_id = run_id)
}

/// Create a span for one call to the build server
pub fn rpc_span(method: &str) -> Span {
    span!(Level::DEBUG, "rpc", method = %method)
}
