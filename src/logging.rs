//! Centralized logging setup with dual output (stdout + debug.log)

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Initialize logging with dual output: stdout + debug.log file.
///
/// Both outputs use the level from the `RUST_LOG` environment variable,
/// falling back to "debug" when the debug flag is set and "info"
/// otherwise.
///
/// The appender guard is forgotten to keep the file writer alive for the
/// program lifetime.
pub fn init(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };

    let file_appender = tracing_appender::rolling::never(".", "debug.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stdout_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let file_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(stdout_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .init();

    // Keep guard alive for the program lifetime
    std::mem::forget(guard);
}
