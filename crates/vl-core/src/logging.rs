//! Logging initialization using the `tracing` ecosystem.
//!
//! Only binaries call this; the client library itself just emits events
//! under the `vl_client` target, labelled `[venue-{name}]`.

use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format for the console layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Colored, human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Initialize the global tracing subscriber.
///
/// - `log_level`: default filter if `RUST_LOG` is not set (e.g. `"info"`,
///   `"vl_client=debug"`)
/// - `log_dir`: optional directory for daily-rotating log files
/// - `module_name`: log file prefix
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(
    log_level: &str,
    log_dir: Option<&str>,
    module_name: &str,
    format: LogFormat,
) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let console_layer = match format {
        LogFormat::Pretty => fmt::layer().with_target(true).with_ansi(true).boxed(),
        LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
    };

    let file_layer = log_dir.map(|dir| {
        let file_appender = tracing_appender::rolling::daily(dir, module_name);
        fmt::layer().with_writer(file_appender).with_ansi(false).with_target(true)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}
