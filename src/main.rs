use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gocat_core::cli::{self, Cli};
use gocat_core::config::{self, Config};
use gocat_core::log::TracingLog;
use gocat_core::metrics::NullMetrics;
use gocat_core::signal::SignalSource;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let config = match config::load_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: failed to load config: {e}");
            return std::process::ExitCode::from(1);
        }
    };
    // Held for the process lifetime: dropping it stops the non-blocking
    // writer's flush thread.
    let _log_guard = install_tracing(&config);

    let cli = Cli::parse();

    let cancel = SignalSource::install();
    let log = std::sync::Arc::new(TracingLog);
    let metrics = std::sync::Arc::new(NullMetrics);

    match cli::run(cli, &config, cancel, log, metrics).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("hint: {suggestion}");
            }
            std::process::ExitCode::from(e.exit_code() as u8)
        }
    }
}

/// Install the process-wide `tracing` subscriber (§6): level from
/// `GOCAT_LOG_LEVEL`, falling back to the config file's `logging.level`,
/// defaulting to `info`; writer follows `logging.file` (falling back to
/// stdout); format follows `logging.format` (`"json"` or text, the
/// default); colour disabled when `GOCAT_NO_COLOR` is set, matching the
/// `NO_COLOR` convention.
fn install_tracing(config: &Config) -> WorkerGuard {
    let level = std::env::var("GOCAT_LOG_LEVEL")
        .ok()
        .or_else(|| config.logging.level.clone());
    let filter = level
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let ansi = std::env::var_os("GOCAT_NO_COLOR").is_none();

    let (writer, guard) = match &config.logging.file {
        Some(path) => match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => tracing_appender::non_blocking(file),
            Err(e) => {
                eprintln!(
                    "warning: failed to open log file {}: {e}; logging to stdout",
                    path.display()
                );
                tracing_appender::non_blocking(std::io::stdout())
            }
        },
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    let fmt_layer = fmt::layer().with_ansi(ansi).with_writer(writer);

    if config.logging.format.as_deref() == Some("json") {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init();
    }

    guard
}
