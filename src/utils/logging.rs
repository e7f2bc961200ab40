/// Logging setup
///
/// Every run logs timestamped, severity-tagged lines to stderr and to a
/// daily-rotated file in the configured log directory. The file sink is
/// best-effort: an unwritable log directory degrades to console-only
/// rather than blocking backups.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_PREFIX: &str = "hostforge-backup.log";

/// Initialize the global subscriber. The returned guard must stay alive for
/// the process lifetime or buffered file output is lost.
pub fn init(log_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let (file_layer, guard) = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!(
                "warning: cannot write logs to {} ({e}); logging to console only",
                log_dir.display()
            );
            (None, None)
        }
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    // try_init so repeated initialization (tests) is harmless
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    guard
}
