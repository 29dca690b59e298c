//! Tracing subscriber setup.

use std::path::PathBuf;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Where and how verbosely to log.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Write daily-rolling files here instead of stderr.
    pub log_dir: Option<PathBuf>,
    /// File name prefix for rolling files.
    pub file_prefix: String,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            log_dir: None,
            file_prefix: "vmshim.log".to_string(),
            default_filter: "info".to_string(),
        }
    }
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the background writer. Calling this again after a
/// subscriber is installed is harmless.
pub fn init_logging(options: &LoggingOptions) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));

    let (non_blocking, guard, ansi) = match &options.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &options.file_prefix);
            let (nb, guard) = tracing_appender::non_blocking(appender);
            (nb, guard, false)
        }
        None => {
            let (nb, guard) = tracing_appender::non_blocking(std::io::stderr());
            (nb, guard, true)
        }
    };

    register_to_tracing(non_blocking, env_filter, ansi);
    guard
}

fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter, ansi: bool) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(ansi),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging_creates_dir_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        let guard = init_logging(&LoggingOptions {
            log_dir: Some(dir.path().to_path_buf()),
            ..LoggingOptions::default()
        });
        tracing::info!("hello from test");
        drop(guard);
        // A second call must not panic even though a subscriber exists.
        let _guard = init_logging(&LoggingOptions::default());
    }
}
