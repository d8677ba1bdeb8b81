//! Logging setup
//!
//! Installs the tracing subscriber once from `main`. Output goes to stdout
//! (compact, coloured) and optionally to an append-mode log file (plain). The
//! returned guard owns the file writer; dropping it flushes and closes the file.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Logging options from the command line
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Log at debug level instead of info
    pub verbose: bool,
    /// Also write log lines to this file
    pub file: Option<PathBuf>,
    /// Write to stdout as well as the file
    pub stdout: bool,
}

/// Keeps the file writer alive. Drop it last.
pub struct LogGuard {
    file: Option<PathBuf>,
    _worker: Option<WorkerGuard>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(path) = &self.file {
            debug!("Closing log file {}", path.display());
        }
    }
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the level chosen by `verbose`. If the log file cannot
/// be opened, logging falls back to stdout.
pub fn init(options: &LogOptions) -> anyhow::Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(options.verbose)));

    let mut open_error = None;
    let (file_writer, worker) = match &options.file {
        Some(path) => match open_log_file(path) {
            Ok(file) => {
                let (writer, worker) = tracing_appender::non_blocking(file);
                (Some(writer), Some(worker))
            }
            Err(e) => {
                open_error = Some((path.clone(), e));
                (None, None)
            }
        },
        None => (None, None),
    };

    let to_stdout = options.stdout || file_writer.is_none();
    let stdout_layer = to_stdout.then(|| fmt::layer().with_target(false).compact());
    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(writer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;

    if let Some((path, e)) = open_error {
        warn!(
            "Failed to open log file {}: {}, logging to stdout",
            path.display(),
            e
        );
    }

    Ok(LogGuard {
        file: worker.as_ref().and(options.file.clone()),
        _worker: worker,
    })
}
