use std::path::Path;

use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, EnvFilter};

/// `RUST_LOG` wins over the directive handed in by the caller.
fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

pub fn setup_tracing_to_stdout(default_directive: &str) {
    fmt().with_env_filter(env_filter(default_directive)).init();
}

/// Logs to a daily rolling file. Dropping the returned guard flushes pending
/// records, so binaries hold it until they exit.
pub fn setup_tracing_to_file(
    directory: impl AsRef<Path>,
    file_name_prefix: impl AsRef<Path>,
    default_directive: &str,
) -> anyhow::Result<non_blocking::WorkerGuard> {
    std::fs::create_dir_all(directory.as_ref())?;

    let file_appender = rolling::daily(directory, file_name_prefix);
    let (non_blocking, guard) = non_blocking(file_appender);
    fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_env_filter(env_filter(default_directive))
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    Ok(guard)
}
