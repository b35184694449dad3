//! Tracing initialisation for the brainx binary.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored
//! since the global subscriber can only be set once per process.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global subscriber.
///
/// * `json` emits newline-delimited JSON on stderr.
/// * `level` is the default verbosity when `RUST_LOG` is not set.
/// * `log_file`, when given, additionally receives every event as plain
///   text (appended, no ANSI colours). Its directory must exist.
pub fn init_tracing(json: bool, level: Level, log_file: Option<&Path>) -> std::io::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    if json {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()
            .ok();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brainx.log");
        init_tracing(false, Level::INFO, Some(&path)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_missing_log_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("brainx.log");
        assert!(init_tracing(false, Level::INFO, Some(&path)).is_err());
    }
}
