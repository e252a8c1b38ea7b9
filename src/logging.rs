//! Log setup shared by the `gonio` and `mock_device` binaries.
//!
//! Telemetry is printed on stdout, so logs go to stderr. `-v` turns on
//! per-frame debug lines from our crates, `-vv` adds hex dumps of every
//! frame. Dependencies stay at `warn` unless `RUST_LOG` says otherwise.

use anyhow::{Context, Result};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::Path;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Crates whose level follows the verbosity flags.
const OWN_TARGETS: [&str; 4] = ["gonio_lib", "gonio_rs", "gonio", "mock_device"];

fn directives(level: LevelFilter) -> String {
    let mut out = String::from("warn");
    for target in OWN_TARGETS {
        out.push_str(&format!(",{target}={}", level.to_string().to_lowercase()));
    }
    out
}

/// Install the global subscriber. With `log_file`, the same events are also
/// appended (without colour) to that file; hold the returned guard until
/// exit or the tail of the file is lost.
pub fn setup_logging(log_file: Option<&Path>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(from_env) => EnvFilter::try_new(&from_env).with_context(|| format!("Bad RUST_LOG '{from_env}'"))?,
        Err(_) => EnvFilter::try_new(directives(verbosity.tracing_level_filter()))?,
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let mut guard = None;
    let file_layer = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Log file path {path:?} has no file name"))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(name.to_string_lossy().into_owned())
                .build(dir)
                .with_context(|| format!("Failed to open log file at {path:?}"))?;
            let (writer, worker) = tracing_appender::non_blocking(appender);
            guard = Some(worker);
            Some(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file {
        info!("Logging to file: {:?}", path);
    }
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_scopes_only_our_crates() {
        assert_eq!(
            directives(LevelFilter::DEBUG),
            "warn,gonio_lib=debug,gonio_rs=debug,gonio=debug,mock_device=debug"
        );
        assert!(EnvFilter::try_new(directives(LevelFilter::TRACE)).is_ok());
        assert!(EnvFilter::try_new(directives(LevelFilter::OFF)).is_ok());
    }
}
