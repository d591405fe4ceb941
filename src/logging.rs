//! Tracing setup for the clearinghouse
//!
//! Structured logs go to a rolling file through a non-blocking writer
//! so the matching path never waits on disk; a plain console layer
//! stays on for operators, and the file layer switches to JSON when
//! feeding a log shipper. Per-subsystem filter overrides let one
//! subsystem be turned up to debug (say, `engine` while replaying a
//! market) without drowning the ledger audit trail in fill noise.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::AppConfig;

fn rotation_for(config: &AppConfig) -> Rotation {
    match config.rotation.as_str() {
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

/// Filter directives: the base level first, then one
/// `veridex::<module>=<level>` override per configured subsystem.
/// An explicit `RUST_LOG` takes precedence over all of this.
fn filter_directives(config: &AppConfig) -> String {
    let mut directives = vec![config.log_level.clone()];
    directives.extend(
        config
            .subsystem_levels
            .iter()
            .map(|(module, level)| format!("veridex::{module}={level}")),
    );
    directives.join(",")
}

/// Install the global subscriber.
///
/// Hold the returned guard for the process lifetime; dropping it
/// flushes and detaches the file writer.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let appender =
        RollingFileAppender::new(rotation_for(config), &config.log_dir, &config.log_file);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let console = fmt::layer().with_target(false).with_ansi(true);
    let registry = tracing_subscriber::registry().with(filter).with(console);

    if config.use_json {
        // Keep targets in JSON output for structured queries downstream
        let file = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(file_writer)
            .with_ansi(false);
        registry.with(file).init();
    } else {
        let file = fmt::layer()
            .with_target(false)
            .with_writer(file_writer)
            .with_ansi(false);
        registry.with(file).init();
    }

    guard
}
