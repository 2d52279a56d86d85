//! Logging/tracing setup.
//!
//! Three streams come out of one `tracing` pipeline: the per-device main
//! log (state changes, command start/end, event fires — all carrying a
//! `device`/`connection` field), the raw stream log (every chunk with a
//! direction marker, on the `raw` target), and the process-wide aggregate.
//! Filter by target/field to split them.

use std::path::PathBuf;

use tokio::sync::RwLock;
use tracing::metadata::LevelFilter;
use tracing::{debug, info, trace, Level};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::prelude::*;

use crate::config::LoggerConfig;

/// Target carrying the raw inbound/outbound chunks.
pub const RAW_TARGET: &str = "raw";

/// Which way a raw chunk travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Read from the wire.
    In,
    /// Written onto the wire.
    Out,
}

impl Direction {
    fn marker(self) -> &'static str {
        match self {
            Direction::In => "<",
            Direction::Out => ">",
        }
    }
}

/// Log one raw chunk with its direction marker.
pub(crate) fn log_raw(connection: &str, direction: Direction, text: &str) {
    trace!(
        target: "raw",
        connection = %connection,
        dir = direction.marker(),
        data = %text.escape_debug(),
    );
}

fn do_init(stdout_level: Level, file_logging: Option<(Level, PathBuf)>) {
    let mut message = String::from("Logging with:");

    // Log lines carry HH:MM:SS.mmm timestamps.
    let timer = ChronoLocal::new("%H:%M:%S%.3f".into());

    message += " stdout";
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer.clone())
        .with_filter(LevelFilter::from(stdout_level));

    let registry = tracing_subscriber::registry().with(stdout_layer);

    let maybe_file_layer = if let Some((level, output_dir)) = file_logging {
        message += &format!(", file (in dir {output_dir:?})");

        let file_appender = RollingFileAppender::new(Rotation::DAILY, output_dir, "promptline.log");

        let file_layer = tracing_subscriber::fmt::layer()
            .with_timer(timer)
            .with_writer(file_appender)
            .with_ansi(false)
            .with_filter(LevelFilter::from(level));
        Some(file_layer)
    } else {
        None
    };

    registry.with(maybe_file_layer).init();

    debug!(message);
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub async fn init(stdout_level: Level, file_logging: Option<(Level, PathBuf)>) {
    static TRACING_IS_INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    let initialized = { *TRACING_IS_INITIALIZED.read().await };

    if !initialized {
        let mut initialized = TRACING_IS_INITIALIZED.write().await;

        // To avoid race condition between the `.read()` and the
        // `.write()`.
        if *initialized {
            return;
        }

        do_init(stdout_level, file_logging);

        *initialized = true;
    }

    info!("Logging initialized");
}

/// Initialize tracing from a [`LoggerConfig`]: INFO to stdout, DEBUG (or
/// TRACE when `raw_log` is set) to a rolling file in the configured
/// directory.
pub async fn init_from_config(config: &LoggerConfig) {
    let file_level = if config.raw_log {
        Level::TRACE
    } else {
        Level::DEBUG
    };
    init(Level::INFO, Some((file_level, config.path.clone()))).await;
}
