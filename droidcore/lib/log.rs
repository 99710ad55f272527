//! Tracing setup shared by the droidcore binaries.

use std::{env, path::Path};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{DroidcoreError, DroidcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Filter used when neither `LOG_LEVEL` nor `RUST_LOG` is set.
pub const DEFAULT_LOG_FILTER: &str = "info";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Installs the global tracing subscriber.
///
/// The filter comes from `LOG_LEVEL`, then `RUST_LOG`, then [`DEFAULT_LOG_FILTER`]. When
/// `log_file` is given every event is also appended to it without ANSI colors. The returned guard
/// flushes the file writer and must be held until the process exits.
pub fn init_tracing(log_file: Option<&Path>) -> DroidcoreResult<Option<WorkerGuard>> {
    let directives = env::var("LOG_LEVEL")
        .or_else(|_| env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());
    let filter = EnvFilter::try_new(&directives)
        .map_err(|e| DroidcoreError::InvalidConfig("LOG_LEVEL".to_string(), e.to_string()))?;

    let (file_layer, guard) = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_file(false)
                .with_line_number(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_level(true),
        )
        .with(file_layer)
        .try_init()
        .map_err(DroidcoreError::custom)?;

    Ok(guard)
}
