//! Tracing setup for Ebbtide
//!
//! Console output at a host-chosen level, plus an opt-in full-debug log
//! file. Ebbtide is a library, so the file sink only exists when the host
//! hands us a directory for it; embedding applications that already own a
//! subscriber simply never call this.

use std::fs::{File, create_dir_all};
use std::path::Path;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the debug log, overwritten on every run.
const DEBUG_LOG_FILE: &str = "ebbtide-last-run.log";

/// Initialize tracing: console at `console_level`, full debug to disk when
/// `logs_dir` is given.
///
/// The console filter honors `RUST_LOG` when set, falling back to
/// `console_level`. With `logs_dir`, everything down to TRACE also lands in
/// `<logs_dir>/ebbtide-last-run.log` so a quiet console never costs
/// debugging information.
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - If the logs directory cannot be created
///   or the log file cannot be opened for writing
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    let file_layer = match logs_dir {
        Some(logs_dir) => {
            create_dir_all(logs_dir)?;
            let log_file = File::create(logs_dir.join(DEBUG_LOG_FILE))?;
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false) // No color codes in files
                .with_writer(log_file)
                .with_filter(EnvFilter::new("trace"));
            Some(layer)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    match logs_dir {
        Some(logs_dir) => tracing::info!(
            console = %console_level,
            debug_file = %logs_dir.join(DEBUG_LOG_FILE).display(),
            "tracing initialized"
        ),
        None => tracing::info!(console = %console_level, "tracing initialized"),
    }

    Ok(())
}
