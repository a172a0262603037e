//! Ebbtide Core - tracker coordination for a BitTorrent peer engine

#![deny(missing_docs)]
#![deny(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! This crate provides the tracker side of a BitTorrent download: a tiered
//! tracker collection per torrent with BEP 12 failover, announce and scrape
//! dispatch over HTTP, UDP and DHT transports, retry bookkeeping, a caching
//! address resolver, and the process-wide connection policy the transports
//! consult.

pub mod config;
pub mod net;
pub mod tracing_setup;
pub mod tracker;

// Re-export main types for convenient access
pub use config::EbbtideConfig;
pub use net::{AddressResolver, ConnectionPolicy};
pub use tracing_setup::init_tracing;
pub use tracker::{AnnounceController, TrackerError, TrackerList};

/// Errors surfaced to the host application.
///
/// Invalid arguments and disabled features are recoverable and reported
/// here; invariant violations inside the library are programming bugs and
/// abort instead of being represented as a variant.
#[derive(Debug, thiserror::Error)]
pub enum EbbtideError {
    /// Caller passed invalid arguments (wrong address family, backlog out
    /// of range, unparseable tracker URL added explicitly)
    #[error("Invalid input: {reason}")]
    InvalidInput {
        /// Human-readable description of what was rejected
        reason: String,
    },

    /// A capability this build was compiled without
    #[error("Feature disabled: {feature}")]
    FeatureDisabled {
        /// Name of the missing capability
        feature: &'static str,
    },

    /// Tracker transport errors that escaped before a request was in flight
    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// Standard I/O errors from socket operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EbbtideError {
    /// Checks if this error is due to caller input validation.
    pub fn is_input_error(&self) -> bool {
        matches!(self, EbbtideError::InvalidInput { .. })
    }
}

/// Convenience Result type using EbbtideError as the error type
pub type Result<T> = std::result::Result<T, EbbtideError>;
