//! Tracker coordination: tiered tracker lists, protocol transports, and
//! announce scheduling.
//!
//! A [`TrackerList`] owns one [`Tracker`] per announce URL, partitioned into
//! BEP 12 tiers. Transports (HTTP, UDP, DHT) run as tokio tasks and report
//! back through receipt channels; the [`AnnounceController`] drives the
//! whole thing off download state changes.

use std::fmt;

pub mod clock;
pub mod controller;
pub mod dht;
pub mod http;
pub mod list;
#[cfg(test)]
pub(crate) mod test_util;
mod tracker;
pub mod types;
pub mod udp;

pub use clock::Clock;
pub use controller::{AnnounceController, AnnounceHandle};
pub use dht::{DhtHandle, DhtTracker};
pub use http::HttpTracker;
pub use list::{DownloadInfo, TrackerList};
pub use tracker::{EnabledState, Tracker};
pub use types::{
    AnnounceRequest, AnnounceResponse, ScrapeStats, TrackerEvent, TrackerId, TrackerKind,
    TrackerReceipt, TrackerTransport, TransferStats,
};
pub use udp::UdpTracker;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// 20-byte peer identifier sent with every announce.
pub type PeerId = [u8; 20];

/// Errors raised by tracker transports.
///
/// These never escape the tracker layer as failures of the library; they
/// feed the failed counters and the host's failure slots.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// Tracker could not be reached
    #[error("Tracker connection failed: {url}")]
    ConnectionFailed {
        /// Announce URL of the unreachable tracker
        url: String,
    },

    /// Tracker did not answer within the transport's timeout
    #[error("Tracker request timed out: {url}")]
    RequestTimeout {
        /// Announce URL of the silent tracker
        url: String,
    },

    /// Tracker answered with something other than the wire contract
    #[error("Tracker protocol error: {message}")]
    ProtocolError {
        /// What was malformed
        message: String,
    },

    /// Tracker answered with an explicit failure
    #[error("Tracker failure: {reason}")]
    Failure {
        /// The tracker's failure reason
        reason: String,
    },

    /// The tracker hostname did not resolve
    #[error("Address resolution failed for {host}: {message}")]
    ResolveFailed {
        /// Hostname that failed to resolve
        host: String,
        /// Resolver failure description
        message: String,
    },

    /// I/O error
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// URL parsing error
    #[error("URL parsing error")]
    UrlParsing(#[from] url::ParseError),

    /// HTTP error
    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }
}
