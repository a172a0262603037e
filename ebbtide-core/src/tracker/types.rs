//! Core types and contracts for tracker communication.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::net::ProtocolId;

use super::{InfoHash, PeerId, TrackerError};

/// Tracker protocol constants.
pub mod constants {
    /// Default seconds between regular announces
    pub const DEFAULT_NORMAL_INTERVAL: u32 = 1800;

    /// Default minimum seconds between announces
    pub const DEFAULT_MIN_INTERVAL: u32 = 600;

    /// Seconds a tracker is left alone between scrapes
    pub const SCRAPE_COOLDOWN_SECS: u64 = 600;

    /// Announce interval used for DHT pseudo-trackers
    pub const DHT_ANNOUNCE_INTERVAL: u32 = 20 * 60;

    /// Compact IPv4 peer entry size (4 address + 2 port bytes)
    pub const COMPACT_PEER_SIZE: usize = 6;

    /// Compact IPv6 peer entry size (16 address + 2 port bytes)
    pub const COMPACT_PEER6_SIZE: usize = 18;

    /// Requests allowed per tracker within the rolling 10-second window
    pub const MAX_REQUESTS_PER_WINDOW: u32 = 10;
}

/// Wire protocol a tracker speaks, derived from its URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
    /// `http://` or `https://`
    Http,
    /// `udp://`
    Udp,
    /// `dht://`
    Dht,
    /// Unrecognized scheme; never usable
    None,
}

impl TrackerKind {
    /// The global enable bit governing this kind, if any.
    pub fn protocol_id(self) -> Option<ProtocolId> {
        match self {
            TrackerKind::Http => Some(ProtocolId::Http),
            TrackerKind::Udp => Some(ProtocolId::Udp),
            TrackerKind::Dht => Some(ProtocolId::Dht),
            TrackerKind::None => None,
        }
    }
}

/// Announce events, plus the scrape pseudo-event a tracker remembers as its
/// latest request.
///
/// The discriminants are the BEP 15 wire values for the first four.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TrackerEvent {
    /// Regular re-announce, nothing to report
    None = 0,
    /// Download finished
    Completed = 1,
    /// Download started
    Started = 2,
    /// Download stopped
    Stopped = 3,
    /// Scrape request (never sent as an announce event)
    Scrape = 4,
}

impl TrackerEvent {
    /// Bit for event bitmaps (`close_all_excluding` and friends).
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// The event's HTTP announce parameter, empty for a regular announce.
    pub fn as_str(self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Completed => "completed",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Scrape => "scrape",
        }
    }
}

impl fmt::Display for TrackerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerEvent::None => write!(f, "none"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Identifier a list assigns to each tracker it owns.
///
/// The non-owning handle transports and receipts use to refer back to a
/// tracker; stable across reordering within the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackerId(pub(crate) u64);

impl fmt::Display for TrackerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tracker#{}", self.0)
    }
}

/// Tracker announce request.
///
/// Client statistics and torrent information sent to the tracker during
/// announce operations to report progress and request a peer list.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    /// Unique identifier for the torrent being announced
    pub info_hash: InfoHash,
    /// Client's unique 20-byte identifier
    pub peer_id: PeerId,
    /// TCP port the client is listening on for peer connections
    pub port: u16,
    /// Total bytes uploaded to other peers
    pub uploaded: u64,
    /// Total bytes downloaded from other peers
    pub downloaded: u64,
    /// Bytes remaining to download (0 for seeders)
    pub left: u64,
    /// Current client state for this torrent
    pub event: TrackerEvent,
    /// Request the compact peer list encoding
    pub compact: bool,
    /// Number of peers wanted, -1 for the tracker default
    pub numwant: i32,
    /// Random per-list key identifying this client across IP changes
    pub key: u32,
    /// Opaque identifier echoed from the previous response
    pub tracker_id: Option<String>,
}

/// Tracker announce response.
///
/// Peer list and pacing information returned by the tracker.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until the next announce request should be sent
    pub interval: u32,
    /// Minimum allowed interval between announces
    pub min_interval: Option<u32>,
    /// Tracker-specific identifier for subsequent requests
    pub tracker_id: Option<String>,
    /// Number of seeders in the swarm, when reported
    pub complete: Option<u32>,
    /// Number of leechers in the swarm, when reported
    pub incomplete: Option<u32>,
    /// Peer addresses for connection attempts
    pub peers: Vec<SocketAddr>,
}

/// Swarm statistics for one torrent from a scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeStats {
    /// Number of seeders (peers with the complete file)
    pub complete: u32,
    /// Number of leechers (peers downloading)
    pub incomplete: u32,
    /// Total number of completed downloads
    pub downloaded: u32,
}

/// What a finished transport task reports back to the owning list.
#[derive(Debug)]
pub enum ReceiptOutcome {
    /// Announce result: a response or a failure message
    Announce(Result<AnnounceResponse, String>),
    /// Scrape result: statistics or a failure message
    Scrape(Result<ScrapeStats, String>),
}

/// One completed tracker request, delivered over the list's receipt channel.
#[derive(Debug)]
pub struct TrackerReceipt {
    /// Tracker the request belonged to
    pub tracker: TrackerId,
    /// Request generation; stale generations are discarded (disown)
    pub generation: u64,
    /// The result
    pub outcome: ReceiptOutcome,
}

/// Transfer statistics the announce request reports.
///
/// Implemented by the downloading side; the tracker layer only reads it.
pub trait TransferStats: Send + Sync {
    /// Total bytes uploaded to other peers
    fn uploaded(&self) -> u64;
    /// Total bytes downloaded from other peers
    fn downloaded(&self) -> u64;
    /// Bytes remaining to download
    fn left(&self) -> u64;
}

/// Abstract tracker communication interface.
///
/// Announce and scrape over a specific wire protocol. Implementations own
/// their timeouts and surface every failure as a [`TrackerError`]; the
/// state machine above decides what a failure means.
#[async_trait]
pub trait TrackerTransport: Send + Sync {
    /// Announces client presence to the tracker and retrieves a peer list.
    ///
    /// # Errors
    ///
    /// - `TrackerError::ConnectionFailed` - If the tracker is unreachable
    /// - `TrackerError::RequestTimeout` - If the tracker stays silent
    /// - `TrackerError::ProtocolError` - If the response is malformed
    /// - `TrackerError::Failure` - If the tracker refused the request
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TrackerError>;

    /// Retrieves swarm statistics without announcing.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`TrackerTransport::announce`].
    ///
    /// # Panics
    ///
    /// The default implementation panics: dispatch checks the scrape
    /// capability flag first, so reaching it is a caller bug.
    async fn scrape(&self, info_hash: InfoHash) -> Result<ScrapeStats, TrackerError> {
        let _ = info_hash;
        tracing::error!(url = %self.url(), "tracker type does not support scrape");
        panic!("tracker type does not support scrape");
    }

    /// The announce URL, for logging and identity.
    fn url(&self) -> &str;

    /// The wire protocol this transport speaks.
    fn kind(&self) -> TrackerKind;

    /// Variant-specific liveness; `false` makes the tracker unusable
    /// regardless of its enabled state.
    fn is_alive(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bits_are_distinct() {
        let events = [
            TrackerEvent::None,
            TrackerEvent::Completed,
            TrackerEvent::Started,
            TrackerEvent::Stopped,
            TrackerEvent::Scrape,
        ];
        let mut seen = 0u32;
        for event in events {
            assert_eq!(seen & event.bit(), 0);
            seen |= event.bit();
        }
    }

    #[test]
    fn test_event_strings() {
        assert_eq!(TrackerEvent::Started.as_str(), "started");
        assert_eq!(TrackerEvent::Stopped.as_str(), "stopped");
        assert_eq!(TrackerEvent::Completed.as_str(), "completed");
        assert_eq!(TrackerEvent::None.as_str(), "");
    }

    #[test]
    fn test_kind_protocol_mapping() {
        assert_eq!(
            TrackerKind::Udp.protocol_id(),
            Some(crate::net::ProtocolId::Udp)
        );
        assert_eq!(TrackerKind::None.protocol_id(), None);
    }
}
