//! DHT pseudo-tracker: announces routed into the DHT collaborator.
//!
//! The routing table itself lives elsewhere; this transport only adapts the
//! [`DhtHandle`] interface to the tracker capability set. A `dht://` URL is
//! accepted at insertion only while the handle reports itself valid.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::types::{
    AnnounceRequest, AnnounceResponse, TrackerKind, TrackerTransport, constants,
};
use super::{InfoHash, TrackerError};

/// Interface to the DHT implementation.
#[async_trait]
pub trait DhtHandle: Send + Sync {
    /// Whether a DHT exists at all; gates accepting `dht://` URLs.
    fn is_valid(&self) -> bool;

    /// Whether the DHT is currently running; gates usability.
    fn is_active(&self) -> bool;

    /// Announces the torrent on the DHT and collects peers.
    ///
    /// # Errors
    ///
    /// - `TrackerError::Failure` - If the search could not be performed
    async fn announce(
        &self,
        info_hash: InfoHash,
        port: u16,
    ) -> Result<Vec<SocketAddr>, TrackerError>;
}

/// DHT transport behind the tracker interface.
pub struct DhtTracker {
    url: String,
    handle: Arc<dyn DhtHandle>,
}

impl DhtTracker {
    /// Wraps the DHT handle for one `dht://` tracker entry.
    pub fn new(url: String, handle: Arc<dyn DhtHandle>) -> Self {
        Self { url, handle }
    }
}

#[async_trait]
impl TrackerTransport for DhtTracker {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        if !self.handle.is_active() {
            return Err(TrackerError::Failure {
                reason: "DHT server not active".to_string(),
            });
        }

        let peers = self.handle.announce(request.info_hash, request.port).await?;
        Ok(AnnounceResponse {
            interval: constants::DHT_ANNOUNCE_INTERVAL,
            min_interval: Some(0),
            tracker_id: None,
            complete: None,
            incomplete: None,
            peers,
        })
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn kind(&self) -> TrackerKind {
        TrackerKind::Dht
    }

    fn is_alive(&self) -> bool {
        self.handle.is_active()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::mpsc;

    use super::super::clock::Clock;
    use super::super::tracker::Tracker;
    use super::super::types::{TrackerEvent, TrackerId};
    use super::*;

    struct StubDht {
        active: AtomicBool,
    }

    #[async_trait]
    impl DhtHandle for StubDht {
        fn is_valid(&self) -> bool {
            true
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::Relaxed)
        }

        async fn announce(
            &self,
            _info_hash: InfoHash,
            _port: u16,
        ) -> Result<Vec<SocketAddr>, TrackerError> {
            Ok(vec![SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(10, 0, 0, 1),
                6881,
            ))])
        }
    }

    fn dht_tracker(active: bool) -> (Arc<StubDht>, DhtTracker) {
        let handle = Arc::new(StubDht {
            active: AtomicBool::new(active),
        });
        let dyn_handle: Arc<dyn DhtHandle> = handle.clone() as Arc<dyn DhtHandle>;
        let tracker = DhtTracker::new("dht://".to_string(), dyn_handle);
        (handle, tracker)
    }

    fn request(event: TrackerEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash::new([3u8; 20]),
            peer_id: [4u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event,
            compact: true,
            numwant: -1,
            key: 1,
            tracker_id: None,
        }
    }

    #[tokio::test]
    async fn test_announce_uses_dht_interval() {
        let (_handle, transport) = dht_tracker(true);

        let response = transport.announce(request(TrackerEvent::Started)).await.unwrap();
        assert_eq!(response.interval, constants::DHT_ANNOUNCE_INTERVAL);
        assert_eq!(response.peers.len(), 1);
    }

    #[tokio::test]
    async fn test_inactive_dht_fails_announce() {
        let (_handle, transport) = dht_tracker(false);

        match transport.announce(request(TrackerEvent::Started)).await {
            Err(TrackerError::Failure { reason }) => {
                assert_eq!(reason, "DHT server not active");
            }
            other => panic!("expected Failure, got {other:?}"),
        }
    }

    #[test]
    fn test_liveness_follows_dht_activity() {
        let (handle, transport) = dht_tracker(true);
        assert!(transport.is_alive());

        handle.active.store(false, Ordering::Relaxed);
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn test_stop_event_never_goes_busy() {
        let (_handle, transport) = dht_tracker(true);
        let clock = Clock::fixed(0);
        let mut tracker = Tracker::new(TrackerId(1), Arc::new(transport), 0, clock);
        let (tx, mut rx) = mpsc::unbounded_channel();

        tracker.start_announce(request(TrackerEvent::Stopped), &tx);
        assert!(!tracker.is_busy());
        assert_eq!(tracker.latest_event(), TrackerEvent::Stopped);
        assert!(rx.try_recv().is_err(), "no receipt for a dht stop");

        tracker.start_announce(request(TrackerEvent::Started), &tx);
        assert!(tracker.is_busy());
    }
}
