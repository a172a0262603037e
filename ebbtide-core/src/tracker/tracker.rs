//! Per-tracker state: counters, retry timing, rate limiting, and the
//! lifecycle of one in-flight request.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::clock::Clock;
use super::types::{
    AnnounceRequest, ReceiptOutcome, ScrapeStats, TrackerEvent, TrackerId, TrackerKind,
    TrackerReceipt, TrackerTransport, constants,
};
use super::InfoHash;

/// Tri-state enable switch.
///
/// `Undefined` defers to the global enable bit of the tracker's protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnabledState {
    /// Never usable
    Off,
    /// Usable whenever the transport reports alive
    On,
    /// Usable iff the protocol's global bit is set and the transport is alive
    Undefined,
}

impl EnabledState {
    /// Decodes the session-persistence encoding; unknown values map to
    /// `Undefined`.
    pub fn from_i64(raw: i64) -> Self {
        match raw {
            0 => EnabledState::Off,
            1 => EnabledState::On,
            _ => EnabledState::Undefined,
        }
    }

    /// Encodes for session persistence.
    pub fn to_i64(self) -> i64 {
        match self {
            EnabledState::Off => 0,
            EnabledState::On => 1,
            EnabledState::Undefined => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Announce,
    Scrape,
}

struct BusyRequest {
    kind: RequestKind,
    abort: AbortHandle,
}

/// One tracker owned by a [`TrackerList`](super::TrackerList).
///
/// Wraps a protocol transport with the bookkeeping the coordination layer
/// needs: success/failure counters and their retry timing, scrape
/// statistics, the rolling request-rate guard, and the enabled tri-state.
/// At most one announce or scrape is in flight at a time.
pub struct Tracker {
    id: TrackerId,
    url: String,
    kind: TrackerKind,
    group: u32,
    flags: u32,
    enabled: EnabledState,
    transport: Arc<dyn TrackerTransport>,
    clock: Clock,

    normal_interval: u32,
    min_interval: u32,
    tracker_id: Option<String>,

    latest_event: TrackerEvent,
    latest_new_peers: u32,
    latest_sum_peers: u32,

    success_time_last: u64,
    success_counter: u32,
    failed_time_last: u64,
    failed_counter: u32,
    scrape_time_last: u64,
    scrape_counter: u32,

    scrape_complete: u32,
    scrape_incomplete: u32,
    scrape_downloaded: u32,

    request_time_last: u64,
    request_counter: u32,

    busy: Option<BusyRequest>,
    generation: u64,
}

impl Tracker {
    /// Tracker was added at runtime rather than from the torrent metadata.
    pub const FLAG_EXTRA_TRACKER: u32 = 1 << 0;
    /// Tracker supports scrape requests.
    pub const FLAG_CAN_SCRAPE: u32 = 1 << 1;

    pub(crate) fn new(
        id: TrackerId,
        transport: Arc<dyn TrackerTransport>,
        flags: u32,
        clock: Clock,
    ) -> Self {
        Self {
            id,
            url: transport.url().to_string(),
            kind: transport.kind(),
            group: 0,
            flags,
            enabled: EnabledState::Undefined,
            transport,
            request_time_last: clock.now(),
            clock,
            normal_interval: constants::DEFAULT_NORMAL_INTERVAL,
            min_interval: constants::DEFAULT_MIN_INTERVAL,
            tracker_id: None,
            latest_event: TrackerEvent::None,
            latest_new_peers: 0,
            latest_sum_peers: 0,
            success_time_last: 0,
            success_counter: 0,
            failed_time_last: 0,
            failed_counter: 0,
            scrape_time_last: 0,
            scrape_counter: 0,
            scrape_complete: 0,
            scrape_incomplete: 0,
            scrape_downloaded: 0,
            request_counter: 0,
            busy: None,
            generation: 0,
        }
    }

    /// List-assigned identifier.
    pub fn id(&self) -> TrackerId {
        self.id
    }

    /// Announce URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wire protocol, derived from the URL scheme.
    pub fn kind(&self) -> TrackerKind {
        self.kind
    }

    /// Tier index; assigned at insertion and never changed.
    pub fn group(&self) -> u32 {
        self.group
    }

    pub(crate) fn set_group(&mut self, group: u32) {
        self.group = group;
    }

    /// Flag bitset (`FLAG_EXTRA_TRACKER`, `FLAG_CAN_SCRAPE`).
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Whether the tracker came from user input rather than metadata.
    pub fn is_extra_tracker(&self) -> bool {
        self.flags & Self::FLAG_EXTRA_TRACKER != 0
    }

    /// Whether the tracker supports scrape requests.
    pub fn can_scrape(&self) -> bool {
        self.flags & Self::FLAG_CAN_SCRAPE != 0
    }

    /// Current enable tri-state.
    pub fn enabled_status(&self) -> EnabledState {
        self.enabled
    }

    /// Sets the tri-state and closes the tracker when turned off.
    ///
    /// Returns the previous state. The owning list fans the change out to
    /// the host; use
    /// [`TrackerList::set_enabled`](super::TrackerList::set_enabled) unless
    /// you are that code.
    pub(crate) fn apply_enabled_status(&mut self, status: EnabledState) -> EnabledState {
        let previous = self.enabled;
        self.enabled = status;
        if status == EnabledState::Off {
            self.close();
        }
        previous
    }

    /// Seconds between regular announces, as last told by the tracker.
    pub fn normal_interval(&self) -> u32 {
        self.normal_interval
    }

    /// Minimum announce spacing, as last told by the tracker.
    pub fn min_interval(&self) -> u32 {
        self.min_interval
    }

    /// Opaque identifier echoed back to the tracker on the next announce.
    pub fn tracker_id(&self) -> Option<&str> {
        self.tracker_id.as_deref()
    }

    /// Event of the most recent request, scrape included.
    pub fn latest_event(&self) -> TrackerEvent {
        self.latest_event
    }

    /// Peers the host actually kept from the latest announce.
    pub fn latest_new_peers(&self) -> u32 {
        self.latest_new_peers
    }

    /// Peers the latest announce returned before deduplication by the host.
    pub fn latest_sum_peers(&self) -> u32 {
        self.latest_sum_peers
    }

    /// Completed announces since the stats were last cleared.
    pub fn success_counter(&self) -> u32 {
        self.success_counter
    }

    /// Consecutive failures since the last success.
    pub fn failed_counter(&self) -> u32 {
        self.failed_counter
    }

    /// Completed scrapes since the stats were last cleared.
    pub fn scrape_counter(&self) -> u32 {
        self.scrape_counter
    }

    /// Epoch seconds of the last successful announce, 0 for never.
    pub fn success_time_last(&self) -> u64 {
        self.success_time_last
    }

    /// Epoch seconds of the last failed announce, 0 for never.
    pub fn failed_time_last(&self) -> u64 {
        self.failed_time_last
    }

    /// Epoch seconds of the last completed scrape, 0 for never.
    pub fn scrape_time_last(&self) -> u64 {
        self.scrape_time_last
    }

    /// Seeders from the latest scrape.
    pub fn scrape_complete(&self) -> u32 {
        self.scrape_complete
    }

    /// Leechers from the latest scrape.
    pub fn scrape_incomplete(&self) -> u32 {
        self.scrape_incomplete
    }

    /// Completed downloads from the latest scrape.
    pub fn scrape_downloaded(&self) -> u32 {
        self.scrape_downloaded
    }

    /// When the next regular announce is due; 0 while never succeeded.
    pub fn success_time_next(&self) -> u64 {
        if self.success_counter == 0 {
            return 0;
        }
        self.success_time_last + u64::from(self.normal_interval)
    }

    /// When the next retry is allowed; 0 while never failed.
    ///
    /// Exponential backoff: 5 s doubling per consecutive failure, capped at
    /// 320 s.
    pub fn failed_time_next(&self) -> u64 {
        if self.failed_counter == 0 {
            return 0;
        }
        self.failed_time_last + (5u64 << (self.failed_counter - 1).min(6))
    }

    /// Whether a request is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.is_some()
    }

    /// Whether an announce (not a scrape) is in flight.
    pub fn is_busy_not_scrape(&self) -> bool {
        matches!(
            self.busy,
            Some(BusyRequest {
                kind: RequestKind::Announce,
                ..
            })
        )
    }

    /// Whether an announce may be started; an in-flight scrape does not
    /// block, it gets closed by dispatch.
    pub fn can_request_state(&self) -> bool {
        !self.is_busy_not_scrape()
    }

    /// Variant-specific liveness, independent of the enable tri-state.
    pub fn is_usable(&self) -> bool {
        self.kind != TrackerKind::None && self.transport.is_alive()
    }

    /// Counts a request against the rolling ten-second window.
    ///
    /// The counter decays by one per elapsed second since the previous
    /// request.
    ///
    /// # Panics
    ///
    /// Panics when a tracker sees its tenth request inside a ten-second
    /// window: dispatch is rate-gated well below that, so hitting it means
    /// the caller is broken, not the network.
    pub fn inc_request_counter(&mut self) {
        let now = self.clock.now();
        let decay = u64::from(self.request_counter).min(now.saturating_sub(self.request_time_last));
        self.request_counter -= decay as u32;
        self.request_counter += 1;
        self.request_time_last = now;

        if self.request_counter >= constants::MAX_REQUESTS_PER_WINDOW {
            tracing::error!(url = %self.url, "tracker flooded with requests");
            panic!("tracker {}: more than 10 requests in 10 seconds", self.url);
        }
    }

    /// Resets cumulative and latest-response counters.
    pub fn clear_stats(&mut self) {
        self.latest_new_peers = 0;
        self.latest_sum_peers = 0;
        self.success_counter = 0;
        self.failed_counter = 0;
        self.scrape_counter = 0;
    }

    /// Derives the scrape URL for an announce URL.
    ///
    /// # Panics
    ///
    /// Panics when the last path segment is not `announce`; callers check
    /// the scrape capability before ever deriving.
    pub fn scrape_url_from(announce_url: &str) -> String {
        let delimiter = announce_url.rfind('/');
        match delimiter {
            Some(slash) if announce_url[slash..].starts_with("/announce") => {
                format!(
                    "{}/scrape{}",
                    &announce_url[..slash],
                    &announce_url[slash + "/announce".len()..]
                )
            }
            _ => {
                tracing::error!(url = announce_url, "not an announce url");
                panic!("tried to make a scrape url from {announce_url}");
            }
        }
    }

    /// Starts an announce on the transport.
    ///
    /// The request runs as a task and reports through `receipts` tagged
    /// with the current generation; `close`/`disown` bump the generation so
    /// the list can discard anything stale. A DHT tracker has nobody to
    /// tell about a stop, so that combination only records the event.
    pub(crate) fn start_announce(
        &mut self,
        request: AnnounceRequest,
        receipts: &mpsc::UnboundedSender<TrackerReceipt>,
    ) {
        self.latest_event = request.event;
        if self.kind == TrackerKind::Dht && request.event == TrackerEvent::Stopped {
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        let id = self.id;
        let transport = Arc::clone(&self.transport);
        let receipts = receipts.clone();

        let handle = tokio::spawn(async move {
            let outcome = transport
                .announce(request)
                .await
                .map_err(|error| error.to_string());
            let _ = receipts.send(TrackerReceipt {
                tracker: id,
                generation,
                outcome: ReceiptOutcome::Announce(outcome),
            });
        });

        self.busy = Some(BusyRequest {
            kind: RequestKind::Announce,
            abort: handle.abort_handle(),
        });
    }

    /// Starts a scrape on the transport.
    pub(crate) fn start_scrape(
        &mut self,
        info_hash: InfoHash,
        receipts: &mpsc::UnboundedSender<TrackerReceipt>,
    ) {
        self.latest_event = TrackerEvent::Scrape;
        self.generation += 1;
        let generation = self.generation;
        let id = self.id;
        let transport = Arc::clone(&self.transport);
        let receipts = receipts.clone();

        let handle = tokio::spawn(async move {
            let outcome = transport
                .scrape(info_hash)
                .await
                .map_err(|error| error.to_string());
            let _ = receipts.send(TrackerReceipt {
                tracker: id,
                generation,
                outcome: ReceiptOutcome::Scrape(outcome),
            });
        });

        self.busy = Some(BusyRequest {
            kind: RequestKind::Scrape,
            abort: handle.abort_handle(),
        });
    }

    /// Cancels any in-flight request; no callback will be delivered.
    pub fn close(&mut self) {
        if let Some(busy) = self.busy.take() {
            busy.abort.abort();
            self.generation += 1;
        }
    }

    /// Detaches from any in-flight request.
    ///
    /// The task may still run to completion, but its receipt carries a
    /// stale generation and is dropped on arrival.
    pub fn disown(&mut self) {
        if self.busy.take().is_some() {
            self.generation += 1;
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn busy_kind(&self) -> Option<RequestKind> {
        self.busy.as_ref().map(|busy| busy.kind)
    }

    /// Clears the busy state when a receipt for the current generation
    /// arrives.
    pub(crate) fn finish_request(&mut self) {
        self.busy = None;
    }

    /// Folds pacing fields from a successful announce response.
    pub(crate) fn apply_announce_response(
        &mut self,
        interval: u32,
        min_interval: Option<u32>,
        tracker_id: Option<String>,
    ) {
        if interval > 0 {
            self.normal_interval = interval;
        }
        if let Some(min_interval) = min_interval {
            self.min_interval = min_interval;
        }
        if tracker_id.is_some() {
            self.tracker_id = tracker_id;
        }
    }

    pub(crate) fn record_success(&mut self, now: u64, sum_peers: u32) {
        self.success_time_last = now;
        self.success_counter += 1;
        self.failed_counter = 0;
        self.latest_sum_peers = sum_peers;
    }

    pub(crate) fn set_latest_new_peers(&mut self, new_peers: u32) {
        self.latest_new_peers = new_peers;
    }

    pub(crate) fn record_failed(&mut self, now: u64) {
        self.failed_time_last = now;
        self.failed_counter += 1;
    }

    pub(crate) fn record_scrape(&mut self, now: u64, stats: ScrapeStats) {
        self.scrape_time_last = now;
        self.scrape_counter += 1;
        self.scrape_complete = stats.complete;
        self.scrape_incomplete = stats.incomplete;
        self.scrape_downloaded = stats.downloaded;
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::super::types::AnnounceResponse;
    use super::super::TrackerError;
    use super::*;

    struct PendingTransport;

    #[async_trait]
    impl TrackerTransport for PendingTransport {
        async fn announce(
            &self,
            _request: AnnounceRequest,
        ) -> Result<AnnounceResponse, TrackerError> {
            std::future::pending::<()>().await;
            unreachable!()
        }

        async fn scrape(&self, _info_hash: InfoHash) -> Result<ScrapeStats, TrackerError> {
            std::future::pending::<()>().await;
            unreachable!()
        }

        fn url(&self) -> &str {
            "http://tracker.test/announce"
        }

        fn kind(&self) -> TrackerKind {
            TrackerKind::Http
        }
    }

    fn tracker(clock: &Clock) -> Tracker {
        Tracker::new(
            TrackerId(1),
            std::sync::Arc::new(PendingTransport),
            Tracker::FLAG_CAN_SCRAPE,
            clock.clone(),
        )
    }

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash::new([0u8; 20]),
            peer_id: [1u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: TrackerEvent::Started,
            compact: true,
            numwant: -1,
            key: 0xdead_beef,
            tracker_id: None,
        }
    }

    #[test]
    fn test_never_contacted_times_are_zero() {
        let clock = Clock::fixed(1000);
        let tracker = tracker(&clock);

        assert_eq!(tracker.success_counter(), 0);
        assert_eq!(tracker.success_time_next(), 0);
        assert_eq!(tracker.failed_counter(), 0);
        assert_eq!(tracker.failed_time_next(), 0);
    }

    #[test]
    fn test_success_time_next_tracks_interval() {
        let clock = Clock::fixed(1000);
        let mut tracker = tracker(&clock);

        tracker.record_success(1000, 5);
        assert_eq!(tracker.success_time_next(), 1000 + 1800);

        tracker.apply_announce_response(60, Some(30), None);
        assert_eq!(tracker.success_time_next(), 1060);
        assert_eq!(tracker.min_interval(), 30);
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let clock = Clock::fixed(0);
        let mut tracker = tracker(&clock);

        let expected = [5u64, 10, 20, 40, 80, 160, 320, 320, 320];
        for delay in expected {
            tracker.record_failed(0);
            assert_eq!(tracker.failed_time_next(), delay);
        }
    }

    #[test]
    fn test_backoff_cap_at_high_counts() {
        let clock = Clock::fixed(0);
        let mut tracker = tracker(&clock);

        for _ in 0..7 {
            tracker.record_failed(100);
        }
        assert_eq!(tracker.failed_time_next() - tracker.failed_time_last(), 320);

        for _ in 0..93 {
            tracker.record_failed(100);
        }
        assert_eq!(tracker.failed_counter(), 100);
        assert_eq!(tracker.failed_time_next() - tracker.failed_time_last(), 320);
    }

    #[test]
    fn test_success_resets_failed_counter() {
        let clock = Clock::fixed(50);
        let mut tracker = tracker(&clock);

        tracker.record_failed(10);
        tracker.record_failed(20);
        assert_eq!(tracker.failed_counter(), 2);

        tracker.record_success(50, 12);
        assert_eq!(tracker.failed_counter(), 0);
        assert_eq!(tracker.success_counter(), 1);
        assert_eq!(tracker.latest_sum_peers(), 12);
    }

    #[test]
    fn test_request_counter_allows_paced_requests() {
        let clock = Clock::fixed(0);
        let mut tracker = tracker(&clock);

        for _ in 0..9 {
            tracker.inc_request_counter();
            clock.advance(1);
        }
        // Decay kept us below the limit; a burst of nine from idle is also
        // fine.
        clock.advance(60);
        for _ in 0..9 {
            tracker.inc_request_counter();
        }
    }

    #[test]
    #[should_panic(expected = "more than 10 requests in 10 seconds")]
    fn test_request_counter_aborts_on_flood() {
        let clock = Clock::fixed(0);
        let mut tracker = tracker(&clock);

        for _ in 0..10 {
            tracker.inc_request_counter();
        }
    }

    #[test]
    fn test_clear_stats() {
        let clock = Clock::fixed(0);
        let mut tracker = tracker(&clock);

        tracker.record_success(10, 4);
        tracker.set_latest_new_peers(3);
        tracker.record_failed(20);
        tracker.record_scrape(
            30,
            ScrapeStats {
                complete: 1,
                incomplete: 2,
                downloaded: 3,
            },
        );

        tracker.clear_stats();
        assert_eq!(tracker.success_counter(), 0);
        assert_eq!(tracker.failed_counter(), 0);
        assert_eq!(tracker.scrape_counter(), 0);
        assert_eq!(tracker.latest_new_peers(), 0);
        assert_eq!(tracker.latest_sum_peers(), 0);
        // Scrape statistics survive; they describe the swarm, not us.
        assert_eq!(tracker.scrape_complete(), 1);
    }

    #[test]
    fn test_scrape_url_round_trip() {
        let urls = [
            "http://tracker.example.com/announce",
            "http://tracker.example.com:8080/a/b/announce",
            "https://tracker.example.com/announce?passkey=abc",
        ];
        for url in urls {
            let scrape = Tracker::scrape_url_from(url);
            assert!(scrape.contains("/scrape"));
            assert_eq!(scrape.replace("/scrape", "/announce"), url);
        }
    }

    #[test]
    #[should_panic(expected = "scrape url")]
    fn test_scrape_url_rejects_non_announce() {
        Tracker::scrape_url_from("http://tracker.example.com/stats");
    }

    #[test]
    fn test_enabled_state_round_trip() {
        for state in [EnabledState::Off, EnabledState::On, EnabledState::Undefined] {
            assert_eq!(EnabledState::from_i64(state.to_i64()), state);
        }
        assert_eq!(EnabledState::from_i64(99), EnabledState::Undefined);
    }

    #[tokio::test]
    async fn test_announce_makes_tracker_busy() {
        let clock = Clock::fixed(0);
        let mut tracker = tracker(&clock);
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(tracker.can_request_state());
        tracker.start_announce(request(), &tx);

        assert!(tracker.is_busy());
        assert!(tracker.is_busy_not_scrape());
        assert!(!tracker.can_request_state());
        assert_eq!(tracker.latest_event(), TrackerEvent::Started);
    }

    #[tokio::test]
    async fn test_close_cancels_and_bumps_generation() {
        let clock = Clock::fixed(0);
        let mut tracker = tracker(&clock);
        let (tx, _rx) = mpsc::unbounded_channel();

        tracker.start_announce(request(), &tx);
        let generation = tracker.generation();

        tracker.close();
        assert!(!tracker.is_busy());
        assert!(tracker.generation() > generation);

        // Closing an idle tracker changes nothing.
        let generation = tracker.generation();
        tracker.close();
        assert_eq!(tracker.generation(), generation);
    }

    #[tokio::test]
    async fn test_scrape_busy_does_not_block_announce() {
        let clock = Clock::fixed(0);
        let mut tracker = tracker(&clock);
        let (tx, _rx) = mpsc::unbounded_channel();

        tracker.start_scrape(InfoHash::new([0u8; 20]), &tx);
        assert!(tracker.is_busy());
        assert!(!tracker.is_busy_not_scrape());
        assert!(tracker.can_request_state());
        assert_eq!(tracker.latest_event(), TrackerEvent::Scrape);
    }

    #[tokio::test]
    async fn test_disown_detaches_without_abort() {
        let clock = Clock::fixed(0);
        let mut tracker = tracker(&clock);
        let (tx, _rx) = mpsc::unbounded_channel();

        tracker.start_announce(request(), &tx);
        let generation = tracker.generation();

        tracker.disown();
        assert!(!tracker.is_busy());
        assert!(tracker.generation() > generation);
    }

    #[test]
    fn test_turning_off_closes() {
        let clock = Clock::fixed(0);
        let mut tracker = tracker(&clock);

        let previous = tracker.apply_enabled_status(EnabledState::Off);
        assert_eq!(previous, EnabledState::Undefined);
        assert_eq!(tracker.enabled_status(), EnabledState::Off);
        assert!(!tracker.is_busy());
    }
}
