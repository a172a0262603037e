//! Ordered, tiered tracker collection for one torrent.
//!
//! Trackers sit in a flat sequence partitioned by non-decreasing group
//! index (BEP 12 tiers). The front of a group is its preferred tracker;
//! success promotes, failure lets the controller cycle. All receipts from
//! transport tasks funnel back through [`TrackerList::dispatch`].

use std::net::SocketAddr;
use std::ops::Range;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::mpsc;

use crate::EbbtideError;
use crate::config::{EbbtideConfig, NetworkConfig};
use crate::net::{AddressResolver, SharedPolicy};

use super::clock::Clock;
use super::dht::{DhtHandle, DhtTracker};
use super::http::HttpTracker;
use super::tracker::{EnabledState, RequestKind, Tracker};
use super::types::{
    AnnounceRequest, ReceiptOutcome, ScrapeStats, TrackerEvent, TrackerId, TrackerKind,
    TrackerReceipt, TrackerTransport, TransferStats, constants,
};
use super::udp::UdpTracker;
use super::{InfoHash, PeerId};

/// The download a tracker list announces for.
#[derive(Clone)]
pub struct DownloadInfo {
    /// Torrent identity sent with every request
    pub info_hash: InfoHash,
    /// Our peer identity
    pub peer_id: PeerId,
    /// Port peers should connect back to
    pub port: u16,
    /// Live transfer statistics for announce requests
    pub stats: Arc<dyn TransferStats>,
}

impl std::fmt::Debug for DownloadInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadInfo")
            .field("info_hash", &self.info_hash.to_string())
            .field("port", &self.port)
            .finish()
    }
}

type SuccessSlot = Box<dyn FnMut(&Tracker, &[SocketAddr]) -> u32 + Send>;
type MessageSlot = Box<dyn FnMut(&Tracker, &str) + Send>;
type TrackerSlot = Box<dyn FnMut(&Tracker) + Send>;

#[derive(Default)]
struct TrackerSlots {
    success: Option<SuccessSlot>,
    failed: Option<MessageSlot>,
    scrape_success: Option<TrackerSlot>,
    scrape_failed: Option<MessageSlot>,
    tracker_enabled: Option<TrackerSlot>,
    tracker_disabled: Option<TrackerSlot>,
}

/// Ordered collection of trackers partitioned by ascending group index.
///
/// Owns its trackers exclusively; everything else refers to them by
/// [`TrackerId`]. Host callbacks are optional slots invoked on the driver
/// task.
pub struct TrackerList {
    trackers: Vec<Tracker>,
    info: DownloadInfo,
    state: TrackerEvent,
    key: u32,
    numwant: i32,

    policy: SharedPolicy,
    clock: Clock,
    network: NetworkConfig,
    resolver: Arc<AddressResolver>,
    dht: Option<Arc<dyn DhtHandle>>,

    receipts: mpsc::UnboundedSender<TrackerReceipt>,
    slots: TrackerSlots,
    next_id: u64,
}

impl TrackerList {
    /// Creates an empty list and the receipt channel its transports report
    /// through.
    pub fn new(
        info: DownloadInfo,
        policy: SharedPolicy,
        resolver: Arc<AddressResolver>,
        dht: Option<Arc<dyn DhtHandle>>,
        config: &EbbtideConfig,
        clock: Clock,
    ) -> (Self, mpsc::UnboundedReceiver<TrackerReceipt>) {
        let (receipts, receipt_rx) = mpsc::unbounded_channel();
        let list = Self {
            trackers: Vec::new(),
            info,
            state: TrackerEvent::None,
            key: rand::random(),
            numwant: config.tracker.numwant,
            policy,
            clock,
            network: config.network.clone(),
            resolver,
            dht,
            receipts,
            slots: TrackerSlots::default(),
            next_id: 0,
        };
        (list, receipt_rx)
    }

    /// Number of trackers.
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    /// Whether the list holds no trackers.
    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Iterates trackers in list order.
    pub fn iter(&self) -> impl Iterator<Item = &Tracker> {
        self.trackers.iter()
    }

    /// Tracker at a list position.
    pub fn get(&self, index: usize) -> Option<&Tracker> {
        self.trackers.get(index)
    }

    /// The download this list announces for.
    pub fn info(&self) -> &DownloadInfo {
        &self.info
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Last announce state sent to the swarm.
    pub fn state(&self) -> TrackerEvent {
        self.state
    }

    /// Records the announce state the controller is sending.
    pub fn set_state(&mut self, state: TrackerEvent) {
        self.state = state;
    }

    /// Random per-list key sent in announces, constant for the list's life.
    pub fn key(&self) -> u32 {
        self.key
    }

    /// Number of peers requested per announce, -1 for tracker default.
    pub fn numwant(&self) -> i32 {
        self.numwant
    }

    /// Sets the peer count requested per announce.
    pub fn set_numwant(&mut self, numwant: i32) {
        self.numwant = numwant;
    }

    /// Installs the announce-success slot; its return value is recorded as
    /// the tracker's new-peer count.
    pub fn set_success_slot<F>(&mut self, slot: F)
    where
        F: FnMut(&Tracker, &[SocketAddr]) -> u32 + Send + 'static,
    {
        self.slots.success = Some(Box::new(slot));
    }

    /// Installs the announce-failure slot.
    pub fn set_failed_slot<F>(&mut self, slot: F)
    where
        F: FnMut(&Tracker, &str) + Send + 'static,
    {
        self.slots.failed = Some(Box::new(slot));
    }

    /// Installs the scrape-success slot.
    pub fn set_scrape_success_slot<F>(&mut self, slot: F)
    where
        F: FnMut(&Tracker) + Send + 'static,
    {
        self.slots.scrape_success = Some(Box::new(slot));
    }

    /// Installs the scrape-failure slot.
    pub fn set_scrape_failed_slot<F>(&mut self, slot: F)
    where
        F: FnMut(&Tracker, &str) + Send + 'static,
    {
        self.slots.scrape_failed = Some(Box::new(slot));
    }

    /// Installs the slot fired when a tracker becomes eligible.
    pub fn set_tracker_enabled_slot<F>(&mut self, slot: F)
    where
        F: FnMut(&Tracker) + Send + 'static,
    {
        self.slots.tracker_enabled = Some(Box::new(slot));
    }

    /// Installs the slot fired when a tracker stops being eligible.
    pub fn set_tracker_disabled_slot<F>(&mut self, slot: F)
    where
        F: FnMut(&Tracker) + Send + 'static,
    {
        self.slots.tracker_disabled = Some(Box::new(slot));
    }

    /// Inserts a tracker at the tail of its tier, creating the tier if new.
    pub fn insert(
        &mut self,
        group: u32,
        transport: Arc<dyn TrackerTransport>,
        flags: u32,
    ) -> TrackerId {
        let id = TrackerId(self.next_id);
        self.next_id += 1;

        let mut tracker = Tracker::new(id, transport, flags, self.clock.clone());
        tracker.set_group(group);

        let position = self.group_range(group).end;
        tracing::info!(group, url = %tracker.url(), "added tracker");
        self.trackers.insert(position, tracker);

        if let Some(slot) = self.slots.tracker_enabled.as_mut() {
            slot(&self.trackers[position]);
        }
        id
    }

    /// Parses a tracker URL and inserts the matching variant.
    ///
    /// Unknown schemes (and `dht://` without a live DHT) are logged and
    /// dropped, returning `Ok(None)` - unless the tracker came from explicit
    /// user input.
    ///
    /// # Errors
    ///
    /// - `EbbtideError::InvalidInput` - If `extra_tracker` is set and the
    ///   URL cannot be turned into a tracker
    pub fn insert_url(
        &mut self,
        group: u32,
        url: &str,
        extra_tracker: bool,
    ) -> Result<Option<TrackerId>, EbbtideError> {
        let mut flags = 0;
        if extra_tracker {
            flags |= Tracker::FLAG_EXTRA_TRACKER;
        }

        if url.starts_with("http://") || url.starts_with("https://") {
            let transport = HttpTracker::new(url.to_string(), &self.network);
            if transport.supports_scrape() {
                flags |= Tracker::FLAG_CAN_SCRAPE;
            }
            return Ok(Some(self.insert(group, Arc::new(transport), flags)));
        }

        if url.starts_with("udp://") {
            match UdpTracker::new(url.to_string(), Arc::clone(&self.resolver), &self.network) {
                Ok(transport) => {
                    flags |= Tracker::FLAG_CAN_SCRAPE;
                    return Ok(Some(self.insert(group, Arc::new(transport), flags)));
                }
                Err(error) => {
                    tracing::warn!(url, %error, "rejected udp tracker url");
                    if extra_tracker {
                        return Err(error);
                    }
                    return Ok(None);
                }
            }
        }

        if url.starts_with("dht://") {
            if let Some(dht) = self.dht.as_ref().filter(|dht| dht.is_valid()) {
                let transport = DhtTracker::new(url.to_string(), Arc::clone(dht));
                return Ok(Some(self.insert(group, Arc::new(transport), flags)));
            }
        }

        tracing::warn!(url, "no matching tracker protocol");
        if extra_tracker {
            return Err(EbbtideError::InvalidInput {
                reason: format!("no matching tracker protocol (url: {url})"),
            });
        }
        Ok(None)
    }

    /// Position of a tracker by id.
    pub fn find(&self, id: TrackerId) -> Option<usize> {
        self.trackers.iter().position(|tracker| tracker.id() == id)
    }

    /// Tracker by id.
    pub fn by_id(&self, id: TrackerId) -> Option<&Tracker> {
        self.find(id).map(|index| &self.trackers[index])
    }

    /// First tracker with the given announce URL.
    pub fn find_url(&self, url: &str) -> Option<TrackerId> {
        self.trackers
            .iter()
            .find(|tracker| tracker.url() == url)
            .map(Tracker::id)
    }

    /// Positions spanned by a group: first index with `group >= g` to first
    /// with `group > g`.
    pub fn group_range(&self, group: u32) -> Range<usize> {
        let begin = self.trackers.partition_point(|t| t.group() < group);
        let end = self.trackers.partition_point(|t| t.group() <= group);
        begin..end
    }

    /// One past the highest group index, 0 when empty.
    pub fn size_group(&self) -> u32 {
        self.trackers.last().map_or(0, |last| last.group() + 1)
    }

    /// Whether any tracker has a request in flight.
    pub fn has_active(&self) -> bool {
        self.trackers.iter().any(Tracker::is_busy)
    }

    /// Whether any tracker has an announce (not a scrape) in flight.
    pub fn has_active_not_scrape(&self) -> bool {
        self.trackers.iter().any(Tracker::is_busy_not_scrape)
    }

    /// Whether any tracker in the group has a request in flight.
    pub fn has_active_in_group(&self, group: u32) -> bool {
        self.trackers[self.group_range(group)]
            .iter()
            .any(Tracker::is_busy)
    }

    /// Whether any tracker is currently usable.
    pub fn has_usable(&self) -> bool {
        self.trackers.iter().any(|tracker| self.is_usable(tracker))
    }

    /// Number of trackers with a request in flight.
    pub fn count_active(&self) -> usize {
        self.trackers.iter().filter(|t| t.is_busy()).count()
    }

    /// Number of currently usable trackers.
    pub fn count_usable(&self) -> usize {
        self.trackers
            .iter()
            .filter(|tracker| self.is_usable(tracker))
            .count()
    }

    /// Folds the enabled tri-state with the protocol enable bit and the
    /// variant's own liveness.
    pub fn is_usable(&self, tracker: &Tracker) -> bool {
        match tracker.enabled_status() {
            EnabledState::Off => false,
            EnabledState::On => tracker.is_usable(),
            EnabledState::Undefined => {
                self.protocol_enabled(tracker.kind()) && tracker.is_usable()
            }
        }
    }

    fn protocol_enabled(&self, kind: TrackerKind) -> bool {
        kind.protocol_id().is_some_and(|protocol| {
            self.policy
                .read()
                .expect("connection policy lock poisoned")
                .is_protocol_enabled(protocol)
        })
    }

    /// First usable tracker at or after `start`.
    pub fn find_usable(&self, start: usize) -> Option<usize> {
        (start..self.trackers.len()).find(|&index| self.is_usable(&self.trackers[index]))
    }

    /// Picks the tracker the next announce should go to.
    ///
    /// Scans forward from `start` for the first usable, non-busy tracker.
    /// When that one is in backoff, keeps looking for something better: a
    /// fresh tracker whose next allowed attempt comes sooner than the
    /// current candidate's retry ends the scan; among trackers in backoff
    /// the soonest retry wins. The retry gate itself is the scheduler's
    /// job, not selection's.
    pub fn find_next_to_request(&self, start: usize) -> Option<usize> {
        let can_request =
            |tracker: &Tracker| self.is_usable(tracker) && tracker.can_request_state();

        let mut current = (start..self.trackers.len())
            .find(|&index| can_request(&self.trackers[index]))?;

        if self.trackers[current].failed_counter() != 0 {
            for index in current + 1..self.trackers.len() {
                let candidate = &self.trackers[index];
                if !can_request(candidate) {
                    continue;
                }

                if candidate.failed_counter() != 0 {
                    if candidate.failed_time_next() < self.trackers[current].failed_time_next() {
                        current = index;
                    }
                } else {
                    if candidate.success_time_next() < self.trackers[current].failed_time_next() {
                        current = index;
                    }
                    break;
                }
            }
        }

        tracing::debug!(
            group = self.trackers[current].group(),
            url = %self.trackers[current].url(),
            "next tracker to request"
        );
        Some(current)
    }

    /// Swaps a tracker with the head of its group; the head promotes to
    /// itself.
    pub fn promote(&mut self, index: usize) -> usize {
        let first = self.group_range(self.trackers[index].group()).start;
        self.trackers.swap(first, index);
        first
    }

    /// Rotates a group left by one, so retries walk the tier without
    /// touching global priority.
    pub fn cycle_group(&mut self, group: u32) {
        let range = self.group_range(group);
        if range.len() > 1 {
            self.trackers[range].rotate_left(1);
        }
    }

    /// Shuffles every group in place (BEP 12; once at download start).
    pub fn randomize_group_entries(&mut self) {
        let mut rng = rand::thread_rng();
        let mut start = 0;
        while start < self.trackers.len() {
            let end = self.group_range(self.trackers[start].group()).end;
            self.trackers[start..end].shuffle(&mut rng);
            start = end;
        }
    }

    /// Sends an announce with the given event to one tracker.
    ///
    /// No-ops on a scrape event, an unusable tracker, and a tracker already
    /// announcing; an in-flight scrape is closed to make room.
    pub fn send_state(&mut self, id: TrackerId, event: TrackerEvent) {
        let Some(index) = self.find(id) else {
            return;
        };
        if event == TrackerEvent::Scrape || !self.is_usable(&self.trackers[index]) {
            return;
        }
        match self.trackers[index].busy_kind() {
            Some(RequestKind::Announce) => return,
            Some(RequestKind::Scrape) => self.trackers[index].close(),
            None => {}
        }

        tracing::info!(
            event = %event,
            group = self.trackers[index].group(),
            url = %self.trackers[index].url(),
            "sending announce"
        );

        let request = self.announce_request(index, event);
        let tracker = &mut self.trackers[index];
        tracker.start_announce(request, &self.receipts);
        tracker.inc_request_counter();
    }

    /// Sends a scrape to one tracker.
    ///
    /// Skipped while busy, unusable, unable to scrape, or inside the
    /// ten-minute scrape cooldown.
    pub fn send_scrape(&mut self, id: TrackerId) {
        let Some(index) = self.find(id) else {
            return;
        };
        let tracker = &self.trackers[index];
        if tracker.is_busy() || !self.is_usable(tracker) || !tracker.can_scrape() {
            return;
        }
        if tracker.scrape_time_last() + constants::SCRAPE_COOLDOWN_SECS > self.clock.now() {
            return;
        }

        tracing::info!(
            group = tracker.group(),
            url = %tracker.url(),
            "sending scrape"
        );

        let info_hash = self.info.info_hash;
        let tracker = &mut self.trackers[index];
        tracker.start_scrape(info_hash, &self.receipts);
        tracker.inc_request_counter();
    }

    fn announce_request(&self, index: usize, event: TrackerEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.info.info_hash,
            peer_id: self.info.peer_id,
            port: self.info.port,
            uploaded: self.info.stats.uploaded(),
            downloaded: self.info.stats.downloaded(),
            left: self.info.stats.left(),
            event,
            compact: true,
            numwant: self.numwant,
            key: self.key,
            tracker_id: self.trackers[index].tracker_id().map(str::to_string),
        }
    }

    /// Routes a transport receipt to the matching `receive_*` handler.
    ///
    /// Receipts for unknown trackers or stale generations (closed,
    /// disowned, reconfigured) are dropped here.
    pub fn dispatch(&mut self, receipt: TrackerReceipt) {
        let Some(index) = self.find(receipt.tracker) else {
            tracing::debug!(tracker = %receipt.tracker, "receipt for unknown tracker");
            return;
        };
        {
            let tracker = &self.trackers[index];
            if receipt.generation != tracker.generation() || !tracker.is_busy() {
                tracing::debug!(url = %tracker.url(), "dropping stale receipt");
                return;
            }
        }
        self.trackers[index].finish_request();

        match receipt.outcome {
            ReceiptOutcome::Announce(Ok(response)) => {
                self.trackers[index].apply_announce_response(
                    response.interval,
                    response.min_interval,
                    response.tracker_id,
                );
                self.receive_success(receipt.tracker, response.peers);
            }
            ReceiptOutcome::Announce(Err(message)) => {
                self.receive_failed(receipt.tracker, &message);
            }
            ReceiptOutcome::Scrape(Ok(stats)) => {
                self.receive_scrape_success(receipt.tracker, stats);
            }
            ReceiptOutcome::Scrape(Err(message)) => {
                self.receive_scrape_failed(receipt.tracker, &message);
            }
        }
    }

    /// Records a successful announce: promotes the tracker, dedupes the
    /// peer list, updates counters, and hands the peers to the host.
    ///
    /// # Panics
    ///
    /// Panics when the tracker is not in the list or still busy; receipts
    /// route through [`TrackerList::dispatch`], so either is a bug in this
    /// layer.
    pub fn receive_success(&mut self, id: TrackerId, mut peers: Vec<SocketAddr>) {
        let index = self.expect_settled(id, "receive_success");
        let index = self.promote(index);

        peers.sort_unstable();
        peers.dedup();

        tracing::info!(
            peers = peers.len(),
            url = %self.trackers[index].url(),
            "received peers"
        );

        let now = self.clock.now();
        self.trackers[index].record_success(now, peers.len() as u32);

        let new_peers = match self.slots.success.as_mut() {
            Some(slot) => slot(&self.trackers[index], &peers),
            None => 0,
        };
        self.trackers[index].set_latest_new_peers(new_peers);
    }

    /// Records a failed announce and notifies the host.
    ///
    /// # Panics
    ///
    /// Panics when the tracker is not in the list or still busy.
    pub fn receive_failed(&mut self, id: TrackerId, message: &str) {
        let index = self.expect_settled(id, "receive_failed");

        tracing::info!(
            url = %self.trackers[index].url(),
            message,
            "tracker request failed"
        );

        let now = self.clock.now();
        self.trackers[index].record_failed(now);

        if let Some(slot) = self.slots.failed.as_mut() {
            slot(&self.trackers[index], message);
        }
    }

    /// Records a completed scrape.
    ///
    /// # Panics
    ///
    /// Panics when the tracker is not in the list or still busy.
    pub fn receive_scrape_success(&mut self, id: TrackerId, stats: ScrapeStats) {
        let index = self.expect_settled(id, "receive_scrape_success");

        tracing::info!(
            url = %self.trackers[index].url(),
            complete = stats.complete,
            incomplete = stats.incomplete,
            "received scrape"
        );

        let now = self.clock.now();
        self.trackers[index].record_scrape(now, stats);

        if let Some(slot) = self.slots.scrape_success.as_mut() {
            slot(&self.trackers[index]);
        }
    }

    /// Records a failed scrape; counters are untouched.
    ///
    /// # Panics
    ///
    /// Panics when the tracker is not in the list or still busy.
    pub fn receive_scrape_failed(&mut self, id: TrackerId, message: &str) {
        let index = self.expect_settled(id, "receive_scrape_failed");

        tracing::info!(
            url = %self.trackers[index].url(),
            message,
            "scrape failed"
        );

        if let Some(slot) = self.slots.scrape_failed.as_mut() {
            slot(&self.trackers[index], message);
        }
    }

    fn expect_settled(&self, id: TrackerId, operation: &str) -> usize {
        let Some(index) = self.find(id) else {
            panic!("{operation} called for a tracker not in the list");
        };
        if self.trackers[index].is_busy() {
            panic!("{operation} called while {id} is busy");
        }
        index
    }

    /// Changes a tracker's enabled tri-state and fans the transition out.
    pub fn set_enabled(&mut self, id: TrackerId, status: EnabledState) {
        let Some(index) = self.find(id) else {
            return;
        };
        if self.trackers[index].enabled_status() == status {
            return;
        }

        tracing::info!(
            url = %self.trackers[index].url(),
            from = self.trackers[index].enabled_status().to_i64(),
            to = status.to_i64(),
            "tracker enabled status change"
        );

        let previous = self.trackers[index].apply_enabled_status(status);
        self.receive_tracker_enabled_change(index, previous, status);
    }

    fn receive_tracker_enabled_change(
        &mut self,
        index: usize,
        previous: EnabledState,
        current: EnabledState,
    ) {
        let protocol_on = self.protocol_enabled(self.trackers[index].kind());
        let was_on = previous == EnabledState::On
            || (previous == EnabledState::Undefined && protocol_on);
        let is_on =
            current == EnabledState::On || (current == EnabledState::Undefined && protocol_on);

        // Dropping back to Undefined while the protocol is globally off
        // also takes the tracker offline.
        if was_on && current == EnabledState::Undefined && !protocol_on {
            self.trackers[index].close();
        }

        if is_on != was_on {
            let slot = if is_on {
                self.slots.tracker_enabled.as_mut()
            } else {
                self.slots.tracker_disabled.as_mut()
            };
            if let Some(slot) = slot {
                slot(&self.trackers[index]);
            }
        }
    }

    /// Closes every tracker whose latest event bit is NOT in the bitmap.
    pub fn close_all_excluding(&mut self, event_bitmap: u32) {
        for tracker in &mut self.trackers {
            if event_bitmap & tracker.latest_event().bit() == 0 {
                tracker.close();
            }
        }
    }

    /// Disowns every tracker whose latest event bit IS in the bitmap.
    pub fn disown_all_including(&mut self, event_bitmap: u32) {
        for tracker in &mut self.trackers {
            if event_bitmap & tracker.latest_event().bit() != 0 {
                tracker.disown();
            }
        }
    }

    /// Destroys all trackers.
    pub fn clear(&mut self) {
        self.trackers.clear();
    }

    /// Resets every tracker's cumulative counters.
    pub fn clear_stats(&mut self) {
        for tracker in &mut self.trackers {
            tracker.clear_stats();
        }
    }
}
