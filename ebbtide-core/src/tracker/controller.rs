//! Thin announce driver on top of [`TrackerList`].
//!
//! Watches download state changes, hands the next candidate its announce,
//! and walks the list on failure - sleeping out a tracker's backoff window
//! before retrying. Selection never enforces the retry gate; this scheduler
//! does.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time;

use super::list::TrackerList;
use super::tracker::Tracker;
use super::types::{ReceiptOutcome, TrackerEvent, TrackerReceipt};

/// Host-facing handle feeding download state changes to the controller.
#[derive(Clone)]
pub struct AnnounceHandle {
    state: watch::Sender<TrackerEvent>,
}

impl AnnounceHandle {
    /// Reports that the download started.
    pub fn start(&self) {
        self.send(TrackerEvent::Started);
    }

    /// Reports that the download completed.
    pub fn complete(&self) {
        self.send(TrackerEvent::Completed);
    }

    /// Reports that the download stopped.
    pub fn stop(&self) {
        self.send(TrackerEvent::Stopped);
    }

    fn send(&self, event: TrackerEvent) {
        let _ = self.state.send(event);
    }
}

/// Drives announces for one tracker list.
pub struct AnnounceController {
    list: TrackerList,
    receipts: mpsc::UnboundedReceiver<TrackerReceipt>,
    state_rx: watch::Receiver<TrackerEvent>,
    wake_at: Option<u64>,
    wake_event: TrackerEvent,
}

impl AnnounceController {
    /// Wraps a list and its receipt channel; returns the state handle the
    /// host drives it with.
    pub fn new(
        list: TrackerList,
        receipts: mpsc::UnboundedReceiver<TrackerReceipt>,
    ) -> (Self, AnnounceHandle) {
        let (state_tx, state_rx) = watch::channel(TrackerEvent::None);
        (
            Self {
                list,
                receipts,
                state_rx,
                wake_at: None,
                wake_event: TrackerEvent::None,
            },
            AnnounceHandle { state: state_tx },
        )
    }

    /// The tracker list being driven.
    pub fn list(&self) -> &TrackerList {
        &self.list
    }

    /// Mutable access, for configuring slots and trackers.
    pub fn list_mut(&mut self) -> &mut TrackerList {
        &mut self.list
    }

    /// When the controller intends to wake for a deferred announce.
    pub fn next_wake(&self) -> Option<u64> {
        self.wake_at
    }

    /// Seconds until the tracker at `index` may be contacted; 0 when due.
    pub fn dispatch_delay(&self, index: usize) -> u64 {
        let Some(tracker) = self.list.get(index) else {
            return 0;
        };
        let gate = if tracker.failed_counter() != 0 {
            tracker.failed_time_next()
        } else {
            tracker.success_time_next()
        };
        gate.saturating_sub(self.list.clock().now())
    }

    /// Announces a state change through the best candidate, or schedules a
    /// wake-up when the candidate is still gated.
    pub fn announce(&mut self, event: TrackerEvent) {
        if event == TrackerEvent::Scrape {
            return;
        }
        self.list.set_state(event);
        match self.list.find_next_to_request(0) {
            Some(index) => self.dispatch_or_schedule(index),
            None => tracing::debug!("no usable tracker to announce to"),
        }
    }

    /// Feeds one receipt through the list and reacts: a failed announce
    /// advances to the next candidate, a successful one books the regular
    /// re-announce.
    pub fn handle_receipt(&mut self, receipt: TrackerReceipt) {
        let id = receipt.tracker;
        let outcome_was_announce_failure =
            matches!(receipt.outcome, ReceiptOutcome::Announce(Err(_)));
        let outcome_was_announce_success =
            matches!(receipt.outcome, ReceiptOutcome::Announce(Ok(_)));

        self.list.dispatch(receipt);

        if outcome_was_announce_failure {
            let start = self.list.find(id).map_or(0, |index| index + 1);
            self.wake_event = self.list.state();
            // Wrap around so a lone tracker still gets its backoff retry.
            let next = self
                .list
                .find_next_to_request(start)
                .or_else(|| self.list.find_next_to_request(0));
            match next {
                Some(index) => self.dispatch_or_schedule(index),
                None => tracing::debug!("no fallback tracker after failure"),
            }
        } else if outcome_was_announce_success {
            self.wake_event = TrackerEvent::None;
            if let Some(due) = self.list.by_id(id).map(Tracker::success_time_next) {
                if due > 0 {
                    self.schedule_wake(due);
                }
            }
        }
    }

    fn dispatch_or_schedule(&mut self, index: usize) {
        let delay = self.dispatch_delay(index);
        let Some(tracker) = self.list.get(index) else {
            return;
        };
        if delay == 0 {
            let id = tracker.id();
            let event = self.list.state();
            self.list.send_state(id, event);
        } else {
            let due = self.list.clock().now() + delay;
            tracing::debug!(url = %tracker.url(), delay, "announce deferred");
            self.wake_event = self.list.state();
            self.schedule_wake(due);
        }
    }

    fn schedule_wake(&mut self, due: u64) {
        self.wake_at = Some(self.wake_at.map_or(due, |current| current.min(due)));
    }

    /// Runs until the host drops its [`AnnounceHandle`].
    pub async fn run(mut self) {
        tracing::debug!("announce controller started");
        loop {
            self.list.clock().refresh();
            let now = self.list.clock().now();
            let wake_in = self
                .wake_at
                .map(|due| Duration::from_secs(due.saturating_sub(now)));

            tokio::select! {
                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let event = *self.state_rx.borrow_and_update();
                    self.announce(event);
                }
                receipt = self.receipts.recv() => {
                    let Some(receipt) = receipt else { break };
                    self.handle_receipt(receipt);
                }
                () = time::sleep(wake_in.unwrap_or_default()), if wake_in.is_some() => {
                    self.wake_at = None;
                    self.list.clock().refresh();
                    self.announce(self.wake_event);
                }
            }
        }
        tracing::debug!("announce controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::tracker::test_util::{StubTransport, insert_stub, make_list};

    use super::super::clock::Clock;
    use super::*;

    #[tokio::test]
    async fn test_announce_dispatches_to_first_candidate() {
        let (list, rx) = make_list(Clock::fixed(1000));
        let (mut controller, _handle) = AnnounceController::new(list, rx);
        let id = insert_stub(controller.list_mut(), 0, "http://a/announce");

        controller.announce(TrackerEvent::Started);

        assert_eq!(controller.list().state(), TrackerEvent::Started);
        assert!(controller.list().by_id(id).unwrap().is_busy());
    }

    #[tokio::test]
    async fn test_backoff_gate_defers_dispatch() {
        // S2: three failures at t=0, 5, 15 gate the tracker until t=35.
        let clock = Clock::fixed(20);
        let (list, rx) = make_list(clock.clone());
        let (mut controller, _handle) = AnnounceController::new(list, rx);
        let id = insert_stub(controller.list_mut(), 0, "http://t/announce");

        for failed_at in [0, 5, 15] {
            clock.set(failed_at);
            controller.list_mut().receive_failed(id, "down");
        }
        clock.set(20);
        assert_eq!(
            controller.list().by_id(id).unwrap().failed_time_next(),
            35
        );

        // Selection still returns the tracker; the scheduler holds it back.
        let index = controller.list().find_next_to_request(0).unwrap();
        assert_eq!(controller.dispatch_delay(index), 15);

        controller.announce(TrackerEvent::None);
        assert!(!controller.list().by_id(id).unwrap().is_busy());
        assert_eq!(controller.next_wake(), Some(35));

        clock.set(35);
        let index = controller.list().find_next_to_request(0).unwrap();
        assert_eq!(controller.dispatch_delay(index), 0);
        controller.announce(TrackerEvent::None);
        assert!(controller.list().by_id(id).unwrap().is_busy());
    }

    #[tokio::test]
    async fn test_failure_receipt_advances_to_next_tracker() {
        let (list, rx) = make_list(Clock::fixed(1000));
        let (mut controller, _handle) = AnnounceController::new(list, rx);

        let a = controller.list_mut().insert(
            0,
            Arc::new(StubTransport::failing("http://a/announce", "unreachable")),
            0,
        );
        let b = insert_stub(controller.list_mut(), 0, "http://b/announce");

        controller.announce(TrackerEvent::Started);
        assert!(controller.list().by_id(a).unwrap().is_busy());

        let receipt = controller.receipts.recv().await.expect("a's failure");
        controller.handle_receipt(receipt);

        assert_eq!(controller.list().by_id(a).unwrap().failed_counter(), 1);
        assert!(
            controller.list().by_id(b).unwrap().is_busy(),
            "failover went to the next tracker in the tier"
        );

        let receipt = controller.receipts.recv().await.expect("b's success");
        controller.handle_receipt(receipt);

        // B promoted to the head of its group, re-announce booked.
        assert_eq!(controller.list().get(0).unwrap().id(), b);
        assert_eq!(
            controller.next_wake(),
            Some(controller.list().by_id(b).unwrap().success_time_next())
        );
    }

    #[tokio::test]
    async fn test_run_loop_announces_on_state_change() {
        let (list, rx) = make_list(Clock::fixed(1000));
        let (mut controller, handle) = AnnounceController::new(list, rx);
        let id = insert_stub(controller.list_mut(), 0, "http://a/announce");

        let driver = tokio::spawn(controller.run());
        handle.start();

        // Give the loop a few turns to dispatch and settle the receipt.
        tokio::task::yield_now().await;
        time::sleep(Duration::from_millis(50)).await;

        drop(handle);
        driver.await.expect("controller exits when the handle drops");
        let _ = id;
    }

    #[tokio::test]
    async fn test_scrape_event_is_ignored() {
        let (list, rx) = make_list(Clock::fixed(1000));
        let (mut controller, _handle) = AnnounceController::new(list, rx);
        let id = insert_stub(controller.list_mut(), 0, "http://a/announce");

        controller.announce(TrackerEvent::Scrape);
        assert!(!controller.list().by_id(id).unwrap().is_busy());
        assert_eq!(controller.list().state(), TrackerEvent::None);
    }
}
