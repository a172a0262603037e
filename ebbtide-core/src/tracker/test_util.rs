//! Shared fixtures for tracker-layer tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::EbbtideConfig;
use crate::net::{AddressResolver, ConnectionPolicy, SharedPolicy};

use super::clock::Clock;
use super::list::{DownloadInfo, TrackerList};
use super::tracker::Tracker;
use super::types::{
    AnnounceRequest, AnnounceResponse, ScrapeStats, TrackerId, TrackerKind, TrackerReceipt,
    TrackerTransport, TransferStats,
};
use super::{InfoHash, TrackerError};

pub(crate) struct ZeroStats;

impl TransferStats for ZeroStats {
    fn uploaded(&self) -> u64 {
        0
    }

    fn downloaded(&self) -> u64 {
        0
    }

    fn left(&self) -> u64 {
        1000
    }
}

/// Transport that answers immediately with canned results.
pub(crate) struct StubTransport {
    pub(crate) url: String,
    pub(crate) kind: TrackerKind,
    pub(crate) announce: Result<AnnounceResponse, String>,
    pub(crate) scrape: Result<ScrapeStats, String>,
}

impl StubTransport {
    pub(crate) fn new(url: &str, kind: TrackerKind) -> Self {
        Self {
            url: url.to_string(),
            kind,
            announce: Ok(AnnounceResponse {
                interval: 1800,
                min_interval: None,
                tracker_id: None,
                complete: None,
                incomplete: None,
                peers: Vec::new(),
            }),
            scrape: Ok(ScrapeStats {
                complete: 10,
                incomplete: 20,
                downloaded: 30,
            }),
        }
    }

    pub(crate) fn failing(url: &str, message: &str) -> Self {
        let mut stub = Self::new(url, TrackerKind::Http);
        stub.announce = Err(message.to_string());
        stub.scrape = Err(message.to_string());
        stub
    }
}

#[async_trait]
impl TrackerTransport for StubTransport {
    async fn announce(&self, _request: AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        self.announce
            .clone()
            .map_err(|message| TrackerError::ProtocolError { message })
    }

    async fn scrape(&self, _info_hash: InfoHash) -> Result<ScrapeStats, TrackerError> {
        self.scrape
            .clone()
            .map_err(|message| TrackerError::ProtocolError { message })
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn kind(&self) -> TrackerKind {
        self.kind
    }
}

pub(crate) fn make_list(clock: Clock) -> (TrackerList, mpsc::UnboundedReceiver<TrackerReceipt>) {
    make_list_with_policy(clock, ConnectionPolicy::new().into_shared())
}

pub(crate) fn make_list_with_policy(
    clock: Clock,
    policy: SharedPolicy,
) -> (TrackerList, mpsc::UnboundedReceiver<TrackerReceipt>) {
    let config = EbbtideConfig::for_testing();
    let info = DownloadInfo {
        info_hash: InfoHash::new([7u8; 20]),
        peer_id: [2u8; 20],
        port: 6881,
        stats: Arc::new(ZeroStats),
    };
    let resolver = Arc::new(AddressResolver::new(&config.network));
    TrackerList::new(info, policy, resolver, None, &config, clock)
}

pub(crate) fn insert_stub(list: &mut TrackerList, group: u32, url: &str) -> TrackerId {
    list.insert(
        group,
        Arc::new(StubTransport::new(url, TrackerKind::Http)),
        Tracker::FLAG_CAN_SCRAPE,
    )
}
