//! HTTP(S) tracker transport: announce URL building and bencoded response
//! parsing per BEP 3, scrape per BEP 48.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use async_trait::async_trait;
use serde_bencode::value::Value;
use url::Url;

use crate::config::NetworkConfig;

use super::tracker::Tracker;
use super::types::{
    AnnounceRequest, AnnounceResponse, ScrapeStats, TrackerEvent, TrackerKind, TrackerTransport,
    constants,
};
use super::{InfoHash, TrackerError};

/// HTTP tracker transport.
pub struct HttpTracker {
    announce_url: String,
    scrape_url: Option<String>,
    client: reqwest::Client,
}

impl HttpTracker {
    /// Creates an HTTP transport with automatic scrape URL derivation.
    ///
    /// The scrape URL exists only when the announce URL's last path segment
    /// is `announce` (BEP 48). Timeout and user agent come from the network
    /// configuration.
    pub fn new(announce_url: String, config: &NetworkConfig) -> Self {
        let scrape_url = announce_url
            .rfind('/')
            .filter(|&slash| announce_url[slash..].starts_with("/announce"))
            .map(|_| Tracker::scrape_url_from(&announce_url));

        Self {
            client: reqwest::Client::builder()
                .timeout(config.tracker_timeout)
                .user_agent(config.user_agent)
                .build()
                .expect("HTTP client creation should not fail"),
            announce_url,
            scrape_url,
        }
    }

    /// Whether a scrape URL could be derived.
    pub fn supports_scrape(&self) -> bool {
        self.scrape_url.is_some()
    }

    /// URL encode bytes for tracker communication per RFC 3986.
    pub(crate) fn url_encode_bytes(bytes: &[u8]) -> String {
        bytes.iter().map(|&b| format!("%{b:02X}")).collect()
    }

    /// Build the announce URL with query parameters.
    ///
    /// Binary parameters are percent-encoded by hand; a generic query
    /// serializer would re-encode the percent signs.
    fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        let mut url = String::with_capacity(self.announce_url.len() + 256);
        url.push_str(&self.announce_url);
        url.push(if self.announce_url.contains('?') { '&' } else { '?' });

        let _ = write!(
            url,
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact={}&key={:08x}",
            Self::url_encode_bytes(request.info_hash.as_bytes()),
            Self::url_encode_bytes(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            u8::from(request.compact),
            request.key,
        );
        if request.numwant >= 0 {
            let _ = write!(url, "&numwant={}", request.numwant);
        }
        if request.event != TrackerEvent::None {
            let _ = write!(url, "&event={}", request.event.as_str());
        }
        if let Some(tracker_id) = &request.tracker_id {
            let _ = write!(
                url,
                "&trackerid={}",
                Self::url_encode_bytes(tracker_id.as_bytes())
            );
        }
        url
    }

    fn request_error(&self, error: reqwest::Error) -> TrackerError {
        if error.is_timeout() {
            TrackerError::RequestTimeout {
                url: self.announce_url.clone(),
            }
        } else if error.is_connect() {
            TrackerError::ConnectionFailed {
                url: self.announce_url.clone(),
            }
        } else {
            TrackerError::Http(error)
        }
    }

    async fn fetch(&self, url: String) -> Result<bytes::Bytes, TrackerError> {
        let url = Url::parse(&url)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|error| self.request_error(error))?;
        response
            .bytes()
            .await
            .map_err(|error| self.request_error(error))
    }

    /// Parse compact IPv4 peer entries (4 address + 2 port bytes each).
    pub(crate) fn parse_compact_peers(peer_bytes: &[u8]) -> Result<Vec<SocketAddr>, TrackerError> {
        if peer_bytes.len() % constants::COMPACT_PEER_SIZE != 0 {
            return Err(TrackerError::ProtocolError {
                message: "invalid compact peer data length".to_string(),
            });
        }

        let mut peers = Vec::with_capacity(peer_bytes.len() / constants::COMPACT_PEER_SIZE);
        for chunk in peer_bytes.chunks(constants::COMPACT_PEER_SIZE) {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            peers.push(SocketAddr::V4(SocketAddrV4::new(ip, port)));
        }
        Ok(peers)
    }

    /// Parse compact IPv6 peer entries (16 address + 2 port bytes each).
    pub(crate) fn parse_compact_peers6(peer_bytes: &[u8]) -> Result<Vec<SocketAddr>, TrackerError> {
        if peer_bytes.len() % constants::COMPACT_PEER6_SIZE != 0 {
            return Err(TrackerError::ProtocolError {
                message: "invalid compact peers6 data length".to_string(),
            });
        }

        let mut peers = Vec::with_capacity(peer_bytes.len() / constants::COMPACT_PEER6_SIZE);
        for chunk in peer_bytes.chunks(constants::COMPACT_PEER6_SIZE) {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            peers.push(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)));
        }
        Ok(peers)
    }

    /// Parse a non-compact peer list (dictionaries with `ip` and `port`).
    ///
    /// Entries that do not parse are skipped; trackers routinely mix
    /// hostname entries into these lists.
    fn parse_peer_dicts(entries: &[Value]) -> Vec<SocketAddr> {
        let mut peers = Vec::new();
        for entry in entries {
            let Value::Dict(dict) = entry else { continue };
            let Some(Value::Bytes(ip)) = dict.get(b"ip".as_slice()) else {
                continue;
            };
            let Some(Value::Int(port)) = dict.get(b"port".as_slice()) else {
                continue;
            };
            let Ok(ip) = std::str::from_utf8(ip) else {
                continue;
            };
            let (Ok(ip), Ok(port)) = (ip.parse::<std::net::IpAddr>(), u16::try_from(*port))
            else {
                continue;
            };
            peers.push(SocketAddr::new(ip, port));
        }
        peers
    }

    /// Parse a bencoded announce response.
    fn parse_announce_response(&self, bytes: &[u8]) -> Result<AnnounceResponse, TrackerError> {
        let dict = parse_dict(bytes)?;
        check_failure_reason(&dict)?;

        let interval = match dict.get(b"interval".as_slice()) {
            Some(Value::Int(interval)) => u32::try_from(*interval).unwrap_or(0),
            _ => {
                return Err(TrackerError::ProtocolError {
                    message: "missing interval in announce response".to_string(),
                });
            }
        };

        let min_interval = match dict.get(b"min interval".as_slice()) {
            Some(Value::Int(min_interval)) => u32::try_from(*min_interval).ok(),
            _ => None,
        };

        let tracker_id = match dict.get(b"tracker id".as_slice()) {
            Some(Value::Bytes(id)) => Some(String::from_utf8_lossy(id).to_string()),
            _ => None,
        };

        let complete = match dict.get(b"complete".as_slice()) {
            Some(Value::Int(complete)) => u32::try_from(*complete).ok(),
            _ => None,
        };
        let incomplete = match dict.get(b"incomplete".as_slice()) {
            Some(Value::Int(incomplete)) => u32::try_from(*incomplete).ok(),
            _ => None,
        };

        let mut peers = match dict.get(b"peers".as_slice()) {
            Some(Value::Bytes(compact)) => Self::parse_compact_peers(compact)?,
            Some(Value::List(entries)) => Self::parse_peer_dicts(entries),
            _ => Vec::new(),
        };
        if let Some(Value::Bytes(compact)) = dict.get(b"peers6".as_slice()) {
            peers.extend(Self::parse_compact_peers6(compact)?);
        }

        Ok(AnnounceResponse {
            interval,
            min_interval,
            tracker_id,
            complete,
            incomplete,
            peers,
        })
    }

    /// Parse a bencoded scrape response for one torrent.
    fn parse_scrape_response(
        &self,
        bytes: &[u8],
        info_hash: InfoHash,
    ) -> Result<ScrapeStats, TrackerError> {
        let dict = parse_dict(bytes)?;
        check_failure_reason(&dict)?;

        let Some(Value::Dict(files)) = dict.get(b"files".as_slice()) else {
            return Err(TrackerError::ProtocolError {
                message: "missing files in scrape response".to_string(),
            });
        };
        let Some(Value::Dict(stats)) = files.get(info_hash.as_bytes().as_slice()) else {
            return Err(TrackerError::ProtocolError {
                message: format!("scrape response missing torrent {info_hash}"),
            });
        };

        let field = |key: &[u8]| match stats.get(key) {
            Some(Value::Int(value)) => u32::try_from(*value).unwrap_or(0),
            _ => 0,
        };

        Ok(ScrapeStats {
            complete: field(b"complete"),
            incomplete: field(b"incomplete"),
            downloaded: field(b"downloaded"),
        })
    }
}

fn parse_dict(bytes: &[u8]) -> Result<HashMap<Vec<u8>, Value>, TrackerError> {
    let value: Value =
        serde_bencode::from_bytes(bytes).map_err(|error| TrackerError::ProtocolError {
            message: format!("invalid bencode in tracker response: {error}"),
        })?;
    match value {
        Value::Dict(dict) => Ok(dict),
        _ => Err(TrackerError::ProtocolError {
            message: "tracker response is not a dictionary".to_string(),
        }),
    }
}

fn check_failure_reason(dict: &HashMap<Vec<u8>, Value>) -> Result<(), TrackerError> {
    if let Some(Value::Bytes(reason)) = dict.get(b"failure reason".as_slice()) {
        return Err(TrackerError::Failure {
            reason: String::from_utf8_lossy(reason).to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl TrackerTransport for HttpTracker {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let url = self.build_announce_url(&request);
        tracing::debug!(url, "announcing");
        let body = self.fetch(url).await?;
        self.parse_announce_response(&body)
    }

    async fn scrape(&self, info_hash: InfoHash) -> Result<ScrapeStats, TrackerError> {
        let scrape_url = self
            .scrape_url
            .as_ref()
            .ok_or_else(|| TrackerError::ProtocolError {
                message: "no scrape url available".to_string(),
            })?;

        let mut url = String::with_capacity(scrape_url.len() + 70);
        url.push_str(scrape_url);
        url.push(if scrape_url.contains('?') { '&' } else { '?' });
        let _ = write!(
            url,
            "info_hash={}",
            Self::url_encode_bytes(info_hash.as_bytes())
        );

        tracing::debug!(url, "scraping");
        let body = self.fetch(url).await?;
        self.parse_scrape_response(&body, info_hash)
    }

    fn url(&self) -> &str {
        &self.announce_url
    }

    fn kind(&self) -> TrackerKind {
        TrackerKind::Http
    }
}
