//! UDP tracker transport per BEP 15.
//!
//! Connect handshake, announce and scrape over a connected UDP socket with
//! per-exchange timeouts and bounded retransmits. The tracker hostname goes
//! through the shared [`AddressResolver`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut};
use tokio::net::UdpSocket;
use tokio::time;
use url::Url;

use crate::EbbtideError;
use crate::config::NetworkConfig;
use crate::net::{AddressFamily, AddressResolver, SocketType};

use super::http::HttpTracker;
use super::types::{
    AnnounceRequest, AnnounceResponse, ScrapeStats, TrackerKind, TrackerTransport,
};
use super::{InfoHash, TrackerError};

/// Magic constant opening every connect request.
const PROTOCOL_ID: i64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// UDP tracker transport.
pub struct UdpTracker {
    url: String,
    host: String,
    port: u16,
    resolver: Arc<AddressResolver>,
    timeout: Duration,
    retries: u32,
}

impl UdpTracker {
    /// Creates a UDP transport from a `udp://host:port[/path]` URL.
    ///
    /// # Errors
    ///
    /// - `EbbtideError::InvalidInput` - If the URL does not parse or lacks
    ///   a host or port
    pub fn new(
        url: String,
        resolver: Arc<AddressResolver>,
        config: &NetworkConfig,
    ) -> Result<Self, EbbtideError> {
        let parsed = Url::parse(&url).map_err(|error| EbbtideError::InvalidInput {
            reason: format!("invalid udp tracker url {url}: {error}"),
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| EbbtideError::InvalidInput {
                reason: format!("udp tracker url {url} has no host"),
            })?
            .to_string();
        let port = parsed.port().ok_or_else(|| EbbtideError::InvalidInput {
            reason: format!("udp tracker url {url} has no port"),
        })?;

        Ok(Self {
            url,
            host,
            port,
            resolver,
            timeout: config.udp_timeout,
            retries: config.udp_retries.max(1),
        })
    }

    async fn tracker_address(&self) -> Result<SocketAddr, TrackerError> {
        let outcome = self
            .resolver
            .resolve(&self.host, AddressFamily::V4, SocketType::Datagram)
            .await
            .ok_or_else(|| TrackerError::ResolveFailed {
                host: self.host.clone(),
                message: "resolver disabled".to_string(),
            })?;
        let mut address = outcome.map_err(|failure| TrackerError::ResolveFailed {
            host: self.host.clone(),
            message: failure.to_string(),
        })?;
        address.set_port(self.port);
        Ok(address)
    }

    /// Sends a packet and waits for the reply, retransmitting on timeout.
    async fn exchange(&self, socket: &UdpSocket, packet: &[u8]) -> Result<Vec<u8>, TrackerError> {
        let mut response = vec![0u8; 1500];
        for attempt in 0..self.retries {
            socket.send(packet).await?;
            match time::timeout(self.timeout, socket.recv(&mut response)).await {
                Ok(Ok(len)) => {
                    response.truncate(len);
                    return Ok(response);
                }
                Ok(Err(error)) => return Err(error.into()),
                Err(_) => {
                    tracing::debug!(url = %self.url, attempt, "udp exchange timed out");
                }
            }
        }
        Err(TrackerError::RequestTimeout {
            url: self.url.clone(),
        })
    }

    async fn open_session(&self) -> Result<(UdpSocket, i64), TrackerError> {
        let address = self.tracker_address().await?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(address).await?;

        let transaction_id = rand::random::<u32>();
        let response = self
            .exchange(&socket, &encode_connect(transaction_id))
            .await?;
        let connection_id = decode_connect(transaction_id, &response)?;
        Ok((socket, connection_id))
    }
}

#[async_trait]
impl TrackerTransport for UdpTracker {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let (socket, connection_id) = self.open_session().await?;

        let transaction_id = rand::random::<u32>();
        let packet = encode_announce(connection_id, transaction_id, &request);
        let response = self.exchange(&socket, &packet).await?;
        decode_announce(transaction_id, &response)
    }

    async fn scrape(&self, info_hash: InfoHash) -> Result<ScrapeStats, TrackerError> {
        let (socket, connection_id) = self.open_session().await?;

        let transaction_id = rand::random::<u32>();
        let packet = encode_scrape(connection_id, transaction_id, info_hash);
        let response = self.exchange(&socket, &packet).await?;
        decode_scrape(transaction_id, &response)
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn kind(&self) -> TrackerKind {
        TrackerKind::Udp
    }
}

fn encode_connect(transaction_id: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(16);
    packet.put_i64(PROTOCOL_ID);
    packet.put_u32(ACTION_CONNECT);
    packet.put_u32(transaction_id);
    packet
}

fn decode_connect(transaction_id: u32, response: &[u8]) -> Result<i64, TrackerError> {
    let mut buf = check_header(transaction_id, response, ACTION_CONNECT, 16)?;
    Ok(buf.get_i64())
}

fn encode_announce(connection_id: i64, transaction_id: u32, request: &AnnounceRequest) -> Vec<u8> {
    let mut packet = Vec::with_capacity(98);
    packet.put_i64(connection_id);
    packet.put_u32(ACTION_ANNOUNCE);
    packet.put_u32(transaction_id);
    packet.put_slice(request.info_hash.as_bytes());
    packet.put_slice(&request.peer_id);
    packet.put_u64(request.downloaded);
    packet.put_u64(request.left);
    packet.put_u64(request.uploaded);
    packet.put_u32(request.event as u32);
    packet.put_u32(0); // ip: let the tracker use the source address
    packet.put_u32(request.key);
    packet.put_i32(request.numwant);
    packet.put_u16(request.port);
    packet
}

fn decode_announce(
    transaction_id: u32,
    response: &[u8],
) -> Result<AnnounceResponse, TrackerError> {
    let mut buf = check_header(transaction_id, response, ACTION_ANNOUNCE, 20)?;
    let interval = buf.get_u32();
    let incomplete = buf.get_u32();
    let complete = buf.get_u32();
    let peers = HttpTracker::parse_compact_peers(buf.chunk())?;

    Ok(AnnounceResponse {
        interval,
        min_interval: None,
        tracker_id: None,
        complete: Some(complete),
        incomplete: Some(incomplete),
        peers,
    })
}

fn encode_scrape(connection_id: i64, transaction_id: u32, info_hash: InfoHash) -> Vec<u8> {
    let mut packet = Vec::with_capacity(36);
    packet.put_i64(connection_id);
    packet.put_u32(ACTION_SCRAPE);
    packet.put_u32(transaction_id);
    packet.put_slice(info_hash.as_bytes());
    packet
}

fn decode_scrape(transaction_id: u32, response: &[u8]) -> Result<ScrapeStats, TrackerError> {
    let mut buf = check_header(transaction_id, response, ACTION_SCRAPE, 20)?;
    let complete = buf.get_u32();
    let downloaded = buf.get_u32();
    let incomplete = buf.get_u32();

    Ok(ScrapeStats {
        complete,
        incomplete,
        downloaded,
    })
}

/// Validates action and transaction id, returning the payload cursor.
fn check_header<'a>(
    transaction_id: u32,
    response: &'a [u8],
    expected_action: u32,
    minimum_len: usize,
) -> Result<&'a [u8], TrackerError> {
    if response.len() < 8 {
        return Err(TrackerError::ProtocolError {
            message: "udp tracker response shorter than its header".to_string(),
        });
    }
    let mut buf = response;
    let action = buf.get_u32();
    let echoed = buf.get_u32();

    if action == ACTION_ERROR {
        return Err(TrackerError::Failure {
            reason: String::from_utf8_lossy(buf.chunk()).to_string(),
        });
    }
    if echoed != transaction_id {
        return Err(TrackerError::ProtocolError {
            message: "udp tracker response transaction id mismatch".to_string(),
        });
    }
    if action != expected_action || response.len() < minimum_len {
        return Err(TrackerError::ProtocolError {
            message: format!("malformed udp tracker response (action {action})"),
        });
    }
    Ok(buf)
}
