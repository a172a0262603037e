//! Caching hostname resolution shared by the whole process.
//!
//! Two strategies sit behind one cache: the platform resolver (a blocking
//! name-service query moved off the async runtime) and, when a DNS server
//! override is configured, a hand-rolled recursive A-record query against
//! that server. Results are cached per (host, family, socket type) with no
//! TTL; the cache empties only on [`AddressResolver::cache_clear`].

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time;

use crate::EbbtideError;
use crate::config::NetworkConfig;

/// Address family requested from the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// Either family; the first answer wins
    Any,
    /// IPv4 only
    V4,
    /// IPv6 only
    V6,
}

/// Socket type the resolved address will be used with.
///
/// The platform has no per-socket-type answers to give us, so this only
/// partitions the cache, mirroring the name-service query hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    /// TCP
    Stream,
    /// UDP
    Datagram,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResolverKey {
    host: String,
    family: AddressFamily,
    socktype: SocketType,
}

/// A resolution failure carrying the native error code where one exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResolveFailure {
    /// OS or DNS error code; -1 when the platform offered none
    pub code: i32,
    /// Human-readable description
    pub message: String,
}

/// Outcome of one resolution, as stored in the cache.
pub type ResolveOutcome = std::result::Result<SocketAddr, ResolveFailure>;

/// Process-wide caching resolver.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct AddressResolver {
    cache: Mutex<HashMap<ResolverKey, ResolveOutcome>>,
    server: Mutex<Option<SocketAddrV4>>,
    enabled: AtomicBool,
    queries: AtomicU64,
    dns_timeout: Duration,
}

impl AddressResolver {
    /// Creates a resolver using the platform strategy.
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            server: Mutex::new(None),
            enabled: AtomicBool::new(true),
            queries: AtomicU64::new(0),
            dns_timeout: config.dns_timeout,
        }
    }

    /// Enables or disables resolution; disabled resolvers skip every request.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether resolution is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Configures a recursive DNS server override.
    ///
    /// A zero port is rewritten to 53. Only A records are queried under
    /// this strategy; IPv6-only hosts will not resolve.
    ///
    /// # Errors
    ///
    /// - `EbbtideError::InvalidInput` - If the server address is not IPv4
    pub fn set_server(&self, address: SocketAddr) -> Result<(), EbbtideError> {
        let mut v4 = match address {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => {
                return Err(EbbtideError::InvalidInput {
                    reason: "tried to set a custom dns server that is not IPv4".to_string(),
                });
            }
        };
        if v4.port() == 0 {
            v4.set_port(53);
        }
        *self.server.lock().expect("resolver server lock poisoned") = Some(v4);
        Ok(())
    }

    /// Removes the DNS server override, restoring the platform strategy.
    pub fn clear_server(&self) {
        *self.server.lock().expect("resolver server lock poisoned") = None;
    }

    /// The configured DNS server override, if any.
    pub fn server(&self) -> Option<SocketAddrV4> {
        *self.server.lock().expect("resolver server lock poisoned")
    }

    /// Empties the cache.
    pub fn cache_clear(&self) {
        tracing::debug!("clearing resolver cache");
        self.cache.lock().expect("resolver cache lock poisoned").clear();
    }

    /// Number of cached entries.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().expect("resolver cache lock poisoned").len()
    }

    /// Number of queries that actually hit a name server.
    pub fn queries_performed(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Resolves `host` to a socket address with port 0.
    ///
    /// Returns `None` without doing anything when the resolver is disabled.
    /// A cache hit returns the stored outcome without querying. On a miss
    /// the configured strategy runs and the result is inserted
    /// first-writer-wins: a concurrent duplicate observes the winner's
    /// entry, not its own.
    pub async fn resolve(
        &self,
        host: &str,
        family: AddressFamily,
        socktype: SocketType,
    ) -> Option<ResolveOutcome> {
        if !self.is_enabled() {
            tracing::debug!(host, "resolve skipped, resolver disabled");
            return None;
        }

        let key = ResolverKey {
            host: host.to_string(),
            family,
            socktype,
        };

        if let Some(hit) = self
            .cache
            .lock()
            .expect("resolver cache lock poisoned")
            .get(&key)
        {
            tracing::debug!(host, "resolved from cache");
            return Some(hit.clone());
        }

        tracing::debug!(host, "querying name server");
        self.queries.fetch_add(1, Ordering::Relaxed);

        let server = self.server();
        let outcome = match server {
            Some(server) => self.resolve_custom(host, server).await,
            None => resolve_system(host, family).await,
        };
        tracing::debug!(
            host,
            ok = outcome.is_ok(),
            "got name server result"
        );

        let stored = self
            .cache
            .lock()
            .expect("resolver cache lock poisoned")
            .entry(key)
            .or_insert(outcome)
            .clone();
        Some(stored)
    }

    /// Sends one A query to the override server and returns the first answer.
    async fn resolve_custom(&self, host: &str, server: SocketAddrV4) -> ResolveOutcome {
        let id = rand::random::<u16>();
        let query = build_query(id, host)?;

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(io_failure)?;
        socket
            .connect(SocketAddr::V4(server))
            .await
            .map_err(io_failure)?;
        socket.send(&query).await.map_err(io_failure)?;

        let mut response = [0u8; 512];
        let len = match time::timeout(self.dns_timeout, socket.recv(&mut response)).await {
            Ok(Ok(len)) => len,
            Ok(Err(error)) => return Err(io_failure(error)),
            Err(_) => {
                return Err(ResolveFailure {
                    code: -1,
                    message: format!("dns query for {host} timed out"),
                });
            }
        };

        parse_response(id, &response[..len])
    }
}

fn io_failure(error: std::io::Error) -> ResolveFailure {
    ResolveFailure {
        code: error.raw_os_error().unwrap_or(-1),
        message: error.to_string(),
    }
}

/// Platform name-service query.
///
/// The lookup blocks for up to several seconds, so it runs on the blocking
/// thread pool; the async caller is suspended rather than wedging the I/O
/// driver, and other library state may advance across the window.
async fn resolve_system(host: &str, family: AddressFamily) -> ResolveOutcome {
    let host = host.to_string();
    let lookup = tokio::task::spawn_blocking(move || -> ResolveOutcome {
        let addresses = (host.as_str(), 0u16).to_socket_addrs().map_err(io_failure)?;
        let mut fallback = None;
        for address in addresses {
            let matches = match family {
                AddressFamily::Any => true,
                AddressFamily::V4 => address.is_ipv4(),
                AddressFamily::V6 => address.is_ipv6(),
            };
            if matches {
                return Ok(address);
            }
            fallback.get_or_insert(address);
        }
        Err(ResolveFailure {
            code: -1,
            message: format!("{host}: no address of the requested family"),
        })
    })
    .await;

    match lookup {
        Ok(outcome) => outcome,
        Err(error) => Err(ResolveFailure {
            code: -1,
            message: format!("resolver task failed: {error}"),
        }),
    }
}

const DNS_TYPE_A: u16 = 1;
const DNS_CLASS_IN: u16 = 1;
const DNS_FLAG_RD: u16 = 0x0100;

/// Builds a single-question recursive A query.
// TODO: AAAA queries so v6-only trackers resolve under the override path.
fn build_query(id: u16, host: &str) -> std::result::Result<Vec<u8>, ResolveFailure> {
    let mut packet = Vec::with_capacity(12 + host.len() + 6);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&DNS_FLAG_RD.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    packet.extend_from_slice(&[0; 6]); // ancount, nscount, arcount

    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ResolveFailure {
                code: -1,
                message: format!("invalid hostname label in {host}"),
            });
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&DNS_TYPE_A.to_be_bytes());
    packet.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());
    Ok(packet)
}

fn read_u16(buf: &[u8], pos: &mut usize) -> std::result::Result<u16, ResolveFailure> {
    let bytes = buf
        .get(*pos..*pos + 2)
        .ok_or_else(truncated)?;
    *pos += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn truncated() -> ResolveFailure {
    ResolveFailure {
        code: -1,
        message: "truncated dns response".to_string(),
    }
}

/// Skips an encoded domain name, compression pointers included.
fn skip_name(buf: &[u8], pos: &mut usize) -> std::result::Result<(), ResolveFailure> {
    loop {
        let len = *buf.get(*pos).ok_or_else(truncated)?;
        if len & 0xC0 == 0xC0 {
            *pos += 2;
            return Ok(());
        }
        if len == 0 {
            *pos += 1;
            return Ok(());
        }
        *pos += 1 + usize::from(len);
    }
}

/// Parses a response and returns the first A answer.
///
/// # Panics
///
/// Panics when an A record carries an rd length other than 4; that is a
/// protocol violation, not a lookup failure.
fn parse_response(id: u16, buf: &[u8]) -> ResolveOutcome {
    let mut pos = 0;
    let response_id = read_u16(buf, &mut pos)?;
    let flags = read_u16(buf, &mut pos)?;
    if response_id != id || flags & 0x8000 == 0 {
        return Err(ResolveFailure {
            code: -1,
            message: "mismatched dns response".to_string(),
        });
    }
    let rcode = i32::from(flags & 0x000F);
    if rcode != 0 {
        return Err(ResolveFailure {
            code: rcode,
            message: format!("dns server returned rcode {rcode}"),
        });
    }

    let qdcount = read_u16(buf, &mut pos)?;
    let ancount = read_u16(buf, &mut pos)?;
    pos += 4; // nscount, arcount

    for _ in 0..qdcount {
        skip_name(buf, &mut pos)?;
        pos += 4; // qtype, qclass
    }

    for _ in 0..ancount {
        skip_name(buf, &mut pos)?;
        let rtype = read_u16(buf, &mut pos)?;
        let _class = read_u16(buf, &mut pos)?;
        pos += 4; // ttl
        let rdlength = read_u16(buf, &mut pos)?;
        if rtype == DNS_TYPE_A {
            if rdlength != 4 {
                tracing::error!(rdlength, "unexpected rd length in A record");
                panic!("A record with rd length {rdlength}");
            }
            let data = buf.get(pos..pos + 4).ok_or_else(truncated)?;
            let ip = std::net::Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            return Ok(SocketAddr::V4(SocketAddrV4::new(ip, 0)));
        }
        pos += usize::from(rdlength);
    }

    Err(ResolveFailure {
        code: -1,
        message: "no A records in dns response".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv6Addr, SocketAddrV6};

    use super::*;

    fn resolver() -> AddressResolver {
        AddressResolver::new(&NetworkConfig::default())
    }

    #[tokio::test]
    async fn test_resolve_populates_cache() {
        let resolver = resolver();

        let outcome = resolver
            .resolve("127.0.0.1", AddressFamily::Any, SocketType::Stream)
            .await
            .expect("resolver enabled");
        assert_eq!(outcome.unwrap().ip().to_string(), "127.0.0.1");
        assert_eq!(resolver.cache_len(), 1);
        assert_eq!(resolver.queries_performed(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_query() {
        let resolver = resolver();

        let first = resolver
            .resolve("127.0.0.1", AddressFamily::Any, SocketType::Stream)
            .await
            .unwrap();
        let second = resolver
            .resolve("127.0.0.1", AddressFamily::Any, SocketType::Stream)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(resolver.queries_performed(), 1);
        assert_eq!(resolver.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_keys_are_exact() {
        let resolver = resolver();

        resolver
            .resolve("127.0.0.1", AddressFamily::Any, SocketType::Stream)
            .await
            .unwrap()
            .unwrap();
        resolver
            .resolve("127.0.0.1", AddressFamily::Any, SocketType::Datagram)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolver.cache_len(), 2);
        assert_eq!(resolver.queries_performed(), 2);
    }

    #[tokio::test]
    async fn test_family_mismatch_is_cached_failure() {
        let resolver = resolver();

        let outcome = resolver
            .resolve("127.0.0.1", AddressFamily::V6, SocketType::Stream)
            .await
            .unwrap();
        assert!(outcome.is_err());
        // The failure is cached like any other entry.
        assert_eq!(resolver.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_cache_clear() {
        let resolver = resolver();
        resolver
            .resolve("127.0.0.1", AddressFamily::Any, SocketType::Stream)
            .await
            .unwrap()
            .unwrap();

        resolver.cache_clear();
        assert_eq!(resolver.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_disabled_resolver_skips() {
        let resolver = resolver();
        resolver.set_enabled(false);

        let outcome = resolver
            .resolve("127.0.0.1", AddressFamily::Any, SocketType::Stream)
            .await;
        assert!(outcome.is_none());
        assert_eq!(resolver.cache_len(), 0);
    }

    #[test]
    fn test_set_server_rejects_ipv6() {
        let resolver = resolver();
        let v6 = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 53, 0, 0));

        assert!(matches!(
            resolver.set_server(v6),
            Err(crate::EbbtideError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_set_server_rewrites_zero_port() {
        let resolver = resolver();
        let server = SocketAddr::V4(SocketAddrV4::new(std::net::Ipv4Addr::new(1, 1, 1, 1), 0));

        resolver.set_server(server).unwrap();
        assert_eq!(resolver.server().unwrap().port(), 53);
    }

    fn answer_packet(id: u16, rdlength: u16, rdata: &[u8]) -> Vec<u8> {
        let query = build_query(id, "tracker.example").unwrap();
        let mut packet = Vec::new();
        packet.extend_from_slice(&id.to_be_bytes());
        packet.extend_from_slice(&0x8180u16.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        packet.extend_from_slice(&1u16.to_be_bytes()); // ancount
        packet.extend_from_slice(&[0; 4]);
        packet.extend_from_slice(&query[12..]); // echoed question
        packet.extend_from_slice(&[0xC0, 0x0C]); // name pointer to question
        packet.extend_from_slice(&DNS_TYPE_A.to_be_bytes());
        packet.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());
        packet.extend_from_slice(&300u32.to_be_bytes()); // ttl
        packet.extend_from_slice(&rdlength.to_be_bytes());
        packet.extend_from_slice(rdata);
        packet
    }

    #[test]
    fn test_parse_response_first_a_record() {
        let packet = answer_packet(0x1234, 4, &[192, 0, 2, 7]);

        let address = parse_response(0x1234, &packet).unwrap();
        assert_eq!(address.ip().to_string(), "192.0.2.7");
        assert_eq!(address.port(), 0);
    }

    #[test]
    fn test_parse_response_rcode_propagated() {
        let mut packet = answer_packet(0x1234, 4, &[192, 0, 2, 7]);
        packet[3] |= 0x03; // NXDOMAIN

        let failure = parse_response(0x1234, &packet).unwrap_err();
        assert_eq!(failure.code, 3);
    }

    #[test]
    #[should_panic(expected = "rd length")]
    fn test_parse_response_bad_rdlength_is_fatal() {
        let packet = answer_packet(0x1234, 6, &[192, 0, 2, 7, 0, 0]);
        let _ = parse_response(0x1234, &packet);
    }

    #[test]
    fn test_build_query_rejects_long_label() {
        let long = "a".repeat(64);
        assert!(build_query(1, &long).is_err());
    }
}
