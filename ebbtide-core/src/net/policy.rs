//! Process-wide connection policy.
//!
//! Holds the networking knobs shared by every torrent: bind/local/proxy
//! addresses, socket buffer sizes, encryption options, the listen socket,
//! per-protocol enable bits consulted by tracker selection, and the peer
//! connection cap. Mutation happens behind [`SharedPolicy`]; the lock is
//! never held across an await point.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, RwLock};

use socket2::{Domain, Protocol, Socket, Type};

use crate::EbbtideError;

/// No peer-wire obfuscation.
pub const ENCRYPTION_NONE: u32 = 0;
/// Accept obfuscated incoming connections.
pub const ENCRYPTION_ALLOW_INCOMING: u32 = 1 << 0;
/// Attempt obfuscation on outgoing connections.
pub const ENCRYPTION_TRY_OUTGOING: u32 = 1 << 1;
/// Refuse plaintext connections entirely.
pub const ENCRYPTION_REQUIRE: u32 = 1 << 2;

/// IP ToS byte requesting bulk-throughput treatment.
pub const IPTOS_THROUGHPUT: u8 = 0x08;

/// Tracker protocols gated by a global enable bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    /// HTTP and HTTPS trackers
    Http,
    /// UDP trackers (BEP 15)
    Udp,
    /// DHT pseudo-trackers
    Dht,
}

/// Weight-returning peer address filter; zero rejects the address.
pub type FilterSlot = Arc<dyn Fn(&SocketAddr) -> u32 + Send + Sync>;

/// Shared handle to the process-wide policy.
pub type SharedPolicy = Arc<RwLock<ConnectionPolicy>>;

/// Process-wide networking policy.
pub struct ConnectionPolicy {
    bind_address: SocketAddrV4,
    local_address: SocketAddrV4,
    proxy_address: SocketAddrV4,

    send_buffer_size: u32,
    receive_buffer_size: u32,
    encryption_options: u32,
    priority: u8,

    listener: Option<Socket>,
    listen_port: u16,
    listen_backlog: i32,

    http_enabled: bool,
    udp_enabled: bool,
    dht_enabled: bool,

    block_ipv4: bool,
    block_ipv6: bool,
    prefer_ipv6: bool,

    max_size: u32,
    size: u32,

    filter: Option<FilterSlot>,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        let unspecified = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        Self {
            bind_address: unspecified,
            local_address: unspecified,
            proxy_address: unspecified,
            send_buffer_size: 0,
            receive_buffer_size: 0,
            encryption_options: ENCRYPTION_NONE,
            priority: IPTOS_THROUGHPUT,
            listener: None,
            listen_port: 0,
            listen_backlog: 128,
            http_enabled: true,
            udp_enabled: true,
            dht_enabled: true,
            block_ipv4: false,
            block_ipv6: false,
            prefer_ipv6: false,
            max_size: 0,
            size: 0,
            filter: None,
        }
    }
}

fn require_ipv4(address: SocketAddr, what: &str) -> Result<SocketAddrV4, EbbtideError> {
    match address {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(_) => Err(EbbtideError::InvalidInput {
            reason: format!("tried to set a {what} that is not an IPv4 address"),
        }),
    }
}

impl ConnectionPolicy {
    /// Creates a policy with library defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps the policy in the shared handle the tracker layer consumes.
    pub fn into_shared(self) -> SharedPolicy {
        Arc::new(RwLock::new(self))
    }

    /// Address outgoing sockets bind to.
    pub fn bind_address(&self) -> SocketAddrV4 {
        self.bind_address
    }

    /// Sets the bind address.
    ///
    /// # Errors
    ///
    /// - `EbbtideError::InvalidInput` - If the address is not IPv4
    pub fn set_bind_address(&mut self, address: SocketAddr) -> Result<(), EbbtideError> {
        self.bind_address = require_ipv4(address, "bind address")?;
        Ok(())
    }

    /// Address reported to trackers as our own.
    pub fn local_address(&self) -> SocketAddrV4 {
        self.local_address
    }

    /// Sets the local address.
    ///
    /// # Errors
    ///
    /// - `EbbtideError::InvalidInput` - If the address is not IPv4
    pub fn set_local_address(&mut self, address: SocketAddr) -> Result<(), EbbtideError> {
        self.local_address = require_ipv4(address, "local address")?;
        Ok(())
    }

    /// Proxy used for outgoing connections, unspecified when none.
    pub fn proxy_address(&self) -> SocketAddrV4 {
        self.proxy_address
    }

    /// Sets the proxy address.
    ///
    /// # Errors
    ///
    /// - `EbbtideError::InvalidInput` - If the address is not IPv4
    pub fn set_proxy_address(&mut self, address: SocketAddr) -> Result<(), EbbtideError> {
        self.proxy_address = require_ipv4(address, "proxy address")?;
        Ok(())
    }

    /// Socket send buffer size, 0 leaves the OS default.
    pub fn send_buffer_size(&self) -> u32 {
        self.send_buffer_size
    }

    /// Sets the socket send buffer size.
    pub fn set_send_buffer_size(&mut self, size: u32) {
        self.send_buffer_size = size;
    }

    /// Socket receive buffer size, 0 leaves the OS default.
    pub fn receive_buffer_size(&self) -> u32 {
        self.receive_buffer_size
    }

    /// Sets the socket receive buffer size.
    pub fn set_receive_buffer_size(&mut self, size: u32) {
        self.receive_buffer_size = size;
    }

    /// Current encryption option bitset.
    pub fn encryption_options(&self) -> u32 {
        self.encryption_options
    }

    /// Sets the encryption option bitset.
    ///
    /// # Errors
    ///
    /// - `EbbtideError::FeatureDisabled` - If built without the `encryption`
    ///   feature
    #[allow(unused_variables)]
    pub fn set_encryption_options(&mut self, options: u32) -> Result<(), EbbtideError> {
        #[cfg(feature = "encryption")]
        {
            self.encryption_options = options;
            Ok(())
        }
        #[cfg(not(feature = "encryption"))]
        {
            Err(EbbtideError::FeatureDisabled {
                feature: "encryption",
            })
        }
    }

    /// IP ToS byte applied to the listen socket.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Sets the IP ToS byte.
    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    /// Port the listen socket is bound to, 0 while closed.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Configured listen backlog.
    pub fn listen_backlog(&self) -> i32 {
        self.listen_backlog
    }

    /// Sets the listen backlog.
    ///
    /// # Errors
    ///
    /// - `EbbtideError::InvalidInput` - If the value is outside [1, 65535)
    ///   or the listen socket is already open
    pub fn set_listen_backlog(&mut self, backlog: i32) -> Result<(), EbbtideError> {
        if !(1..65535).contains(&backlog) {
            return Err(EbbtideError::InvalidInput {
                reason: format!("backlog value {backlog} out of bounds"),
            });
        }
        if self.listener.is_some() {
            return Err(EbbtideError::InvalidInput {
                reason: "backlog value must be set before the listen port is opened".to_string(),
            });
        }
        self.listen_backlog = backlog;
        Ok(())
    }

    /// Whether the listen socket is open.
    pub fn is_listen_open(&self) -> bool {
        self.listener.is_some()
    }

    /// Opens the listen socket on the first free port in `[begin, end]`.
    ///
    /// Binds on the configured bind address, applying the configured buffer
    /// sizes, ToS priority and backlog. Returns whether a port was bound.
    pub fn listen_open(&mut self, begin: u16, end: u16) -> bool {
        for port in begin..=end {
            match self.try_listen(port) {
                Ok(actual_port) => {
                    self.listen_port = actual_port;
                    tracing::info!(port = actual_port, "listen socket open");
                    return true;
                }
                Err(error) => {
                    tracing::debug!(port, %error, "listen bind failed");
                }
            }
        }
        false
    }

    fn try_listen(&mut self, port: u16) -> std::io::Result<u16> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if self.send_buffer_size != 0 {
            socket.set_send_buffer_size(self.send_buffer_size as usize)?;
        }
        if self.receive_buffer_size != 0 {
            socket.set_recv_buffer_size(self.receive_buffer_size as usize)?;
        }
        socket.set_tos(u32::from(self.priority))?;
        socket.set_nonblocking(true)?;
        let address = SocketAddrV4::new(*self.bind_address.ip(), port);
        socket.bind(&SocketAddr::V4(address).into())?;
        socket.listen(self.listen_backlog)?;
        let actual = socket
            .local_addr()?
            .as_socket()
            .map(|sa| sa.port())
            .unwrap_or(port);
        self.listener = Some(socket);
        Ok(actual)
    }

    /// Closes the listen socket.
    pub fn listen_close(&mut self) {
        self.listener = None;
        self.listen_port = 0;
    }

    /// Whether the given tracker protocol is globally enabled.
    pub fn is_protocol_enabled(&self, protocol: ProtocolId) -> bool {
        match protocol {
            ProtocolId::Http => self.http_enabled,
            ProtocolId::Udp => self.udp_enabled,
            ProtocolId::Dht => self.dht_enabled,
        }
    }

    /// Flips the global enable bit for a tracker protocol.
    pub fn set_protocol_enabled(&mut self, protocol: ProtocolId, enabled: bool) {
        match protocol {
            ProtocolId::Http => self.http_enabled = enabled,
            ProtocolId::Udp => self.udp_enabled = enabled,
            ProtocolId::Dht => self.dht_enabled = enabled,
        }
    }

    /// Whether IPv4 peers are blocked.
    pub fn block_ipv4(&self) -> bool {
        self.block_ipv4
    }

    /// Blocks or unblocks IPv4 peers.
    pub fn set_block_ipv4(&mut self, block: bool) {
        self.block_ipv4 = block;
    }

    /// Whether IPv6 peers are blocked.
    pub fn block_ipv6(&self) -> bool {
        self.block_ipv6
    }

    /// Blocks or unblocks IPv6 peers.
    pub fn set_block_ipv6(&mut self, block: bool) {
        self.block_ipv6 = block;
    }

    /// Whether IPv6 endpoints are preferred when both families resolve.
    pub fn prefer_ipv6(&self) -> bool {
        self.prefer_ipv6
    }

    /// Sets the IPv6 preference.
    pub fn set_prefer_ipv6(&mut self, prefer: bool) {
        self.prefer_ipv6 = prefer;
    }

    /// Peer connection cap.
    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Sets the peer connection cap.
    pub fn set_max_size(&mut self, max_size: u32) {
        self.max_size = max_size;
    }

    /// Current peer connection count, maintained by the peer layer.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Updates the peer connection count.
    pub fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    /// Whether another peer connection may be opened.
    pub fn can_connect(&self) -> bool {
        self.size < self.max_size
    }

    /// Installs the peer address filter.
    pub fn set_filter<F>(&mut self, filter: F)
    where
        F: Fn(&SocketAddr) -> u32 + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
    }

    /// Weighs a peer address; zero rejects it. Defaults to allow.
    pub fn filter(&self, address: &SocketAddr) -> u32 {
        match &self.filter {
            Some(filter) => filter(address),
            None => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv6Addr, SocketAddrV6};

    use super::*;

    fn v4(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port))
    }

    fn v6(port: u16) -> SocketAddr {
        SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, port, 0, 0))
    }

    #[test]
    fn test_address_setters_reject_ipv6() {
        let mut policy = ConnectionPolicy::new();

        assert!(policy.set_bind_address(v4(0)).is_ok());
        assert!(policy.set_local_address(v4(6881)).is_ok());
        assert!(policy.set_proxy_address(v4(8080)).is_ok());

        for result in [
            policy.set_bind_address(v6(0)),
            policy.set_local_address(v6(0)),
            policy.set_proxy_address(v6(0)),
        ] {
            match result {
                Err(EbbtideError::InvalidInput { .. }) => {}
                other => panic!("expected InvalidInput, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_backlog_bounds() {
        let mut policy = ConnectionPolicy::new();

        assert!(policy.set_listen_backlog(0).is_err());
        assert!(policy.set_listen_backlog(1).is_ok());
        assert!(policy.set_listen_backlog(65534).is_ok());
        assert!(policy.set_listen_backlog(65535).is_err());
        assert_eq!(policy.listen_backlog(), 65534);
    }

    #[test]
    fn test_backlog_rejected_after_listen_open() {
        let mut policy = ConnectionPolicy::new();
        policy
            .set_bind_address(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)))
            .unwrap();

        assert!(policy.listen_open(0, 0));
        assert_ne!(policy.listen_port(), 0);
        assert!(policy.is_listen_open());
        assert!(policy.set_listen_backlog(64).is_err());

        policy.listen_close();
        assert_eq!(policy.listen_port(), 0);
        assert!(policy.set_listen_backlog(64).is_ok());
    }

    #[test]
    fn test_filter_defaults_to_allow() {
        let mut policy = ConnectionPolicy::new();
        let address = v4(6881);

        assert_eq!(policy.filter(&address), 1);

        policy.set_filter(|addr| if addr.port() == 6881 { 0 } else { 7 });
        assert_eq!(policy.filter(&address), 0);
        assert_eq!(policy.filter(&v4(1)), 7);
    }

    #[test]
    fn test_protocol_enable_bits() {
        let mut policy = ConnectionPolicy::new();

        assert!(policy.is_protocol_enabled(ProtocolId::Udp));
        policy.set_protocol_enabled(ProtocolId::Udp, false);
        assert!(!policy.is_protocol_enabled(ProtocolId::Udp));
        assert!(policy.is_protocol_enabled(ProtocolId::Http));
        assert!(policy.is_protocol_enabled(ProtocolId::Dht));
    }

    #[cfg(feature = "encryption")]
    #[test]
    fn test_encryption_options_accepted() {
        let mut policy = ConnectionPolicy::new();
        policy
            .set_encryption_options(ENCRYPTION_TRY_OUTGOING | ENCRYPTION_ALLOW_INCOMING)
            .unwrap();
        assert_eq!(
            policy.encryption_options(),
            ENCRYPTION_TRY_OUTGOING | ENCRYPTION_ALLOW_INCOMING
        );
    }

    #[cfg(not(feature = "encryption"))]
    #[test]
    fn test_encryption_options_rejected_without_feature() {
        let mut policy = ConnectionPolicy::new();
        assert!(matches!(
            policy.set_encryption_options(ENCRYPTION_REQUIRE),
            Err(EbbtideError::FeatureDisabled { .. })
        ));
    }

    #[test]
    fn test_connection_cap() {
        let mut policy = ConnectionPolicy::new();
        policy.set_max_size(2);

        assert!(policy.can_connect());
        policy.set_size(2);
        assert!(!policy.can_connect());
    }
}
