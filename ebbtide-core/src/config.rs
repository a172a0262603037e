//! Centralized configuration for Ebbtide.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

/// Central configuration for all Ebbtide components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct EbbtideConfig {
    /// Network and transport settings
    pub network: NetworkConfig,
    /// Tracker scheduling settings
    pub tracker: TrackerConfig,
}

/// Network communication configuration.
///
/// Controls transport timeouts and identification for tracker requests.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// Per-exchange timeout for UDP tracker packets
    pub udp_timeout: Duration,
    /// Number of send attempts per UDP exchange before giving up
    pub udp_retries: u32,
    /// Timeout for a single DNS query against a custom server
    pub dns_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tracker_timeout: Duration::from_secs(30),
            udp_timeout: Duration::from_secs(15),
            udp_retries: 3,
            dns_timeout: Duration::from_secs(5),
            user_agent: "ebbtide/0.1.0",
        }
    }
}

/// Tracker scheduling configuration.
///
/// Announce pacing defaults; a tracker response overrides the intervals
/// per tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Default seconds between regular announces
    pub normal_interval: u32,
    /// Default minimum seconds between announces
    pub min_interval: u32,
    /// Number of peers requested per announce (-1 = tracker default)
    pub numwant: i32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            normal_interval: 1800, // 30 minutes
            min_interval: 600,     // 10 minutes
            numwant: -1,
        }
    }
}

impl EbbtideConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("EBBTIDE_TRACKER_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.network.tracker_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(timeout) = std::env::var("EBBTIDE_UDP_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.network.udp_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(numwant) = std::env::var("EBBTIDE_NUMWANT") {
            if let Ok(count) = numwant.parse::<i32>() {
                config.tracker.numwant = count;
            }
        }

        config
    }

    /// Creates a configuration with short timeouts suitable for tests.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.network.tracker_timeout = Duration::from_secs(2);
        config.network.udp_timeout = Duration::from_millis(200);
        config.network.udp_retries = 1;
        config.network.dns_timeout = Duration::from_millis(200);
        config
    }
}
