//! HTTP client configuration module
//!
//! Centralized timeout configuration for the outbound provider calls.
//! Every network call carries its own timeout; there is no cooperative
//! cancellation into an already-dispatched request, so these boundaries
//! are the only thing keeping a stuck provider from stalling a worker.

use reqwest::{Client, ClientBuilder};
use std::time::Duration;

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Total request timeout
    pub request_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Config for event CRUD and listing against provider APIs.
    pub fn calendar_api() -> Self {
        Self::default()
    }

    /// Config for calendar discovery (PROPFIND / calendarList). Kept
    /// shorter than event calls: discovery runs inline during connect
    /// flows where the user is waiting.
    pub fn discovery() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
        }
    }

    /// Config for OAuth token endpoints. Token refresh happens under the
    /// coordinator lock, so it should fail fast rather than pin the lock.
    pub fn oauth() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(20),
        }
    }

    /// Build a reqwest client with this configuration
    pub fn build_client(&self) -> Result<Client, reqwest::Error> {
        ClientBuilder::new()
            .user_agent("calbridge/0.1")
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(2)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let config = HttpConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_discovery_is_shorter_than_calendar_api() {
        assert!(HttpConfig::discovery().request_timeout < HttpConfig::calendar_api().request_timeout);
    }

    #[test]
    fn test_build_client() {
        assert!(HttpConfig::default().build_client().is_ok());
    }
}
