//! Hub endpoint configuration.

use serde::Deserialize;
use std::time::Duration;

/// Where the Web Profile hub listens when nothing else is configured.
pub const DEFAULT_HUB_URL: &str = "http://localhost:21012/";

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Settings shared by every call a client makes to one hub.
///
/// Deserializable so applications can embed it in their own config files;
/// missing fields fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Hub XML-RPC endpoint.
    pub endpoint: String,
    /// Timeout for ordinary (non-polling) hub calls, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_HUB_URL.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl HubConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Sets the timeout for ordinary calls.
    ///
    /// Kept at millisecond resolution; anything shorter than 1 ms becomes 1 ms.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.request_timeout_ms = millis.max(1);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
