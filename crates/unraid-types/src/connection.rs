//! Caller-owned connection parameters.

use core::fmt;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::transport::{
    DEFAULT_HTTP_PORT, DEFAULT_HTTPS_PORT, TransportDiscoveryResult, TransportMode,
};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// API key sent with every GraphQL request.
///
/// The `Debug` implementation never prints the key.
#[derive(Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a raw key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key, for building request headers.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether no key was supplied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("ApiKey(<empty>)")
        } else {
            f.write_str("ApiKey(<redacted>)")
        }
    }
}

impl From<&str> for ApiKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ApiKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Connection parameters for one server.
///
/// `transport_mode` and `resolved_url` are derived from `host` and the two
/// ports. The setters clear them together so a stale endpoint is never used
/// after the user edits the connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConnectionConfig {
    host: String,
    credential: ApiKey,
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    timeout: Duration,
    transport_mode: TransportMode,
    resolved_url: Option<String>,
    http_port: u16,
    https_port: u16,
}

impl ConnectionConfig {
    /// Create an unresolved config with default ports and timeout.
    pub fn new(host: impl Into<String>, credential: impl Into<ApiKey>) -> Self {
        Self {
            host: host.into(),
            credential: credential.into(),
            timeout: DEFAULT_TIMEOUT,
            transport_mode: TransportMode::Unknown,
            resolved_url: None,
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
        }
    }

    /// Set custom ports.
    #[must_use]
    pub fn with_ports(mut self, http_port: u16, https_port: u16) -> Self {
        self.set_ports(http_port, https_port);
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attach a previously discovered endpoint.
    #[must_use]
    pub fn with_discovery(mut self, discovery: &TransportDiscoveryResult) -> Self {
        self.apply_discovery(discovery);
        self
    }

    /// Server host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// API key.
    pub fn credential(&self) -> &ApiKey {
        &self.credential
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Cached transport mode.
    pub fn transport_mode(&self) -> TransportMode {
        self.transport_mode
    }

    /// Cached endpoint URL, if discovery has been applied.
    pub fn resolved_url(&self) -> Option<&str> {
        self.resolved_url.as_deref()
    }

    /// Plaintext port.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Encrypted port.
    pub fn https_port(&self) -> u16 {
        self.https_port
    }

    /// Whether a resolved endpoint is attached.
    pub fn is_resolved(&self) -> bool {
        self.resolved_url.is_some()
    }

    /// Change the host. Clears the cached endpoint if the host changed.
    pub fn set_host(&mut self, host: impl Into<String>) {
        let host = host.into();
        if host != self.host {
            self.host = host;
            self.clear_resolution();
        }
    }

    /// Change the ports. Clears the cached endpoint if either port changed.
    pub fn set_ports(&mut self, http_port: u16, https_port: u16) {
        if http_port != self.http_port || https_port != self.https_port {
            self.http_port = http_port;
            self.https_port = https_port;
            self.clear_resolution();
        }
    }

    /// Replace the credential. The endpoint stays valid.
    pub fn set_credential(&mut self, credential: impl Into<ApiKey>) {
        self.credential = credential.into();
    }

    /// Store a discovery result as the cached endpoint.
    pub fn apply_discovery(&mut self, discovery: &TransportDiscoveryResult) {
        self.transport_mode = discovery.transport_mode;
        self.resolved_url = Some(discovery.resolved_url.clone());
    }

    /// Forget the cached endpoint so the next request re-discovers it.
    pub fn clear_resolution(&mut self) {
        self.transport_mode = TransportMode::Unknown;
        self.resolved_url = None;
    }
}

#[cfg(feature = "serde")]
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
