//! Transport modes, discovery results and URL helpers.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostResult};

/// Domain of the Unraid remote-access relay. Hosts under it always present a
/// publicly trusted certificate.
pub const RELAY_DOMAIN: &str = "myunraid.net";

/// Path of the GraphQL endpoint on every Unraid server.
pub const GRAPHQL_PATH: &str = "/graphql";

/// Default plaintext port.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default encrypted port.
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Effective TLS posture of a server.
///
/// Serialises to the `ssl_mode` vocabulary used by Unraid itself
/// (`no`, `yes`, `strict`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TransportMode {
    /// Not yet discovered.
    #[default]
    Unknown,
    /// Plain HTTP only.
    #[cfg_attr(feature = "serde", serde(rename = "no"))]
    PlainOnly,
    /// HTTPS with a certificate that cannot be verified (usually self-signed).
    #[cfg_attr(feature = "serde", serde(rename = "yes"))]
    EncryptedUntrusted,
    /// HTTPS with a publicly trusted certificate.
    #[cfg_attr(feature = "serde", serde(rename = "strict"))]
    EncryptedVerified,
}

impl TransportMode {
    /// The Unraid `ssl_mode` string for this mode.
    #[must_use]
    pub const fn as_ssl_mode(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::PlainOnly => "no",
            Self::EncryptedUntrusted => "yes",
            Self::EncryptedVerified => "strict",
        }
    }

    /// Whether requests in this mode travel over TLS.
    #[must_use]
    pub const fn uses_encryption(self) -> bool {
        matches!(self, Self::EncryptedUntrusted | Self::EncryptedVerified)
    }

    /// Whether the server certificate must be verified in this mode.
    #[must_use]
    pub const fn verify_certificate(self) -> bool {
        matches!(self, Self::EncryptedVerified)
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ssl_mode())
    }
}

/// Outcome of transport discovery for one `(host, http_port, https_port)`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransportDiscoveryResult {
    /// Full GraphQL endpoint URL requests should be sent to.
    #[cfg_attr(feature = "serde", serde(rename = "url"))]
    pub resolved_url: String,
    /// Discovered transport mode.
    #[cfg_attr(feature = "serde", serde(rename = "ssl_mode"))]
    pub transport_mode: TransportMode,
    /// Whether certificate verification must be enforced.
    pub verify_certificate: bool,
    /// Whether the endpoint is reached over TLS.
    pub uses_encryption: bool,
    /// Port of the resolved endpoint.
    pub port: u16,
}

impl TransportDiscoveryResult {
    /// Build a result for `mode`, deriving the verification and encryption
    /// flags from the mode itself.
    #[must_use]
    pub fn new(resolved_url: impl Into<String>, transport_mode: TransportMode, port: u16) -> Self {
        Self {
            resolved_url: resolved_url.into(),
            transport_mode,
            verify_certificate: transport_mode.verify_certificate(),
            uses_encryption: transport_mode.uses_encryption(),
            port,
        }
    }
}

/// Check whether `host` is the relay domain or one of its subdomains.
///
/// ```
/// use unraid_types::is_relay_host;
///
/// assert!(is_relay_host("myunraid.net"));
/// assert!(is_relay_host("abc123.myunraid.net"));
/// assert!(!is_relay_host("notmyunraid.net"));
/// assert!(!is_relay_host("tower.local"));
/// ```
#[must_use]
pub fn is_relay_host(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    host == RELAY_DOMAIN
        || host
            .strip_suffix(RELAY_DOMAIN)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Normalise a user-supplied host string.
///
/// Strips surrounding whitespace, any `http://`/`https://` scheme, and any
/// trailing path, then lowercases the result.
///
/// ```
/// use unraid_types::normalize_host;
///
/// assert_eq!(normalize_host(" https://Tower.local/login ").unwrap(), "tower.local");
/// assert!(normalize_host("   ").is_err());
/// ```
pub fn normalize_host(raw: &str) -> HostResult<String> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let without_scheme = if lower.starts_with("https://") {
        &trimmed[8..]
    } else if lower.starts_with("http://") {
        &trimmed[7..]
    } else {
        trimmed
    };

    let host = without_scheme
        .split('/')
        .next()
        .unwrap_or_default()
        .trim_end_matches('.')
        .to_ascii_lowercase();

    if host.is_empty() {
        return Err(HostError::Empty);
    }
    if host.chars().any(|c| c.is_whitespace() || matches!(c, '?' | '#' | '@')) {
        return Err(HostError::Invalid(raw.trim().to_string()));
    }
    // Ports are configured separately; a single colon is `host:port`.
    if host.matches(':').count() == 1 {
        return Err(HostError::Invalid(raw.trim().to_string()));
    }
    // A bracketed literal must be the whole host: `[::1]`, never `[::1]:8443`.
    let bracketed = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .is_some_and(|addr| !addr.is_empty() && !addr.contains(['[', ']'])),
        None => !host.contains(['[', ']']),
    };
    if !bracketed {
        return Err(HostError::Invalid(raw.trim().to_string()));
    }
    Ok(host)
}

/// Build a base URL for `scheme://host[:port]{path}`, omitting the port when
/// it is the scheme's default.
///
/// ```
/// use unraid_types::build_url;
///
/// assert_eq!(build_url("https", "tower", 443, "/graphql"), "https://tower/graphql");
/// assert_eq!(build_url("http", "tower", 8080, "/graphql"), "http://tower:8080/graphql");
/// ```
#[must_use]
pub fn build_url(scheme: &str, host: &str, port: u16, path: &str) -> String {
    let default_port = match scheme {
        "https" => DEFAULT_HTTPS_PORT,
        _ => DEFAULT_HTTP_PORT,
    };
    // Bare IPv6 literals need brackets inside a URL authority.
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    if port == default_port {
        format!("{scheme}://{host}{path}")
    } else {
        format!("{scheme}://{host}:{port}{path}")
    }
}
