//! Raw transport probes.
//!
//! A probe is a single best-effort GET that reports what happened instead of
//! failing: the status and `Location` header if the server answered, or a
//! tagged [`ProbeError`] if it did not. The
//! [`ConnectionResolver`](crate::ConnectionResolver) chains probes to work out
//! how a server is configured.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use thiserror::Error;
use tracing::debug;

use unraid_types::build_url;

use crate::error::error_chain_text;

/// Path requested by probes. Reverse proxies redirect on the site root.
pub const PROBE_PATH: &str = "/";

/// Why a probe did not get a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProbeError {
    /// Nothing is listening on the port.
    #[error("connection refused")]
    Refused,
    /// The host name did not resolve.
    #[error("host could not be resolved")]
    Unresolved,
    /// No response within the probe timeout.
    #[error("probe timed out")]
    Timeout,
    /// TLS failed because the certificate is not trusted.
    #[error("certificate not trusted: {0}")]
    Certificate(String),
    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProbeOutcome {
    /// HTTP status, if the server answered.
    pub status: Option<u16>,
    /// `Location` header of a redirect response.
    pub redirect_location: Option<String>,
    /// Transport failure, if the server did not answer.
    pub error: Option<ProbeError>,
}

impl ProbeOutcome {
    /// The server answered with `status`.
    pub fn responded(status: u16, redirect_location: Option<String>) -> Self {
        Self {
            status: Some(status),
            redirect_location,
            error: None,
        }
    }

    /// The probe failed before any response.
    pub fn failed(error: ProbeError) -> Self {
        Self {
            status: None,
            redirect_location: None,
            error: Some(error),
        }
    }

    /// Whether any HTTP response was received.
    pub fn is_response(&self) -> bool {
        self.status.is_some()
    }

    /// The redirect target when the response is a 301/302/307/308 with a
    /// `Location` header.
    pub fn redirect(&self) -> Option<&str> {
        match self.status {
            Some(301 | 302 | 307 | 308) => self.redirect_location.as_deref(),
            _ => None,
        }
    }

    /// Whether the failure was a certificate-trust problem.
    pub fn is_certificate_error(&self) -> bool {
        matches!(self.error, Some(ProbeError::Certificate(_)))
    }
}

/// Issues probe requests.
///
/// Implementations must never hang past `timeout` and must report socket
/// failures through [`ProbeOutcome::error`] rather than panicking.
#[async_trait]
pub trait TransportProber: Send + Sync {
    /// Plain HTTP GET of `path` on `host:port`.
    async fn probe_plain(&self, host: &str, port: u16, path: &str, timeout: Duration)
    -> ProbeOutcome;

    /// HTTPS GET of `path` on `host:port`, optionally skipping certificate
    /// verification.
    async fn probe_encrypted(
        &self,
        host: &str,
        port: u16,
        path: &str,
        timeout: Duration,
        verify_certificate: bool,
    ) -> ProbeOutcome;
}

/// Probes over real sockets using reqwest.
///
/// Redirects are never followed so the raw 3xx and its `Location` are
/// visible to the resolver.
#[derive(Debug, Clone)]
pub struct HttpProber {
    verifying: Client,
    permissive: Client,
}

impl HttpProber {
    /// Build the prober's HTTP clients.
    pub fn new() -> reqwest::Result<Self> {
        let verifying = Client::builder().redirect(Policy::none()).build()?;
        let permissive = Client::builder()
            .redirect(Policy::none())
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            verifying,
            permissive,
        })
    }

    async fn get(&self, client: &Client, url: String, timeout: Duration) -> ProbeOutcome {
        debug!("Probing {}", url);
        let request = client.get(&url).timeout(timeout).send();

        // reqwest's timeout does not cover every phase of connection setup;
        // the outer guard makes the bound unconditional.
        let response = match tokio::time::timeout(timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                let error = classify_probe_error(&err);
                debug!("Probe of {} failed: {}", url, error);
                return ProbeOutcome::failed(error);
            }
            Err(_) => {
                debug!("Probe of {} timed out after {:?}", url, timeout);
                return ProbeOutcome::failed(ProbeError::Timeout);
            }
        };

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(String::from);
        debug!("Probe of {} answered {} (location: {:?})", url, status, location);
        ProbeOutcome::responded(status, location)
    }
}

#[async_trait]
impl TransportProber for HttpProber {
    async fn probe_plain(
        &self,
        host: &str,
        port: u16,
        path: &str,
        timeout: Duration,
    ) -> ProbeOutcome {
        let url = build_url("http", host, port, path);
        self.get(&self.verifying, url, timeout).await
    }

    async fn probe_encrypted(
        &self,
        host: &str,
        port: u16,
        path: &str,
        timeout: Duration,
        verify_certificate: bool,
    ) -> ProbeOutcome {
        let url = build_url("https", host, port, path);
        let client = if verify_certificate {
            &self.verifying
        } else {
            &self.permissive
        };
        self.get(client, url, timeout).await
    }
}

/// Map a reqwest failure to a probe error.
///
/// TLS stacks expose certificate problems only as text, so the source chain
/// is pattern-matched.
fn classify_probe_error(err: &reqwest::Error) -> ProbeError {
    if err.is_timeout() {
        return ProbeError::Timeout;
    }
    let text = error_chain_text(err);
    let lower = text.to_lowercase();

    if is_certificate_failure(&lower) {
        ProbeError::Certificate(text)
    } else if lower.contains("connection refused") {
        ProbeError::Refused
    } else if lower.contains("dns error")
        || lower.contains("failed to lookup address")
        || lower.contains("could not resolve")
        || lower.contains("name or service not known")
    {
        ProbeError::Unresolved
    } else if lower.contains("timed out") {
        ProbeError::Timeout
    } else {
        ProbeError::Other(text)
    }
}

/// Whether an error message describes a certificate-trust failure.
pub fn is_certificate_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    [
        "certificate",
        "self signed",
        "self-signed",
        "unknownissuer",
        "unknown issuer",
        "unable to get local issuer",
        "unable to verify",
        "cert_has_expired",
        "expired",
    ]
    .iter()
    .any(|pattern| lower.contains(pattern))
}
