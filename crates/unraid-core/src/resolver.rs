//! Transport discovery with a per-resolver cache.
//!
//! An Unraid server may speak plain HTTP, HTTPS with a self-signed
//! certificate, or HTTPS through the `myunraid.net` relay, and none of this
//! is known up front. [`ConnectionResolver::discover`] probes the host from
//! cheapest to most expensive strategy and remembers the answer per
//! `(host, http_port, https_port)`.
//!
//! # Resolution Order
//!
//! | Step | Condition | Result |
//! |------|-----------|--------|
//! | 1 | Host is under `myunraid.net` | `strict` at the host, no probe |
//! | 2 | Plain probe redirects to `myunraid.net` | `strict` at the target |
//! | 3 | Plain probe redirects to any `https://` URL | `yes` at the target |
//! | 4 | Plain probe gets any status ≥ 200 | `no` on `http_port` |
//! | 5 | Verified HTTPS probe answers | `strict` on `https_port` |
//! | 6 | Verified probe fails on the certificate, unverified answers | `yes` on `https_port` |
//! | 7 | Nothing answered | `yes` on `https_port` (assumed) |
//!
//! Step 7 is an optimistic guess, not a success signal: an offline server
//! resolves to it and the next query surfaces the real connection error.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use reqwest::Url;
use tracing::{debug, info, warn};

use unraid_types::{
    DEFAULT_HTTP_PORT, DEFAULT_HTTPS_PORT, GRAPHQL_PATH, TransportDiscoveryResult, TransportMode,
    build_url, is_relay_host, normalize_host,
};

use crate::error::{ClassifiedError, Result};
use crate::probe::{HttpProber, PROBE_PATH, TransportProber};

/// Default per-probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Ports and timeout used for discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Plaintext port.
    pub http_port: u16,
    /// Encrypted port.
    pub https_port: u16,
    /// Timeout applied to each probe.
    pub timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl DiscoveryOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the plaintext port.
    #[must_use]
    pub fn http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    /// Set the encrypted port.
    #[must_use]
    pub fn https_port(mut self, port: u16) -> Self {
        self.https_port = port;
        self
    }

    /// Set the probe timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Shared store of discovery results keyed by host, plaintext port and
/// encrypted port.
///
/// Cloning the cache shares the underlying map, so a cache can be injected
/// into several resolvers that should see each other's results. Separate
/// caches never share entries.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryCache {
    entries: Arc<RwLock<HashMap<CacheKey, TransportDiscoveryResult>>>,
}

/// `(host, http_port, https_port)`.
type CacheKey = (String, u16, u16);

impl DiscoveryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(host: &str, options: &DiscoveryOptions) -> CacheKey {
        (host.to_string(), options.http_port, options.https_port)
    }

    /// Cached result for a host and port combination.
    pub fn get(&self, host: &str, options: &DiscoveryOptions) -> Option<TransportDiscoveryResult> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::key(host, options))
            .cloned()
    }

    /// Store a result.
    pub fn insert(&self, host: &str, options: &DiscoveryOptions, result: TransportDiscoveryResult) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Self::key(host, options), result);
    }

    /// Remove every entry for `host`, whatever its ports. Returns the number
    /// of entries removed.
    pub fn invalidate_host(&self, host: &str) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(cached, _, _), _| cached != host);
        before - entries.len()
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of cached results.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves hosts to GraphQL endpoints.
#[derive(Clone)]
pub struct ConnectionResolver {
    prober: Arc<dyn TransportProber>,
    cache: DiscoveryCache,
}

impl std::fmt::Debug for ConnectionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionResolver")
            .field("cache_entries", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionResolver {
    /// Create a resolver with its own empty cache.
    pub fn new(prober: Arc<dyn TransportProber>) -> Self {
        Self::with_cache(prober, DiscoveryCache::new())
    }

    /// Create a resolver backed by an existing cache.
    pub fn with_cache(prober: Arc<dyn TransportProber>, cache: DiscoveryCache) -> Self {
        Self { prober, cache }
    }

    /// Create a resolver that probes over real sockets.
    pub fn http() -> Result<Self> {
        let prober = HttpProber::new().map_err(|e| {
            ClassifiedError::connection(format!("Failed to build HTTP client: {e}"))
        })?;
        Ok(Self::new(Arc::new(prober)))
    }

    /// The resolver's cache.
    pub fn cache(&self) -> &DiscoveryCache {
        &self.cache
    }

    /// Discover how to reach `host`.
    ///
    /// Results are cached; a second call with the same host and ports makes
    /// no network requests. Fails only if the host string is empty or
    /// malformed.
    pub async fn discover(
        &self,
        host: &str,
        options: &DiscoveryOptions,
    ) -> Result<TransportDiscoveryResult> {
        let host = normalize_host(host)
            .map_err(|e| ClassifiedError::validation(e.to_string()).with_detail("host", host))?;

        if let Some(cached) = self.cache.get(&host, options) {
            debug!("Using cached discovery for {}: {}", host, cached.resolved_url);
            return Ok(cached);
        }

        let result = self.resolve(&host, options).await;
        info!(
            "Resolved {} to {} (ssl mode: {})",
            host, result.resolved_url, result.transport_mode
        );
        self.cache.insert(&host, options, result.clone());
        Ok(result)
    }

    /// Forget cached results for one host, or for every host.
    pub fn invalidate(&self, host: Option<&str>) {
        match host {
            Some(host) => {
                let host = normalize_host(host).unwrap_or_else(|_| host.to_string());
                let removed = self.cache.invalidate_host(&host);
                debug!("Invalidated {} discovery entries for {}", removed, host);
            }
            None => {
                self.cache.clear();
                debug!("Cleared discovery cache");
            }
        }
    }

    async fn resolve(&self, host: &str, options: &DiscoveryOptions) -> TransportDiscoveryResult {
        let https_url = build_url("https", host, options.https_port, GRAPHQL_PATH);

        if is_relay_host(host) {
            debug!("{} is a relay host, skipping probes", host);
            return TransportDiscoveryResult::new(
                https_url,
                TransportMode::EncryptedVerified,
                options.https_port,
            );
        }

        let plain = self
            .prober
            .probe_plain(host, options.http_port, PROBE_PATH, options.timeout)
            .await;

        if let Some(target) = plain
            .redirect()
            .and_then(|location| redirect_target(host, options.http_port, location))
        {
            let target_host = target.host_str().unwrap_or_default().to_string();
            if is_relay_host(&target_host) {
                let port = target.port().unwrap_or(DEFAULT_HTTPS_PORT);
                debug!("{} redirects to relay host {}", host, target_host);
                return TransportDiscoveryResult::new(
                    build_url("https", &target_host, port, GRAPHQL_PATH),
                    TransportMode::EncryptedVerified,
                    port,
                );
            }
            if target.scheme() == "https" {
                let port = target.port_or_known_default().unwrap_or(DEFAULT_HTTPS_PORT);
                debug!("{} redirects to HTTPS at {}:{}", host, target_host, port);
                return TransportDiscoveryResult::new(
                    build_url("https", &target_host, port, GRAPHQL_PATH),
                    TransportMode::EncryptedUntrusted,
                    port,
                );
            }
        }

        if plain.status.is_some_and(|status| status >= 200) {
            return TransportDiscoveryResult::new(
                build_url("http", host, options.http_port, GRAPHQL_PATH),
                TransportMode::PlainOnly,
                options.http_port,
            );
        }

        let verified = self
            .prober
            .probe_encrypted(host, options.https_port, PROBE_PATH, options.timeout, true)
            .await;
        if verified.is_response() {
            return TransportDiscoveryResult::new(
                https_url,
                TransportMode::EncryptedVerified,
                options.https_port,
            );
        }

        if verified.is_certificate_error() {
            debug!("{} presents an untrusted certificate, retrying without verification", host);
            let unverified = self
                .prober
                .probe_encrypted(host, options.https_port, PROBE_PATH, options.timeout, false)
                .await;
            if unverified.is_response() {
                return TransportDiscoveryResult::new(
                    https_url,
                    TransportMode::EncryptedUntrusted,
                    options.https_port,
                );
            }
        }

        warn!(
            "No transport answered for {} (plain: {:?}, tls: {:?}); assuming self-signed HTTPS",
            host, plain.error, verified.error
        );
        TransportDiscoveryResult::new(
            https_url,
            TransportMode::EncryptedUntrusted,
            options.https_port,
        )
    }
}

/// Resolve a `Location` header against the probed URL.
fn redirect_target(host: &str, http_port: u16, location: &str) -> Option<Url> {
    let base = Url::parse(&build_url("http", host, http_port, PROBE_PATH)).ok()?;
    let target = base.join(location).ok()?;
    target.host_str()?;
    Some(target)
}
