//! Platform-agnostic types for Unraid GraphQL clients.
//!
//! This crate holds the data model shared by the connectivity engine
//! (unraid-core) and its callers: connection parameters, transport modes and
//! discovery results, plus a few helpers for hosts and URLs.
//!
//! # Example
//!
//! ```
//! use unraid_types::{ConnectionConfig, TransportDiscoveryResult, TransportMode};
//!
//! let discovery = TransportDiscoveryResult::new(
//!     "https://tower.local/graphql",
//!     TransportMode::EncryptedUntrusted,
//!     443,
//! );
//! let config = ConnectionConfig::new("tower.local", "api-key").with_discovery(&discovery);
//! assert_eq!(config.resolved_url(), Some("https://tower.local/graphql"));
//! ```

pub mod connection;
pub mod error;
pub mod transport;

pub use connection::{ApiKey, ConnectionConfig, DEFAULT_TIMEOUT};
pub use error::{HostError, HostResult};
pub use transport::{
    DEFAULT_HTTP_PORT, DEFAULT_HTTPS_PORT, GRAPHQL_PATH, RELAY_DOMAIN, TransportDiscoveryResult,
    TransportMode, build_url, is_relay_host, normalize_host,
};
