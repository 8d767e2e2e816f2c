//! Connectivity, query and polling engine for Unraid's GraphQL API.
//!
//! This crate works out how to reach an Unraid server, runs GraphQL
//! operations against it, and keeps recurring queries going with backoff.
//!
//! # Features
//!
//! - **Transport discovery**: Plain HTTP, self-signed HTTPS or the
//!   `myunraid.net` relay, detected by probing and cached per host
//! - **Query execution**: Typed decoding of `data`, redirect following and a
//!   fixed error taxonomy for every failure
//! - **Polling**: Independent jobs with exponential backoff that stop
//!   themselves after repeated failures
//!
//! # Components
//!
//! | Type | Role |
//! |------|------|
//! | [`TransportProber`] | Single best-effort GET over plain or encrypted transport |
//! | [`ConnectionResolver`] | Ordered probing strategy plus discovery cache |
//! | [`QueryExecutor`] | POST a document, classify failures, decode the payload |
//! | [`PollScheduler`] | Timers, backoff and per-job bookkeeping |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use serde::Deserialize;
//! use unraid_core::{ConnectionResolver, QueryExecutor};
//! use unraid_types::ConnectionConfig;
//!
//! #[derive(Deserialize)]
//! struct Info {
//!     info: Os,
//! }
//!
//! #[derive(Deserialize)]
//! struct Os {
//!     os: Hostname,
//! }
//!
//! #[derive(Deserialize)]
//! struct Hostname {
//!     hostname: String,
//! }
//!
//! # async fn example() -> Result<(), unraid_core::ClassifiedError> {
//! let resolver = Arc::new(ConnectionResolver::http()?);
//! let executor = QueryExecutor::new(resolver)?;
//!
//! let mut config = ConnectionConfig::new("tower.local", "my-api-key");
//! executor.resolve(&mut config).await?;
//!
//! let info: Info = executor
//!     .execute(&config, "{ info { os { hostname } } }", serde_json::json!({}))
//!     .await?;
//! println!("Connected to {}", info.info.os.hostname);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod executor;
pub mod graphql;
pub mod probe;
pub mod resolver;
pub mod scheduler;

// Shared data model
pub use unraid_types::{
    ApiKey, ConnectionConfig, TransportDiscoveryResult, TransportMode, is_relay_host,
    normalize_host,
};

pub use error::{ClassifiedError, ErrorKind, Result};
pub use executor::{API_KEY_HEADER, MAX_REDIRECTS, QueryExecutor};
pub use graphql::{
    GraphqlEnvelope, GraphqlError, GraphqlErrorLocation, GraphqlOperation, GraphqlPathSegment,
    GraphqlRequest,
};
pub use probe::{HttpProber, PROBE_PATH, ProbeError, ProbeOutcome, TransportProber};
pub use resolver::{ConnectionResolver, DEFAULT_PROBE_TIMEOUT, DiscoveryCache, DiscoveryOptions};
pub use scheduler::{JobSnapshot, PollConfig, PollScheduler, SchedulerError};
