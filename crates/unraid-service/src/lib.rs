//! Background poller for Unraid's GraphQL API.
//!
//! This crate provides a service that:
//! - Discovers how to reach the configured server once at startup
//! - Polls each configured GraphQL query on its own schedule with backoff
//! - Keeps the latest payload per query
//! - Publishes every result on a broadcast channel
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/unraid/service.toml`:
//!
//! ```toml
//! [server]
//! host = "tower.local"
//! api_key = "your-api-key"
//! # http_port = 80
//! # https_port = 443
//! # timeout_secs = 10
//!
//! [defaults]
//! base_interval_ms = 5000
//! max_interval_ms = 60000
//!
//! [[jobs]]
//! id = "array"
//! query = "{ array { state capacity { disks { free used total } } } }"
//!
//! [[jobs]]
//! id = "container"
//! query = "query Container($id: PrefixedID!) { docker { container(id: $id) { state } } }"
//! variables = { id = "abc123" }
//! poll = { base_interval_ms = 30000, max_retries = 3 }
//! ```

pub mod config;
pub mod poller;
pub mod state;

pub use config::{
    Config, ConfigError, JobConfig, PollOverrides, PollSettings, ServerConfig, ValidationError,
};
pub use poller::{Poller, PollerError};
pub use state::{LatestData, PollerState, QueryEvent, QueryOutcome};
