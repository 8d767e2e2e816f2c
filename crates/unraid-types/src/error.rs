//! Error types for unraid-types.

use thiserror::Error;

/// Errors produced while interpreting user-supplied connection parameters.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum HostError {
    /// The host string was empty after normalisation.
    #[error("Host is empty")]
    Empty,

    /// The host string contains characters that cannot appear in a hostname.
    #[error("Invalid host '{0}'")]
    Invalid(String),
}

/// Result type alias using unraid-types' HostError type.
pub type HostResult<T> = std::result::Result<T, HostError>;
