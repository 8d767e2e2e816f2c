//! Error taxonomy for unraid-core.
//!
//! Every failure observed while talking to a server is normalised into a
//! single [`ClassifiedError`] at the point where it is first seen. The
//! [`ErrorKind`] is stable regardless of whether the cause was a socket
//! error, an HTTP status, a malformed body or a GraphQL `errors` entry.
//!
//! # Retry Guidance
//!
//! | Kind | Retryable | Typical cause |
//! |------|-----------|---------------|
//! | [`ErrorKind::Connection`] | yes | Refused, unresolved host, too many redirects |
//! | [`ErrorKind::Timeout`] | yes | Request exceeded its timeout, HTTP 504 |
//! | [`ErrorKind::RateLimited`] | yes | HTTP 429 |
//! | [`ErrorKind::ServerFault`] | yes | HTTP 500/502/503, `data: null` without errors |
//! | [`ErrorKind::Authentication`] | no | HTTP 401/403, rejected API key |
//! | [`ErrorKind::NotFound`] | no | HTTP 404, unknown resource |
//! | [`ErrorKind::Validation`] | no | Malformed body, envelope or payload mismatch |
//! | [`ErrorKind::OperationFailed`] | no | GraphQL error with no recognisable category |
//! | [`ErrorKind::Unknown`] | no | Any other HTTP status |
//!
//! Errors reported inside a GraphQL `errors` list are always marked
//! non-retryable regardless of kind. The flag is advisory: the
//! [`PollScheduler`](crate::PollScheduler) backs off uniformly.

use core::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::graphql::GraphqlError;

/// Maximum number of body bytes kept in error details.
pub(crate) const MAX_BODY_SNIPPET: usize = 512;

/// Fixed error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The server could not be reached.
    Connection,
    /// Credentials were rejected.
    Authentication,
    /// The request timed out.
    Timeout,
    /// Request or response did not have the expected structure.
    Validation,
    /// The requested resource does not exist.
    NotFound,
    /// The server processed the request but reported a failure.
    OperationFailed,
    /// Too many requests.
    RateLimited,
    /// The server failed internally.
    ServerFault,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Default retryable flag for this kind.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::RateLimited | Self::ServerFault
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connection => "Connection error",
            Self::Authentication => "Authentication failed",
            Self::Timeout => "Timed out",
            Self::Validation => "Validation error",
            Self::NotFound => "Not found",
            Self::OperationFailed => "Operation failed",
            Self::RateLimited => "Rate limited",
            Self::ServerFault => "Server error",
            Self::Unknown => "Unknown error",
        };
        f.write_str(label)
    }
}

/// A failure normalised into the fixed [`ErrorKind`] taxonomy.
///
/// Built once where the raw failure is observed and then only moved, cloned
/// or inspected.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    kind: ErrorKind,
    message: String,
    retryable: bool,
    details: Map<String, Value>,
}

impl ClassifiedError {
    /// Create an error whose retryable flag follows its kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
            details: Map::new(),
        }
    }

    /// Connection failure.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    /// Timeout.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Attach a diagnostic detail.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Override the retryable flag.
    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Error category.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Diagnostic details.
    pub fn details(&self) -> &Map<String, Value> {
        &self.details
    }

    /// Classify a non-2xx HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let (kind, message) = match status {
            401 | 403 => (
                ErrorKind::Authentication,
                "Invalid API key or insufficient permissions".to_string(),
            ),
            404 => (
                ErrorKind::NotFound,
                "GraphQL endpoint not found".to_string(),
            ),
            429 => (ErrorKind::RateLimited, "Too many requests".to_string()),
            500 | 502 | 503 => (ErrorKind::ServerFault, format!("Server returned HTTP {status}")),
            504 => (ErrorKind::Timeout, "Gateway timed out".to_string()),
            _ => (ErrorKind::Unknown, format!("Unexpected HTTP status {status}")),
        };
        Self::new(kind, message)
            .with_detail("status", status)
            .with_detail("body", truncate_body(body))
    }

    /// Classify the GraphQL `errors` list of a response by its first entry.
    ///
    /// The machine-readable `extensions.code` wins over the message text.
    pub fn from_graphql_errors(errors: &[GraphqlError]) -> Self {
        let Some(first) = errors.first() else {
            return Self::new(ErrorKind::OperationFailed, "GraphQL request failed")
                .with_retryable(false);
        };

        let kind = first
            .code()
            .and_then(kind_from_code)
            .or_else(|| kind_from_message(&first.message))
            .unwrap_or(ErrorKind::OperationFailed);

        let message = if errors.len() > 1 {
            format!("{} (and {} more)", first.message, errors.len() - 1)
        } else {
            first.message.clone()
        };

        let error = Self::new(kind, message).with_retryable(false);
        match serde_json::to_value(errors) {
            Ok(list) => error.with_detail("errors", list),
            Err(_) => error,
        }
    }

    /// Classify a transport-level failure by inspecting its message chain.
    pub fn from_transport(err: &(dyn std::error::Error + 'static), host: &str) -> Self {
        let text = error_chain_text(err);
        let lower = text.to_lowercase();

        let error = if lower.contains("timed out") || lower.contains("timeout") {
            Self::timeout(format!("Request to {host} timed out"))
        } else if lower.contains("connection refused") {
            Self::connection(format!(
                "Connection refused by {host}; check that the server is running and the port is correct"
            ))
        } else if is_dns_failure(&lower) {
            Self::connection(format!("Could not resolve host {host}"))
        } else {
            Self::connection(format!("Failed to connect to {host}"))
        };
        error.with_detail("cause", text)
    }
}

impl From<reqwest::Error> for ClassifiedError {
    fn from(err: reqwest::Error) -> Self {
        let host = err
            .url()
            .and_then(|url| url.host_str())
            .unwrap_or("server")
            .to_string();
        if err.is_timeout() {
            return Self::timeout(format!("Request to {host} timed out"))
                .with_detail("cause", error_chain_text(&err));
        }
        Self::from_transport(&err, &host)
    }
}

/// Result type alias using [`ClassifiedError`].
pub type Result<T> = std::result::Result<T, ClassifiedError>;

fn kind_from_code(code: &str) -> Option<ErrorKind> {
    match code.to_ascii_uppercase().as_str() {
        "UNAUTHENTICATED" | "UNAUTHORIZED" | "FORBIDDEN" => Some(ErrorKind::Authentication),
        "NOT_FOUND" => Some(ErrorKind::NotFound),
        "INTERNAL_SERVER_ERROR" | "INTERNAL_ERROR" => Some(ErrorKind::ServerFault),
        "BAD_USER_INPUT" | "BAD_REQUEST" | "GRAPHQL_VALIDATION_FAILED" | "GRAPHQL_PARSE_FAILED" => {
            Some(ErrorKind::Validation)
        }
        _ => None,
    }
}

fn kind_from_message(message: &str) -> Option<ErrorKind> {
    let lower = message.to_lowercase();
    let any = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if any(&[
        "unauthorized",
        "unauthenticated",
        "forbidden",
        "permission denied",
        "not authorized",
        "api key",
    ]) {
        Some(ErrorKind::Authentication)
    } else if any(&["not found", "does not exist"]) {
        Some(ErrorKind::NotFound)
    } else if any(&["internal server error", "internal error"]) {
        Some(ErrorKind::ServerFault)
    } else if any(&["invalid", "bad input", "validation", "cannot query field"]) {
        Some(ErrorKind::Validation)
    } else {
        None
    }
}

fn is_dns_failure(lower: &str) -> bool {
    [
        "could not resolve",
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "no such host",
        "nodename nor servname",
        "temporary failure in name resolution",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

/// Join an error and all of its sources into one string.
///
/// reqwest hides the interesting part (refused, DNS, certificate) in the
/// source chain, so matching has to look at every level.
pub(crate) fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}

/// Truncate a response body for diagnostics.
pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_BODY_SNIPPET {
        return body.to_string();
    }
    let mut end = MAX_BODY_SNIPPET;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
