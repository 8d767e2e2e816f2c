//! GraphQL request and response envelope types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Typed GraphQL operation definition.
///
/// Implement this for documents known at compile time; the executor decodes
/// the `data` payload straight into [`GraphqlOperation::ResponseData`].
pub trait GraphqlOperation {
    /// Variables type.
    type Variables: Serialize + Send + Sync;
    /// Response data type.
    type ResponseData: DeserializeOwned + Send;

    /// GraphQL document.
    const QUERY: &'static str;
    /// Operation name sent alongside the document.
    const OPERATION_NAME: &'static str;
}

/// GraphQL request payload.
#[derive(Debug, Clone, Serialize)]
pub struct GraphqlRequest<V> {
    /// Query document.
    pub query: String,
    /// Variables.
    pub variables: V,
    /// Optional operation name.
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl<V> GraphqlRequest<V> {
    /// Create a new request.
    pub fn new(query: impl Into<String>, variables: V) -> Self {
        Self {
            query: query.into(),
            variables,
            operation_name: None,
        }
    }

    /// Attach an operation name.
    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

impl<V: Serialize> GraphqlRequest<V> {
    /// Build the request for a typed operation.
    pub fn for_operation<O>(variables: V) -> Self
    where
        O: GraphqlOperation<Variables = V>,
    {
        Self::new(O::QUERY, variables).with_operation_name(O::OPERATION_NAME)
    }
}

/// Location of a GraphQL error within the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphqlErrorLocation {
    /// Line number (1-based).
    pub line: u32,
    /// Column number (1-based).
    pub column: u32,
}

/// GraphQL path segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GraphqlPathSegment {
    /// Field name.
    Key(String),
    /// List index.
    Index(i64),
}

/// One entry of a response's `errors` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphqlError {
    /// Human-readable message.
    pub message: String,
    /// Location(s) within the document.
    #[serde(default)]
    pub locations: Vec<GraphqlErrorLocation>,
    /// Path within the response where the error occurred.
    #[serde(default)]
    pub path: Vec<GraphqlPathSegment>,
    /// Server-specific metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphqlError {
    /// Machine-readable error code from `extensions.code`, if any.
    pub fn code(&self) -> Option<&str> {
        self.extensions.as_ref()?.get("code")?.as_str()
    }
}

/// Response envelope. `data` is kept as raw JSON until the payload stage.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphqlEnvelope {
    /// Response data.
    #[serde(default)]
    pub data: Option<serde_json::Map<String, Value>>,
    /// Protocol-level errors.
    #[serde(default)]
    pub errors: Option<Vec<GraphqlError>>,
    /// Extensions payload.
    #[serde(default)]
    pub extensions: Option<Value>,
}

impl GraphqlEnvelope {
    /// Errors reported by the server, empty if none.
    pub fn errors(&self) -> &[GraphqlError] {
        self.errors.as_deref().unwrap_or_default()
    }
}
