//! GraphQL query execution.
//!
//! [`QueryExecutor`] sends one document to a server and returns either the
//! decoded `data` payload or a [`ClassifiedError`]. Nothing is retried here;
//! retries belong to the [`PollScheduler`](crate::PollScheduler).
//!
//! Responses are decoded in two stages. The body is first parsed as JSON and
//! checked against the GraphQL envelope (`data` and/or `errors`), then the
//! `data` object is decoded into the caller's type. Each stage reports its
//! own `stage` detail on failure (`parse`, `envelope`, `payload`).

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Client, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use unraid_types::{ConnectionConfig, TransportMode, is_relay_host};

use crate::error::{ClassifiedError, ErrorKind, Result, truncate_body};
use crate::graphql::{GraphqlEnvelope, GraphqlOperation, GraphqlRequest};
use crate::resolver::{ConnectionResolver, DEFAULT_PROBE_TIMEOUT, DiscoveryOptions};

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Maximum number of redirects followed for one request.
pub const MAX_REDIRECTS: usize = 5;

/// Executes GraphQL operations against Unraid servers.
///
/// Cheap to clone; clones share HTTP connection pools and the resolver.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    resolver: Arc<ConnectionResolver>,
    verified: Client,
    unverified: Client,
}

impl QueryExecutor {
    /// Create an executor that resolves unresolved configs with `resolver`.
    pub fn new(resolver: Arc<ConnectionResolver>) -> Result<Self> {
        let build = |accept_invalid: bool| {
            Client::builder()
                .redirect(Policy::none())
                .danger_accept_invalid_certs(accept_invalid)
                .build()
                .map_err(|e| {
                    ClassifiedError::connection(format!("Failed to build HTTP client: {e}"))
                })
        };
        Ok(Self {
            resolver,
            verified: build(false)?,
            unverified: build(true)?,
        })
    }

    /// The resolver used for self-healing discovery.
    pub fn resolver(&self) -> &Arc<ConnectionResolver> {
        &self.resolver
    }

    /// Run discovery for `config` and store the result in it.
    ///
    /// Calling this is optional: [`execute`](Self::execute) resolves
    /// unresolved configs on its own, but does not write the result back.
    pub async fn resolve(&self, config: &mut ConnectionConfig) -> Result<()> {
        let discovery = self
            .resolver
            .discover(config.host(), &discovery_options(config))
            .await?;
        config.apply_discovery(&discovery);
        Ok(())
    }

    /// Execute `document` with JSON `variables` and decode `data` into `T`.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        config: &ConnectionConfig,
        document: &str,
        variables: Value,
    ) -> Result<T> {
        self.execute_request(config, &GraphqlRequest::new(document, variables))
            .await
    }

    /// Execute a typed operation.
    pub async fn execute_operation<O: GraphqlOperation>(
        &self,
        config: &ConnectionConfig,
        variables: O::Variables,
    ) -> Result<O::ResponseData> {
        self.execute_request(config, &GraphqlRequest::for_operation::<O>(variables))
            .await
    }

    /// Execute a prepared request and decode `data` into `T`.
    pub async fn execute_request<V, T>(
        &self,
        config: &ConnectionConfig,
        request: &GraphqlRequest<V>,
    ) -> Result<T>
    where
        V: Serialize + Sync,
        T: DeserializeOwned,
    {
        if config.host().trim().is_empty() {
            return Err(ClassifiedError::validation("Server host is empty"));
        }

        let (endpoint, mode) = self.endpoint(config).await?;

        let body = serde_json::to_vec(request).map_err(|e| {
            ClassifiedError::validation(format!("Failed to encode request: {e}"))
                .with_detail("stage", "request")
        })?;

        let text = self.post(mode, config, endpoint, body).await?;
        decode_response(&text)
    }

    async fn endpoint(&self, config: &ConnectionConfig) -> Result<(String, TransportMode)> {
        if let Some(url) = config.resolved_url() {
            return Ok((url.to_string(), config.transport_mode()));
        }
        debug!("{} has no resolved endpoint, running discovery", config.host());
        let discovery = self
            .resolver
            .discover(config.host(), &discovery_options(config))
            .await?;
        Ok((discovery.resolved_url, discovery.transport_mode))
    }

    /// POST `body`, following redirects, and return the 2xx response text.
    ///
    /// Certificates are checked from the first hop that lands on a relay
    /// host onwards, whatever the starting mode.
    async fn post(
        &self,
        mode: TransportMode,
        config: &ConnectionConfig,
        endpoint: String,
        body: Vec<u8>,
    ) -> Result<String> {
        let mut url = endpoint;
        let mut hops = 0;
        let mut verify = mode.verify_certificate();

        loop {
            verify = verify || is_relay_url(&url);
            let client = if verify { &self.verified } else { &self.unverified };
            debug!("POST {} (verify certificate: {})", url, verify);
            let response = client
                .post(&url)
                .header(API_KEY_HEADER, config.credential().expose())
                .header(CONTENT_TYPE, "application/json")
                .timeout(config.timeout())
                .body(body.clone())
                .send()
                .await?;

            let status = response.status();
            if is_followed_redirect(status.as_u16())
                && let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
            {
                hops += 1;
                if hops > MAX_REDIRECTS {
                    warn!("Giving up on {} after {} redirects", config.host(), MAX_REDIRECTS);
                    return Err(ClassifiedError::connection(format!(
                        "Too many redirects (more than {MAX_REDIRECTS})"
                    ))
                    .with_detail("last_location", location));
                }
                url = join_location(&url, location)?;
                debug!("Following redirect {} to {}", hops, url);
                continue;
            }

            let text = response.text().await?;
            if !status.is_success() {
                debug!("{} answered HTTP {}", url, status.as_u16());
                return Err(ClassifiedError::from_status(status.as_u16(), &text));
            }
            return Ok(text);
        }
    }
}

fn discovery_options(config: &ConnectionConfig) -> DiscoveryOptions {
    DiscoveryOptions::new()
        .http_port(config.http_port())
        .https_port(config.https_port())
        .timeout(probe_timeout(config.timeout()))
}

fn probe_timeout(request_timeout: Duration) -> Duration {
    DEFAULT_PROBE_TIMEOUT.min(request_timeout)
}

/// Whether `url` points at a relay host over HTTPS.
fn is_relay_url(url: &str) -> bool {
    Url::parse(url).is_ok_and(|url| {
        url.scheme() == "https" && url.host_str().is_some_and(is_relay_host)
    })
}

fn is_followed_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

fn join_location(current: &str, location: &str) -> Result<String> {
    Url::parse(current)
        .and_then(|base| base.join(location))
        .map(String::from)
        .map_err(|e| {
            ClassifiedError::connection(format!("Invalid redirect location {location:?}: {e}"))
        })
}

/// Decode a 2xx response body into `T`.
pub(crate) fn decode_response<T: DeserializeOwned>(text: &str) -> Result<T> {
    let value: Value = serde_json::from_str(text).map_err(|e| {
        ClassifiedError::validation("Response is not valid JSON")
            .with_detail("stage", "parse")
            .with_detail("error", e.to_string())
            .with_detail("body", truncate_body(text))
    })?;

    let envelope_error = |message: String| {
        ClassifiedError::validation(message).with_detail("stage", "envelope")
    };

    let Value::Object(map) = value else {
        return Err(envelope_error("Response is not a JSON object".to_string())
            .with_detail("body", truncate_body(text)));
    };
    if !map.contains_key("data") && !map.contains_key("errors") {
        return Err(envelope_error(
            "Response has neither data nor errors".to_string(),
        ));
    }

    let envelope: GraphqlEnvelope = serde_json::from_value(Value::Object(map))
        .map_err(|e| envelope_error(format!("Malformed GraphQL response: {e}")))?;

    if !envelope.errors().is_empty() {
        return Err(ClassifiedError::from_graphql_errors(envelope.errors()));
    }

    let Some(data) = envelope.data else {
        return Err(ClassifiedError::new(
            ErrorKind::ServerFault,
            "Server returned no data",
        ));
    };

    serde_json::from_value(Value::Object(data)).map_err(|e| {
        ClassifiedError::validation(format!("Unexpected response shape: {e}"))
            .with_detail("stage", "payload")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Info {
        info: InfoOs,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct InfoOs {
        hostname: String,
    }

    fn stage(err: &ClassifiedError) -> Option<&str> {
        err.details().get("stage").and_then(Value::as_str)
    }

    #[test]
    fn test_decode_success() {
        let info: Info = decode_response(r#"{"data":{"info":{"hostname":"tower"}}}"#).unwrap();
        assert_eq!(info.info.hostname, "tower");
    }

    #[test]
    fn test_decode_not_json() {
        let err = decode_response::<Value>("<html>502 Bad Gateway</html>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(stage(&err), Some("parse"));
        assert!(err.details()["body"].as_str().unwrap().contains("Bad Gateway"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_decode_envelope_failures() {
        for body in ["[1,2]", "{}", r#"{"data": 5}"#, r#"{"errors": "nope"}"#] {
            let err = decode_response::<Value>(body).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{body}");
            assert_eq!(stage(&err), Some("envelope"), "{body}");
        }
    }

    #[test]
    fn test_decode_graphql_errors() {
        let body = r#"{"data":null,"errors":[{"message":"Forbidden resource","extensions":{"code":"FORBIDDEN"}}]}"#;
        let err = decode_response::<Value>(body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(!err.is_retryable());
        assert_eq!(err.details()["errors"][0]["message"], "Forbidden resource");
    }

    #[test]
    fn test_errors_win_over_partial_data() {
        let body = r#"{"data":{"info":{"hostname":"tower"}},"errors":[{"message":"VM not found"}]}"#;
        let err = decode_response::<Info>(body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_decode_null_data() {
        let err = decode_response::<Value>(r#"{"data":null}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerFault);
        assert!(err.is_retryable());

        let err = decode_response::<Value>(r#"{"data":null,"errors":[]}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerFault);
    }

    #[test]
    fn test_decode_shape_mismatch() {
        let err = decode_response::<Info>(r#"{"data":{"info":{"host":"tower"}}}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(stage(&err), Some("payload"));
        assert!(err.message().contains("hostname"));
    }

    #[test]
    fn test_join_location() {
        assert_eq!(
            join_location("http://tower/graphql", "/r/1").unwrap(),
            "http://tower/r/1"
        );
        assert_eq!(
            join_location("http://tower/graphql", "https://abc.myunraid.net/graphql").unwrap(),
            "https://abc.myunraid.net/graphql"
        );
    }

    #[test]
    fn test_relay_hop_needs_verified_client() {
        let hop = join_location("http://192.168.1.10/graphql", "https://abc.myunraid.net/graphql")
            .unwrap();
        assert!(is_relay_url(&hop));
        assert!(is_relay_url("https://ABC.MyUnraid.net:8443/graphql"));
        assert!(!is_relay_url("http://abc.myunraid.net/graphql"));
        assert!(!is_relay_url("https://myunraid.net.evil.com/graphql"));
        assert!(!is_relay_url("https://tower:8443/graphql"));
        assert!(!is_relay_url("not a url"));
    }

    #[test]
    fn test_probe_timeout_is_capped() {
        assert_eq!(probe_timeout(Duration::from_secs(30)), DEFAULT_PROBE_TIMEOUT);
        assert_eq!(
            probe_timeout(Duration::from_millis(200)),
            Duration::from_millis(200)
        );
    }

    #[tokio::test]
    async fn test_empty_host_fails_without_network() {
        let resolver = Arc::new(ConnectionResolver::http().unwrap());
        let executor = QueryExecutor::new(resolver.clone()).unwrap();
        let config = ConnectionConfig::new("   ", "key");

        let err = executor
            .execute::<Value>(&config, "{ info { os { hostname } } }", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(resolver.cache().is_empty());
    }
}
