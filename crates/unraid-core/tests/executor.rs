//! Query executor tests against a local mock GraphQL server.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use unraid_core::{
    ConnectionResolver, ErrorKind, GraphqlOperation, PollConfig, PollScheduler, QueryExecutor,
};
use unraid_types::{ConnectionConfig, TransportDiscoveryResult, TransportMode};

const API_KEY: &str = "test-key";
const INFO_QUERY: &str = "{ info { os { hostname } } }";

#[derive(Debug, Deserialize, PartialEq)]
struct InfoResponse {
    info: Info,
}

#[derive(Debug, Deserialize, PartialEq)]
struct Info {
    os: Os,
}

#[derive(Debug, Deserialize, PartialEq)]
struct Os {
    hostname: String,
}

#[derive(Debug, Serialize)]
struct ContainerVars {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StartContainer {
    docker: DockerMutation,
}

#[derive(Debug, Deserialize)]
struct DockerMutation {
    start: Container,
}

#[derive(Debug, Deserialize)]
struct Container {
    state: String,
}

struct StartContainerMutation;

impl GraphqlOperation for StartContainerMutation {
    type Variables = ContainerVars;
    type ResponseData = StartContainer;

    const QUERY: &'static str =
        "mutation StartContainer($id: PrefixedID!) { docker { start(id: $id) { state } } }";
    const OPERATION_NAME: &'static str = "StartContainer";
}

fn info_body() -> Value {
    json!({ "data": { "info": { "os": { "hostname": "tower" } } } })
}

fn executor() -> QueryExecutor {
    let resolver = Arc::new(ConnectionResolver::http().expect("resolver"));
    QueryExecutor::new(resolver).expect("executor")
}

fn port_of(server: &MockServer) -> u16 {
    server.address().port()
}

/// Config already resolved to `{server}{endpoint}` over plain HTTP.
fn resolved_config(server: &MockServer, endpoint: &str) -> ConnectionConfig {
    let discovery = TransportDiscoveryResult::new(
        format!("{}{}", server.uri(), endpoint),
        TransportMode::PlainOnly,
        port_of(server),
    );
    ConnectionConfig::new("127.0.0.1", API_KEY)
        .with_ports(port_of(server), 443)
        .with_discovery(&discovery)
}

async fn mount_graphql(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_execute_success_sends_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(header("x-api-key", API_KEY))
        .and(body_partial_json(json!({ "query": INFO_QUERY })))
        .respond_with(ResponseTemplate::new(200).set_body_json(info_body()))
        .expect(1)
        .mount(&server)
        .await;

    let config = resolved_config(&server, "/graphql");
    let response: InfoResponse = executor()
        .execute(&config, INFO_QUERY, json!({}))
        .await
        .unwrap();

    assert_eq!(response.info.os.hostname, "tower");
}

#[tokio::test]
async fn test_execute_operation_sends_variables_and_name() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({
            "operationName": "StartContainer",
            "variables": { "id": "abc123" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "docker": { "start": { "state": "RUNNING" } } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = resolved_config(&server, "/graphql");
    let response = executor()
        .execute_operation::<StartContainerMutation>(
            &config,
            ContainerVars {
                id: "abc123".into(),
            },
        )
        .await
        .unwrap();

    assert_eq!(response.docker.start.state, "RUNNING");
}

#[tokio::test]
async fn test_http_401_is_authentication() {
    let server = MockServer::start().await;
    mount_graphql(&server, ResponseTemplate::new(401).set_body_string("Unauthorized")).await;

    let err = executor()
        .execute::<Value>(&resolved_config(&server, "/graphql"), INFO_QUERY, json!({}))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert!(!err.is_retryable());
    assert_eq!(err.details()["status"], 401);
    assert_eq!(err.details()["body"], "Unauthorized");
}

#[tokio::test]
async fn test_http_500_is_retryable_server_fault() {
    let server = MockServer::start().await;
    mount_graphql(&server, ResponseTemplate::new(500)).await;

    let err = executor()
        .execute::<Value>(&resolved_config(&server, "/graphql"), INFO_QUERY, json!({}))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ServerFault);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_http_429_is_rate_limited() {
    let server = MockServer::start().await;
    mount_graphql(&server, ResponseTemplate::new(429)).await;

    let err = executor()
        .execute::<Value>(&resolved_config(&server, "/graphql"), INFO_QUERY, json!({}))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RateLimited);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_graphql_errors_are_classified() {
    let server = MockServer::start().await;
    mount_graphql(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "data": null,
            "errors": [
                { "message": "Invalid API key", "path": ["info"] },
                { "message": "second" }
            ]
        })),
    )
    .await;

    let err = executor()
        .execute::<InfoResponse>(&resolved_config(&server, "/graphql"), INFO_QUERY, json!({}))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert!(!err.is_retryable());
    assert_eq!(err.message(), "Invalid API key (and 1 more)");
    assert_eq!(err.details()["errors"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_shape_mismatch_is_validation() {
    let server = MockServer::start().await;
    mount_graphql(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "data": { "info": { "os": { "hostname": 42 } } }
        })),
    )
    .await;

    let err = executor()
        .execute::<InfoResponse>(&resolved_config(&server, "/graphql"), INFO_QUERY, json!({}))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.details()["stage"], "payload");
}

#[tokio::test]
async fn test_non_json_body_is_validation() {
    let server = MockServer::start().await;
    mount_graphql(
        &server,
        ResponseTemplate::new(200).set_body_string("<html>Unraid login</html>"),
    )
    .await;

    let err = executor()
        .execute::<Value>(&resolved_config(&server, "/graphql"), INFO_QUERY, json!({}))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.details()["stage"], "parse");
    assert_eq!(err.details()["body"], "<html>Unraid login</html>");
}

#[tokio::test]
async fn test_null_data_is_server_fault() {
    let server = MockServer::start().await;
    mount_graphql(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({ "data": null })),
    )
    .await;

    let err = executor()
        .execute::<Value>(&resolved_config(&server, "/graphql"), INFO_QUERY, json!({}))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ServerFault);
    assert!(err.is_retryable());
}

/// Mount a chain `/r/0 -> /r/1 -> ... -> /r/{hops}` that answers at the end.
async fn mount_redirect_chain(server: &MockServer, hops: usize) {
    for i in 0..hops {
        Mock::given(method("POST"))
            .and(path(format!("/r/{i}")))
            .respond_with(
                ResponseTemplate::new(307).insert_header("Location", format!("/r/{}", i + 1)),
            )
            .mount(server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path(format!("/r/{hops}")))
        .and(header("x-api-key", API_KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(info_body()))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_five_redirects_are_followed() {
    let server = MockServer::start().await;
    mount_redirect_chain(&server, 5).await;

    let response: InfoResponse = executor()
        .execute(&resolved_config(&server, "/r/0"), INFO_QUERY, json!({}))
        .await
        .unwrap();

    assert_eq!(response.info.os.hostname, "tower");
}

#[tokio::test]
async fn test_sixth_redirect_is_connection_error() {
    let server = MockServer::start().await;
    mount_redirect_chain(&server, 6).await;

    let err = executor()
        .execute::<Value>(&resolved_config(&server, "/r/0"), INFO_QUERY, json!({}))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(err.message().contains("redirects"));
}

#[tokio::test]
async fn test_slow_server_times_out() {
    let server = MockServer::start().await;
    mount_graphql(
        &server,
        ResponseTemplate::new(200)
            .set_body_json(info_body())
            .set_delay(Duration::from_secs(3)),
    )
    .await;

    let config = resolved_config(&server, "/graphql").with_timeout(Duration::from_millis(200));
    let err = executor()
        .execute::<Value>(&config, INFO_QUERY, json!({}))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_refused_connection() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let discovery = TransportDiscoveryResult::new(
        format!("http://127.0.0.1:{port}/graphql"),
        TransportMode::PlainOnly,
        port,
    );
    let config = ConnectionConfig::new("127.0.0.1", API_KEY)
        .with_ports(port, 443)
        .with_discovery(&discovery);

    let err = executor()
        .execute::<Value>(&config, INFO_QUERY, json!({}))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unresolved_config_discovers_endpoint() {
    let server = MockServer::start().await;
    // Unmatched GET / answers 404, which marks the port as plain HTTP.
    mount_graphql(&server, ResponseTemplate::new(200).set_body_json(info_body())).await;

    let resolver = Arc::new(ConnectionResolver::http().unwrap());
    let executor = QueryExecutor::new(Arc::clone(&resolver)).unwrap();
    let mut config = ConnectionConfig::new("127.0.0.1", API_KEY).with_ports(port_of(&server), 1);
    assert!(!config.is_resolved());

    let response: InfoResponse = executor
        .execute(&config, INFO_QUERY, json!({}))
        .await
        .unwrap();
    assert_eq!(response.info.os.hostname, "tower");
    assert_eq!(resolver.cache().len(), 1);

    executor.resolve(&mut config).await.unwrap();
    assert_eq!(config.transport_mode(), TransportMode::PlainOnly);
    assert_eq!(
        config.resolved_url(),
        Some(format!("{}/graphql", server.uri()).as_str())
    );
}

#[tokio::test]
async fn test_polled_query_failures_back_off() {
    let server = MockServer::start().await;
    mount_graphql(&server, ResponseTemplate::new(503)).await;

    let executor = executor();
    let config = resolved_config(&server, "/graphql");
    let scheduler = PollScheduler::new();
    scheduler
        .register(
            "info",
            move || {
                let executor = executor.clone();
                let config = config.clone();
                async move {
                    executor
                        .execute::<InfoResponse>(&config, INFO_QUERY, json!({}))
                        .await
                        .map(|_| ())
                }
            },
            PollConfig::default(),
        )
        .unwrap();

    let snapshot = scheduler.force_run("info").await.unwrap();
    assert_eq!(snapshot.consecutive_errors, 1);
    assert_eq!(snapshot.current_interval_ms, 2000);
    assert!(snapshot.last_error.unwrap().starts_with("Server error"));
}
