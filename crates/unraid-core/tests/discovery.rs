//! Probe and discovery tests over real sockets.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use unraid_core::{
    ConnectionResolver, DiscoveryOptions, HttpProber, PROBE_PATH, ProbeError, TransportProber,
};
use unraid_types::TransportMode;

const TIMEOUT: Duration = Duration::from_secs(2);

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn redirecting_server(location: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", location))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_plain_probe_reports_redirect_without_following() {
    let server = redirecting_server("https://abc123.myunraid.net/login").await;
    let prober = HttpProber::new().unwrap();

    let outcome = prober
        .probe_plain("127.0.0.1", server.address().port(), PROBE_PATH, TIMEOUT)
        .await;

    assert_eq!(outcome.status, Some(302));
    assert_eq!(outcome.redirect(), Some("https://abc123.myunraid.net/login"));
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn test_plain_probe_reports_any_status() {
    let server = MockServer::start().await;
    let prober = HttpProber::new().unwrap();

    let outcome = prober
        .probe_plain("127.0.0.1", server.address().port(), PROBE_PATH, TIMEOUT)
        .await;

    assert_eq!(outcome.status, Some(404));
    assert_eq!(outcome.redirect(), None);
}

#[tokio::test]
async fn test_refused_probe_is_tagged() {
    let prober = HttpProber::new().unwrap();
    let outcome = prober
        .probe_plain("127.0.0.1", free_port(), PROBE_PATH, TIMEOUT)
        .await;

    assert!(!outcome.is_response());
    assert_eq!(outcome.error, Some(ProbeError::Refused));
}

#[tokio::test]
async fn test_slow_probe_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;
    let prober = HttpProber::new().unwrap();

    let outcome = prober
        .probe_plain(
            "127.0.0.1",
            server.address().port(),
            PROBE_PATH,
            Duration::from_millis(200),
        )
        .await;

    assert_eq!(outcome.error, Some(ProbeError::Timeout));
}

#[tokio::test]
async fn test_discovery_follows_relay_redirect() {
    let server = redirecting_server("https://abc123.myunraid.net/login").await;
    let resolver = ConnectionResolver::http().unwrap();
    let options = DiscoveryOptions::new()
        .http_port(server.address().port())
        .timeout(TIMEOUT);

    let result = resolver.discover("127.0.0.1", &options).await.unwrap();

    assert_eq!(result.transport_mode, TransportMode::EncryptedVerified);
    assert_eq!(result.resolved_url, "https://abc123.myunraid.net/graphql");
    assert!(result.verify_certificate);
}

#[tokio::test]
async fn test_discovery_follows_https_redirect() {
    let server = redirecting_server("https://127.0.0.1:8443/Dashboard").await;
    let resolver = ConnectionResolver::http().unwrap();
    let options = DiscoveryOptions::new()
        .http_port(server.address().port())
        .timeout(TIMEOUT);

    let result = resolver.discover("127.0.0.1", &options).await.unwrap();

    assert_eq!(result.transport_mode, TransportMode::EncryptedUntrusted);
    assert_eq!(result.resolved_url, "https://127.0.0.1:8443/graphql");
    assert_eq!(result.port, 8443);
}

#[tokio::test]
async fn test_discovery_result_is_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = ConnectionResolver::http().unwrap();
    let options = DiscoveryOptions::new()
        .http_port(server.address().port())
        .timeout(TIMEOUT);

    let first = resolver.discover("127.0.0.1", &options).await.unwrap();
    let second = resolver.discover("127.0.0.1", &options).await.unwrap();

    assert_eq!(first.transport_mode, TransportMode::PlainOnly);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_unreachable_host_falls_back_to_untrusted() {
    let resolver = ConnectionResolver::new(Arc::new(HttpProber::new().unwrap()));
    let https_port = free_port();
    let options = DiscoveryOptions::new()
        .http_port(free_port())
        .https_port(https_port)
        .timeout(TIMEOUT);

    let result = resolver.discover("127.0.0.1", &options).await.unwrap();

    assert_eq!(result.transport_mode, TransportMode::EncryptedUntrusted);
    assert_eq!(
        result.resolved_url,
        format!("https://127.0.0.1:{https_port}/graphql")
    );
}
