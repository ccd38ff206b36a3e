//! Exercises `ReqwestTransport` (feature `http`) against a real HTTP server
//! stood up by `wiremock`, since `HttpTransport` implementors below the fake
//! used elsewhere in the test suite are otherwise untested end to end.

#![cfg(feature = "http")]

use geotrack_core::{HttpTransport, OutboundRequest, ReqwestTransport};
use std::collections::HashMap;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(url: String) -> OutboundRequest {
    let mut headers = HashMap::new();
    headers.insert("X-Tracker-Token".to_string(), "secret".to_string());
    OutboundRequest {
        url,
        method: "POST".to_string(),
        headers,
        body: serde_json::json!({"location": {"uuid": "abc"}}),
        timeout_ms: 5_000,
    }
}

#[tokio::test]
async fn posts_body_and_headers_and_returns_2xx() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/locations"))
        .and(header("X-Tracker-Token", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let transport = ReqwestTransport::new().unwrap();
    let response = transport
        .send(request(format!("{}/locations", server.uri())))
        .await
        .unwrap();

    assert!(response.ok());
    assert_eq!(response.body_text, "ok");
}

#[tokio::test]
async fn surfaces_401_as_auth_required() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/locations"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let transport = ReqwestTransport::new().unwrap();
    let response = transport
        .send(request(format!("{}/locations", server.uri())))
        .await
        .unwrap();

    assert!(response.is_auth_required());
    assert!(!response.ok());
}

#[tokio::test]
async fn surfaces_server_error_without_panicking() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/locations"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let transport = ReqwestTransport::new().unwrap();
    let response = transport
        .send(request(format!("{}/locations", server.uri())))
        .await
        .unwrap();

    assert_eq!(response.status, 503);
    assert!(!response.ok());
}
