//! Dispatcher tests against real HTTP endpoints

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use hostwatch::config::{Auth, Header, HttpEndpoint, HttpMethod};
use hostwatch::dispatch::{
    DeliveryOutcome, Destination, Dispatcher, RESPONSE_TIMEOUT, await_delivery,
};
use hostwatch::telemetry::Level;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ten_submits_across_three_endpoints() {
    let mut servers = Vec::new();
    for _ in 0..3 {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(100)))
            .expect(3..=4)
            .mount(&server)
            .await;
        servers.push(server);
    }

    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(3, 1000, &shutdown);

    let started = Instant::now();
    let pending: Vec<_> = (0..10)
        .map(|i| {
            let server = &servers[i % servers.len()];
            dispatcher.submit(
                json!({"sample": i}),
                http(format!("{}/ingest", server.uri())),
                Level::Info,
            )
        })
        .collect();

    let outcomes = futures::future::join_all(
        pending
            .into_iter()
            .map(|rx| await_delivery(rx, &shutdown, RESPONSE_TIMEOUT)),
    )
    .await;

    assert!(started.elapsed() < RESPONSE_TIMEOUT + Duration::from_secs(1));
    for outcome in outcomes {
        assert_eq!(outcome, DeliveryOutcome::Delivered(None));
    }

    dispatcher.close().await;
}

#[tokio::test]
async fn test_http_wire_contract() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/telemetry"))
        .and(query_param("agent", "web-01"))
        .and(header("X-Tenant", "ops"))
        .and(header("X-Token", "secret"))
        .and(body_json(json!({"cpu": 42})))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"accepted": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let destination = Destination::Http(HttpEndpoint {
        url: format!("{}/v1/telemetry", server.uri()),
        method: HttpMethod::Put,
        headers: vec![Header {
            key: "X-Tenant".to_string(),
            value: "ops".to_string(),
        }],
        query: BTreeMap::from([("agent".to_string(), "web-01".to_string())]),
        auth: Auth::ApiKey {
            key: "secret".to_string(),
            header: "X-Token".to_string(),
        },
        timeout_secs: 2,
        skip_verify: false,
    });

    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(1, 10, &shutdown);
    let rx = dispatcher.submit_for_result(json!({"cpu": 42}), destination, Level::Info);

    let outcome = await_delivery(rx, &shutdown, RESPONSE_TIMEOUT).await;
    assert_eq!(outcome, DeliveryOutcome::Delivered(Some(json!({"accepted": 1}))));

    dispatcher.close().await;
}

#[tokio::test]
async fn test_bearer_token_and_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("Authorization", "Bearer t0k3n"))
        .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
        .expect(1)
        .mount(&server)
        .await;

    let destination = Destination::Http(HttpEndpoint {
        url: server.uri(),
        auth: Auth::Bearer {
            token: "t0k3n".to_string(),
        },
        timeout_secs: 2,
        ..Default::default()
    });

    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(1, 10, &shutdown);
    let rx = dispatcher.submit(json!({"x": 1}), destination, Level::Info);

    let outcome = await_delivery(rx, &shutdown, RESPONSE_TIMEOUT).await;
    assert_matches!(outcome, DeliveryOutcome::Failed(error) if error.contains("401") && error.contains("expired"));

    dispatcher.close().await;
}

#[tokio::test]
async fn test_full_queue_drops_without_blocking() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(1, 1, &shutdown);

    // no yield between submits, so the worker has not claimed anything yet
    let first = dispatcher.submit(json!({"n": 1}), http(server.uri()), Level::Info);
    let second = dispatcher.submit(json!({"n": 2}), http(server.uri()), Level::Info);
    let third = dispatcher.submit(json!({"n": 3}), http(server.uri()), Level::Info);

    assert_eq!(
        await_delivery(second, &shutdown, Duration::from_millis(10)).await,
        DeliveryOutcome::Dropped
    );
    assert_eq!(
        await_delivery(third, &shutdown, Duration::from_millis(10)).await,
        DeliveryOutcome::Dropped
    );
    assert_eq!(
        await_delivery(first, &shutdown, RESPONSE_TIMEOUT).await,
        DeliveryOutcome::Delivered(None)
    );

    dispatcher.close().await;
}
