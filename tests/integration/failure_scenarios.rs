//! Failure tests
//!
//! These tests verify that the agent degrades gracefully:
//! - Unreachable syslog collectors
//! - Collectors coming back after an outage
//! - Broken plugin descriptors
//! - Dispatcher shutdown with queued work

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use hostwatch::config::{SyslogConfig, SyslogProtocol};
use hostwatch::dispatch::{
    DeliveryOutcome, Destination, Dispatcher, RESPONSE_TIMEOUT, await_delivery,
};
use hostwatch::plugins::{PluginError, PluginRegistry};
use hostwatch::syslog::{SyslogClient, SyslogError};
use hostwatch::telemetry::Level;
use hostwatch::units::UnitContext;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn syslog(port: u16) -> SyslogConfig {
    SyslogConfig {
        enabled: true,
        protocol: SyslogProtocol::Tcp,
        server: format!("127.0.0.1:{port}"),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_unreachable_syslog_fails_delivery() {
    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(1, 10, &shutdown);

    let rx = dispatcher.submit(
        "disk almost full",
        Destination::Syslog(syslog(free_port())),
        Level::Warn,
    );

    let outcome = await_delivery(rx, &shutdown, RESPONSE_TIMEOUT + Duration::from_secs(1)).await;
    assert_matches!(outcome, DeliveryOutcome::Failed(_));

    dispatcher.close().await;
}

#[tokio::test]
async fn test_syslog_redials_after_outage() {
    let port = free_port();
    let mut client = SyslogClient::new(&syslog(port));

    let result = client.write(4, Utc::now(), "hostwatch", "first").await;
    assert_matches!(result, Err(SyslogError::Connect { .. }));
    assert!(!client.is_connected());

    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let collector = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        lines.next_line().await.unwrap().unwrap()
    });

    client.write(4, Utc::now(), "hostwatch", "second").await.unwrap();
    assert!(client.is_connected());

    let line = tokio::time::timeout(Duration::from_secs(2), collector)
        .await
        .unwrap()
        .unwrap();
    assert!(line.starts_with("<4>"), "{line}");
    assert!(line.ends_with("hostwatch: second"), "{line}");

    client.close().await;
}

#[tokio::test]
async fn test_plugin_directory_with_malformed_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("edge.toml"),
        "name = \"edge\"\nkind = \"web_monitor\"\n[settings]\nurls = [\"http://127.0.0.1:9/\"]\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("broken.toml"), "name = [unterminated").unwrap();

    let (sink, _) = captured_sink();
    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(1, 10, &shutdown);
    let context = UnitContext::new(
        Arc::new(config(json!({}))),
        sink.clone(),
        dispatcher.clone(),
        shutdown.clone(),
    );

    let mut registry = PluginRegistry::with_builtin_kinds();
    let report = registry.discover(dir.path(), &context).unwrap();

    assert_eq!(report.loaded, vec!["edge".to_string()]);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].0.ends_with("broken.toml"));
    assert_matches!(report.failures[0].1, PluginError::Malformed(_));
    assert_eq!(registry.names(), vec!["edge"]);

    dispatcher.close().await;
    sink.close().await;
}

#[tokio::test]
async fn test_close_discards_queued_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(1, 10, &shutdown);

    let in_flight = dispatcher.submit(json!({"n": 1}), http(server.uri()), Level::Info);
    // let the worker claim the first request
    tokio::time::sleep(Duration::from_millis(50)).await;
    let queued = dispatcher.submit(json!({"n": 2}), http(server.uri()), Level::Info);

    dispatcher.close().await;
    assert!(dispatcher.is_closed());

    let never = CancellationToken::new();
    assert_eq!(
        await_delivery(in_flight, &never, RESPONSE_TIMEOUT).await,
        DeliveryOutcome::Delivered(None)
    );
    assert_eq!(
        await_delivery(queued, &never, RESPONSE_TIMEOUT).await,
        DeliveryOutcome::Dropped
    );

    let late = dispatcher.submit(json!({"n": 3}), http(server.uri()), Level::Info);
    assert_eq!(
        await_delivery(late, &never, RESPONSE_TIMEOUT).await,
        DeliveryOutcome::Dropped
    );
}
