//! Agent start-up and shutdown tests

use std::time::Duration;

use hostwatch::lifecycle::{Coordinator, LifecycleState, ShutdownOutcome};
use hostwatch::units::{MonitorUnit, UnitContext, UnitCore, UnitError};
use serde_json::json;
use tokio_util::task::TaskTracker;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

/// Spawns a task that never looks at its cancellation token
struct Stubborn(UnitCore);

impl MonitorUnit for Stubborn {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn init(&mut self, context: UnitContext) -> Result<(), UnitError> {
        self.0.bind(context);
        Ok(())
    }

    fn start(&mut self, tracker: &TaskTracker) -> Result<(), UnitError> {
        self.0.begin()?;
        tracker.spawn(tokio::time::sleep(Duration::from_secs(3600)));
        Ok(())
    }

    fn stop(&self) {
        self.0.cancel();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_monitors_forward_and_shut_down_cleanly() {
    let site = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&site)
        .await;

    let collector = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .and(body_partial_json(json!({"status": "Up", "status_code": 200})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1..)
        .mount(&collector)
        .await;

    let config = config(json!({
        "agent": {"id": "web-01", "shutdown_grace_secs": 5},
        "delivery": {"enabled": true, "url": format!("{}/ingest", collector.uri())},
        "web_monitor": {
            "enabled": true,
            "forward": true,
            "timeout_secs": 2,
            "urls": [format!("{}/health", site.uri())]
        }
    }));

    let (sink, captured) = captured_sink();
    let coordinator = Coordinator::new(config).with_sink(sink);
    let state = coordinator.state();

    let outcome = coordinator
        .run(tokio::time::sleep(Duration::from_millis(500)))
        .await
        .unwrap();

    assert_eq!(outcome, ShutdownOutcome::Clean);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(*state.borrow(), LifecycleState::Terminated);

    let out = captured.contents();
    assert!(out.contains("delivery workers and units: WebMonitor"), "{out}");
    assert!(out.contains("/health is up"), "{out}");
    assert!(out.contains("[Agent][INFO] all units stopped"), "{out}");
}

#[tokio::test]
async fn test_plugins_are_loaded_from_the_configured_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("memory.toml"),
        "name = \"memory\"\nkind = \"system_monitor\"\n[settings]\ncpu = false\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("broken.toml"), "kind = \"system_monitor\"\n").unwrap();

    let config = config(json!({
        "agent": {"shutdown_grace_secs": 5},
        "plugins": {"directory": dir.path()}
    }));

    let (sink, captured) = captured_sink();
    let outcome = Coordinator::new(config)
        .with_sink(sink)
        .run(tokio::time::sleep(Duration::from_millis(200)))
        .await
        .unwrap();

    assert_eq!(outcome, ShutdownOutcome::Clean);

    let out = captured.contents();
    assert!(out.contains("[Plugins][INFO] loaded plugins: memory"), "{out}");
    assert!(out.contains("[Plugins][ERROR] failed to load"), "{out}");
    assert!(out.contains("broken.toml"), "{out}");
    assert!(out.contains("[Metrics][INFO] {"), "{out}");
}

#[tokio::test]
async fn test_unit_ignoring_cancellation_times_out() {
    let config = config(json!({"agent": {"shutdown_grace_secs": 1}}));

    let (sink, captured) = captured_sink();
    let coordinator = Coordinator::new(config)
        .with_sink(sink)
        .with_unit(Box::new(Stubborn(UnitCore::new("stubborn"))));

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator.run(tokio::time::sleep(Duration::from_millis(20))),
    )
    .await
    .expect("grace period bounds the shutdown")
    .unwrap();

    assert_eq!(outcome, ShutdownOutcome::TimedOut);
    assert_ne!(outcome.exit_code(), 0);

    // the sink stays open on timeout; give the consumer a moment
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        captured.contents().contains("shutdown timed out after 1s"),
        "{}",
        captured.contents()
    );
}
