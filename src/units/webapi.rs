//! Web-API monitor.
//!
//! Calls a list of configured APIs, each on its own interval. All timers
//! live in a single `DelayQueue`, so one task serves every API and sleeps
//! until the next one is due.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::time::DelayQueue;
use tracing::{debug, instrument, trace};

use crate::config::WebApiConfig;
use crate::dispatch::{build_client, prepare};
use crate::telemetry::Level;

use super::{MonitorUnit, UnitContext, UnitCore, UnitError};

const SOURCE: &str = "WebAPI";

/// Status reported when no HTTP answer was received
pub const ERROR_STATUS: i32 = -1;

#[derive(Debug, Clone, Serialize)]
pub struct ApiCheck {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub subject: String,
    pub status: i32,
    /// Seconds
    pub duration: f64,
    pub data: Map<String, Value>,
}

impl ApiCheck {
    fn failed(api: &WebApiConfig, duration: f64, error: String) -> Self {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::String(error));
        Self {
            timestamp: Utc::now(),
            name: api.name.clone(),
            subject: api.subject.clone(),
            status: ERROR_STATUS,
            duration,
            data,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400 || self.status < 0
    }
}

/// JSON objects are kept as-is; anything else is wrapped as `raw_response`.
fn response_data(body: &str) -> Map<String, Value> {
    if body.is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Map<String, Value>>(body) {
        Ok(map) => map,
        Err(_) => {
            let mut map = Map::new();
            map.insert("raw_response".to_string(), Value::String(body.to_string()));
            map
        }
    }
}

pub struct WebApiUnit {
    core: UnitCore,
    apis: Vec<WebApiConfig>,
}

impl WebApiUnit {
    pub fn new(name: impl Into<String>, apis: Vec<WebApiConfig>) -> Self {
        Self {
            core: UnitCore::new(name),
            apis,
        }
    }
}

impl MonitorUnit for WebApiUnit {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn init(&mut self, context: UnitContext) -> Result<(), UnitError> {
        if let Some(api) = self.apis.iter().find(|api| api.interval_secs == 0) {
            return Err(self
                .core
                .invalid(format!("api '{}': interval_secs must be greater than zero", api.name)));
        }
        self.core.bind(context);
        Ok(())
    }

    fn start(&mut self, tracker: &TaskTracker) -> Result<(), UnitError> {
        let targets = self
            .apis
            .iter()
            .filter(|api| api.enabled)
            .map(|api| {
                build_client(api.timeout_secs, api.skip_verify)
                    .map(|client| (api.clone(), client))
                    .map_err(|e| {
                        self.core
                            .invalid(format!("api '{}': failed to build HTTP client: {e}", api.name))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (context, token) = self.core.begin()?;
        if targets.is_empty() {
            context.log(SOURCE, Level::Info, "no enabled APIs to monitor");
            return Ok(());
        }

        let worker = WebApiWorker {
            unit: self.core.name().to_string(),
            targets,
            context,
        };
        tracker.spawn(worker.run(token));
        Ok(())
    }

    fn stop(&self) {
        self.core.cancel();
    }
}

struct WebApiWorker {
    unit: String,
    targets: Vec<(WebApiConfig, reqwest::Client)>,
    context: UnitContext,
}

impl WebApiWorker {
    #[instrument(skip_all, fields(unit = %self.unit, apis = self.targets.len()))]
    async fn run(self, token: CancellationToken) {
        debug!("starting web API monitor");

        let mut due = DelayQueue::with_capacity(self.targets.len());
        for index in 0..self.targets.len() {
            due.insert(index, Duration::ZERO);
        }

        loop {
            let expired = tokio::select! {
                _ = token.cancelled() => break,
                expired = due.next() => expired,
            };
            let Some(expired) = expired else {
                break;
            };

            let index = expired.into_inner();
            let (api, client) = &self.targets[index];

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.check(api, client, &token) => {}
            }

            due.insert(index, Duration::from_secs(api.interval_secs));
        }

        self.context
            .log(SOURCE, Level::Info, "stopping all API monitors");
        debug!("web API monitor stopped");
    }

    async fn check(&self, api: &WebApiConfig, client: &reqwest::Client, token: &CancellationToken) {
        let result = call(api, client).await;
        self.report(api, &result, token).await;
    }

    async fn report(&self, api: &WebApiConfig, result: &ApiCheck, token: &CancellationToken) {
        match serde_json::to_string(result) {
            Ok(line) => self.context.log(SOURCE, Level::Info, line),
            Err(e) => self.context.log(
                SOURCE,
                Level::Error,
                format!("failed to encode result for {}: {e}", api.name),
            ),
        }

        let level = if result.is_error() {
            Level::Error
        } else {
            Level::Info
        };
        self.context.log(
            SOURCE,
            level,
            format!("{} [{}] - {:.2}s", api.name, result.status, result.duration),
        );

        if api.forward {
            let envelope = self
                .context
                .envelope(
                    "webapi",
                    "api_check",
                    "info",
                    format!("API check for {} completed", api.name),
                )
                .with_data("response", result);
            self.context
                .forward(&format!("API check for {}", api.name), &envelope, token)
                .await;
        }
    }
}

#[instrument(skip_all, fields(api = %api.name))]
async fn call(api: &WebApiConfig, client: &reqwest::Client) -> ApiCheck {
    trace!("calling {}", api.endpoint);
    let start = Instant::now();

    let mut request = prepare(client, &api.http_endpoint());
    if let Some(body) = &api.body {
        request = request.json(body);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            return ApiCheck::failed(api, start.elapsed().as_secs_f64(), format!("request failed: {e}"));
        }
    };

    let status = i32::from(response.status().as_u16());
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            return ApiCheck::failed(
                api,
                start.elapsed().as_secs_f64(),
                format!("error reading response: {e}"),
            );
        }
    };

    ApiCheck {
        timestamp: Utc::now(),
        name: api.name.clone(),
        subject: api.subject.clone(),
        status,
        duration: start.elapsed().as_secs_f64(),
        data: response_data(&body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Auth, HttpMethod};
    use crate::units::testing;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(name: &str, endpoint: String) -> WebApiConfig {
        WebApiConfig {
            enabled: true,
            name: name.to_string(),
            subject: "billing".to_string(),
            endpoint,
            method: HttpMethod::Get,
            headers: Vec::new(),
            query: Default::default(),
            body: None,
            auth: Auth::None,
            timeout_secs: 2,
            skip_verify: false,
            interval_secs: 60,
            forward: false,
        }
    }

    #[test]
    fn test_response_data() {
        assert_eq!(response_data(r#"{"ok":true}"#)["ok"], json!(true));
        assert_eq!(response_data("pong")["raw_response"], json!("pong"));
        assert_eq!(response_data("[1,2]")["raw_response"], json!("[1,2]"));
        assert!(response_data("").is_empty());
    }

    #[tokio::test]
    async fn test_call_sends_body_and_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .and(header("Authorization", "Basic dXNlcjpwYXNz"))
            .and(body_json(json!({"q": "health"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"healthy": true})))
            .expect(1)
            .mount(&server)
            .await;

        let mut target = api("search", format!("{}/query", server.uri()));
        target.method = HttpMethod::Post;
        target.body = Some(json!({"q": "health"}));
        target.auth = Auth::Basic {
            username: "user".to_string(),
            password: Some("pass".to_string()),
        };

        let result = call(&target, &build_client(2, false).unwrap()).await;
        assert_eq!(result.status, 200);
        assert_eq!(result.data["healthy"], json!(true));
        assert!(!result.is_error());
    }

    #[tokio::test]
    async fn test_call_failure_reports_minus_one() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let target = api("gone", format!("http://127.0.0.1:{port}/"));

        let result = call(&target, &build_client(2, false).unwrap()).await;
        assert_eq!(result.status, ERROR_STATUS);
        assert!(result.is_error());
        assert!(result.data["error"].as_str().unwrap().starts_with("request failed"));
    }

    #[tokio::test]
    async fn test_unit_checks_each_api() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let (context, captured) = testing::context(testing::empty_config());
        let sink = context.sink.clone();
        let mut unit = WebApiUnit::new(
            "WebApi",
            vec![
                api("alpha", format!("{}/a", server.uri())),
                api("beta", format!("{}/b", server.uri())),
            ],
        );
        unit.init(context).unwrap();

        let tracker = TaskTracker::new();
        unit.start(&tracker).unwrap();
        tracker.close();
        tokio::time::sleep(Duration::from_millis(300)).await;
        unit.stop();
        tracker.wait().await;
        sink.close().await;

        let out = captured.contents();
        assert!(out.contains("[WebAPI][INFO] alpha [200] - "), "{out}");
        assert!(out.contains("[WebAPI][ERROR] beta [503] - "), "{out}");
        assert!(out.contains(r#""raw_response":"ok""#), "{out}");
    }

    #[tokio::test]
    async fn test_forwards_envelope() {
        let api_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": 1})))
            .mount(&api_server)
            .await;

        let collector = MockServer::start().await;
        Mock::given(method("POST"))
            .and(wiremock::matchers::body_partial_json(json!({
                "source": "webapi",
                "type": "api_check",
                "data": {"response": {"name": "alpha", "status": 200}}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&collector)
            .await;

        let config = crate::config::parse_config(
            &format!(r#"{{"delivery": {{"enabled": true, "url": "{}/"}}}}"#, collector.uri()),
            false,
        )
        .unwrap();
        let (context, _) = testing::context(config);
        let dispatcher = context.dispatcher.clone();

        let mut target = api("alpha", api_server.uri());
        target.forward = true;
        let mut unit = WebApiUnit::new("WebApi", vec![target]);
        unit.init(context).unwrap();

        let tracker = TaskTracker::new();
        unit.start(&tracker).unwrap();
        tracker.close();
        tokio::time::sleep(Duration::from_millis(400)).await;
        unit.stop();
        tracker.wait().await;
        dispatcher.close().await;
    }
}
