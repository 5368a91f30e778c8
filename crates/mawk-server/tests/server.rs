//! End-to-end tests against an in-process server.
//!
//! Each test writes a config into a temporary directory, starts an
//! [`Orchestrator`] on a free port and talks to it over HTTP.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use mawk_server::expression::RequestFacts;
use mawk_server::plugin::{HookError, PreRequestHook};
use mawk_server::reload::ReloadState;
use mawk_server::server::SHUTDOWN_TIMEOUT;
use mawk_server::{Orchestrator, Plugin, PluginRegistry};
use reqwest::{Client, StatusCode, Version};
use serde_json::{json, Value};
use serial_test::serial;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::sleep;

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

struct TestServer {
    dir: TempDir,
    config_path: PathBuf,
    port: u16,
}

impl TestServer {
    /// Write a config from a `servers` block and the rest of the file.
    /// `{port}` in `servers` is replaced with the chosen port.
    fn new(servers: &str, rest: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let port = port_check::free_local_port().expect("no free port");
        let config_path = dir.path().join("config.yaml");
        let server = Self {
            dir,
            config_path,
            port,
        };
        server.write(servers, rest);
        server
    }

    fn write(&self, servers: &str, rest: &str) {
        let servers = servers.replace("{port}", &self.port.to_string());
        let content = format!("system:\n  log_dir: logs\n{servers}\n{rest}");
        std::fs::write(&self.config_path, content).unwrap();
    }

    fn path(&self) -> &Path {
        &self.config_path
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    fn log_dir(&self) -> PathBuf {
        self.dir.path().join("logs")
    }

    async fn start(&self) -> Orchestrator {
        self.start_with(PluginRegistry::new()).await
    }

    async fn start_with(&self, plugins: PluginRegistry) -> Orchestrator {
        Orchestrator::start(self.path().to_path_buf(), Arc::new(plugins))
            .await
            .expect("server failed to start")
    }
}

const DEFAULT_SERVER: &str = r#"
servers:
  - name: test
    host: 127.0.0.1:{port}
"#;

/// A client without connection reuse; listeners restart across reloads.
fn client() -> Client {
    Client::builder()
        .pool_max_idle_per_host(0)
        .timeout(TEST_TIMEOUT)
        .build()
        .unwrap()
}

async fn get_text(client: &Client, url: &str) -> (StatusCode, String) {
    let response = client.get(url).send().await.expect("request failed");
    let status = response.status();
    (status, response.text().await.unwrap())
}

#[tokio::test]
async fn test_random_order_is_reproducible_with_seed() {
    let server = TestServer::new(
        DEFAULT_SERVER,
        r#"
routes:
  - path: /dice
    requests:
      - method: get
        order: random
        seed: 100
        responses:
          - body: "1"
          - body: "2"
          - body: "3"
          - body: "4"
"#,
    );
    let orchestrator = server.start().await;
    let client = client();

    let mut seen = Vec::new();
    for _ in 0..8 {
        let (status, body) = get_text(&client, &server.url("/dice")).await;
        assert_eq!(status, StatusCode::OK);
        seen.push(body);
    }
    assert_eq!(seen, ["3", "1", "4", "4", "3", "1", "1", "3"]);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_post_values_select_handler() {
    let server = TestServer::new(
        DEFAULT_SERVER,
        r#"
routes:
  - path: /greet
    requests:
      - method: post
        post_values:
          hello: World
        responses:
          - status: "201"
            body: "Hello ${post.hello}"
"#,
    );
    let orchestrator = server.start().await;
    let client = client();

    let response = client
        .post(server.url("/greet"))
        .form(&[("hello", "World")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.text().await.unwrap(), "Hello World");

    let response = client
        .post(server.url("/greet"))
        .form(&[("hello", "Nope")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.text().await.unwrap(), "404 page not found\n");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_basic_auth_guards_listener() {
    let server = TestServer::new(
        r#"
servers:
  - name: guarded
    host: 127.0.0.1:{port}
    basic_auth:
      username: admin
      password: s3cret
      realm: mocks
"#,
        r#"
routes:
  - path: /secret
    requests:
      - method: get
        responses:
          - body: "in"
"#,
    );
    let orchestrator = server.start().await;
    let client = client();

    let response = client.get(server.url("/secret")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()["www-authenticate"],
        r#"Basic realm="mocks""#
    );

    let response = client
        .get(server.url("/secret"))
        .basic_auth("admin", Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client
        .get(server.url("/secret"))
        .basic_auth("admin", Some("s3cret"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "in");

    orchestrator.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_stats_endpoint_reports_requests() {
    let server = TestServer::new(
        DEFAULT_SERVER,
        r#"
routes:
  - path: /ping
    requests:
      - method: get
        responses:
          - body: pong
"#,
    );
    let orchestrator = server.start().await;
    let client = client();

    get_text(&client, &server.url("/ping")).await;
    let (status, body) = get_text(&client, &server.url("/_internal/server/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with(&format!("addr: 127.0.0.1:{}\n", server.port)));
    assert!(body.contains("mawk_requests_total"));

    orchestrator.shutdown().await;
}

const PING_ROUTE: &str = r#"
routes:
  - path: /ping
    requests:
      - method: get
        responses:
          - body: "${version}"
"#;

#[tokio::test]
#[serial]
async fn test_reload_failure_sets_header_until_fixed() {
    let server = TestServer::new(
        DEFAULT_SERVER,
        &PING_ROUTE.replace("${version}", "one"),
    );
    let mut orchestrator = server.start().await;
    let (tx, mut rx) = mpsc::channel(1);
    let client = client();

    let response = client.get(server.url("/ping")).send().await.unwrap();
    assert!(response.headers().get("x-reload-error").is_none());
    assert_eq!(response.text().await.unwrap(), "one");

    // A route that references an undeclared proxy fails validation.
    server.write(
        DEFAULT_SERVER,
        r#"
routes:
  - path: /ping
    proxy:
      name: missing
"#,
    );
    tx.send(()).await.unwrap();
    assert!(!orchestrator.reload(&mut rx).await);
    assert_eq!(
        orchestrator.status().state(),
        ReloadState::Loaded { valid: false }
    );

    let response = client.get(server.url("/ping")).send().await.unwrap();
    let lines: Vec<_> = response
        .headers()
        .get_all("x-reload-error")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert_eq!(response.text().await.unwrap(), "one");
    assert!(lines.len() >= 8, "got {lines:?}");
    assert_eq!(lines[0], "-".repeat(60));
    assert!(lines
        .last()
        .unwrap()
        .contains("/_internal/reload/errors"));

    let (status, errors) = get_text(&client, &server.url("/_internal/reload/errors")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(errors.contains("error: on reload"));
    assert!(errors.contains("unknown proxy"));

    server.write(DEFAULT_SERVER, &PING_ROUTE.replace("${version}", "two"));
    assert!(orchestrator.reload(&mut rx).await);

    let response = client.get(server.url("/ping")).send().await.unwrap();
    assert!(response.headers().get("x-reload-error").is_none());
    assert_eq!(response.text().await.unwrap(), "two");

    orchestrator.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_run_loop_reloads_on_signal_and_stops_on_shutdown() {
    let server = TestServer::new(
        DEFAULT_SERVER,
        &PING_ROUTE.replace("${version}", "before"),
    );
    let orchestrator = server.start().await;
    let (tx, rx) = mpsc::channel(1);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(orchestrator.run(rx, async {
        let _ = stop_rx.await;
    }));

    let client = client();
    server.write(DEFAULT_SERVER, &PING_ROUTE.replace("${version}", "after"));
    tx.send(()).await.unwrap();

    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        if let Ok(response) = client.get(server.url("/ping")).send().await {
            if response.text().await.unwrap_or_default() == "after" {
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "reload not observed in time"
        );
        sleep(Duration::from_millis(50)).await;
    }

    stop_tx.send(()).unwrap();
    tokio::time::timeout(TEST_TIMEOUT, task)
        .await
        .expect("run loop did not stop")
        .unwrap();
    assert!(client.get(server.url("/ping")).send().await.is_err());
}

/// Answers every request with `203` and a JSON echo of its path and headers.
async fn start_echo_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(|req: hyper::Request<Incoming>| async move {
                    let mut headers = serde_json::Map::new();
                    for (name, value) in req.headers() {
                        let values = headers
                            .entry(name.as_str())
                            .or_insert_with(|| json!([]));
                        if let Value::Array(items) = values {
                            items.push(json!(value.to_str().unwrap_or_default()));
                        }
                    }
                    let body = json!({
                        "path": req.uri().path_and_query().map(|p| p.as_str()),
                        "headers": headers,
                    });
                    Ok::<_, Infallible>(
                        hyper::Response::builder()
                            .status(203)
                            .header("x-upstream", "echo")
                            .body(Full::new(Bytes::from(body.to_string())))
                            .unwrap(),
                    )
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    port
}

#[tokio::test]
async fn test_proxy_status_merges_headers_by_precedence() {
    let upstream = start_echo_upstream().await;
    let server = TestServer::new(
        &format!(
            r#"
servers:
  - name: test
    host: 127.0.0.1:{{port}}
    proxy:
      - name: upstream
        url: http://127.0.0.1:{upstream}/
        headers:
          x-layer: target
          x-target: target
"#
        ),
        r#"
routes:
  - path: /profile
    requests:
      - method: get
        responses:
          - status: upstream
            headers:
              x-layer: response
  - path: /whole
    proxy:
      name: upstream
      headers:
        x-route: "yes"
    requests:
      - method: get
"#,
    );
    let orchestrator = server.start().await;
    let client = client();

    let response = client
        .get(server.url("/profile?id=7"))
        .header("x-layer", "inbound")
        .header("x-target", "inbound")
        .header("x-inbound", "kept")
        .header("keep-alive", "timeout=5")
        .header("proxy-authorization", "Basic Zm9vOmJhcg==")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NON_AUTHORITATIVE_INFORMATION);
    assert_eq!(response.headers()["x-upstream"], "echo");
    let echo: Value = response.json().await.unwrap();
    assert_eq!(echo["path"], "/profile?id=7");
    let headers = &echo["headers"];
    assert_eq!(headers["x-layer"], json!(["response"]));
    assert_eq!(headers["x-target"], json!(["target"]));
    assert_eq!(headers["x-inbound"], json!(["kept"]));
    assert!(headers.get("keep-alive").is_none());
    assert!(headers.get("proxy-authorization").is_none());
    assert_eq!(headers["host"], json!([format!("127.0.0.1:{upstream}")]));

    let echo: Value = client
        .get(server.url("/whole"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(echo["headers"]["x-route"], json!(["yes"]));
    assert_eq!(echo["headers"]["x-layer"], json!(["target"]));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_http2_only_listener_rejects_http1() {
    let server = TestServer::new(
        r#"
servers:
  - name: h2
    host: 127.0.0.1:{port}
    http2_only: true
"#,
        &PING_ROUTE.replace("${version}", "pong"),
    );
    let orchestrator = server.start().await;

    let response = client().get(server.url("/ping")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);

    let h2 = Client::builder()
        .http2_prior_knowledge()
        .timeout(TEST_TIMEOUT)
        .build()
        .unwrap();
    let response = h2.get(server.url("/ping")).send().await.unwrap();
    assert_eq!(response.version(), Version::HTTP_2);
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "pong");

    orchestrator.shutdown().await;
}

/// Panics inside the request pipeline when asked to.
struct PanickingPlugin;

impl Plugin for PanickingPlugin {
    fn name(&self) -> &str {
        "panicking"
    }

    fn pre_request(&self) -> Option<&dyn PreRequestHook> {
        Some(self)
    }
}

#[async_trait]
impl PreRequestHook for PanickingPlugin {
    async fn before(&self, request: &RequestFacts) -> Result<(), HookError> {
        if request.header("x-explode").is_some() {
            panic!("hook exploded");
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_panicking_request_is_recovered_and_persisted() {
    let server = TestServer::new(
        DEFAULT_SERVER,
        r#"
routes:
  - path: /fragile
    requests:
      - method: get
        responses:
          - body: intact
"#,
    );
    let mut plugins = PluginRegistry::new();
    plugins.register(Arc::new(PanickingPlugin));
    let orchestrator = server.start_with(plugins).await;
    let client = client();

    let response = client
        .get(server.url("/fragile"))
        .header("x-explode", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let (status, body) = get_text(&client, &server.url("/fragile")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "intact");

    let panic_files: Vec<_> = std::fs::read_dir(server.log_dir())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with("-panic.txt"))
        .collect();
    assert_eq!(panic_files.len(), 1);

    let (status, errors) = get_text(&client, &server.url("/_internal/reload/errors")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(errors.contains("error: on panic"), "{errors}");
    assert!(errors.contains("hook exploded"), "{errors}");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_listeners_share_route_table() {
    let other = port_check::free_local_port().expect("no free port");
    let server = TestServer::new(
        &format!(
            r#"
servers:
  - name: open
    host: 127.0.0.1:{{port}}
  - name: guarded
    host: 127.0.0.1:{other}
    basic_auth:
      username: admin
      password: s3cret
"#
        ),
        r#"
routes:
  - path: /count
    requests:
      - method: get
        responses:
          - body: first
          - body: second
"#,
    );
    let orchestrator = server.start().await;
    let client = client();
    let other_url = format!("http://127.0.0.1:{other}/count");

    assert_eq!(orchestrator.local_addrs().len(), 2);

    let (_, body) = get_text(&client, &server.url("/count")).await;
    assert_eq!(body, "first");

    let response = client.get(&other_url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // the rotation state belongs to the route, not the listener
    let response = client
        .get(&other_url)
        .basic_auth("admin", Some("s3cret"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "second");

    orchestrator.shutdown().await;
    assert!(client.get(&other_url).send().await.is_err());
}

#[tokio::test]
async fn test_shutdown_closes_stuck_requests_after_timeout() {
    let server = TestServer::new(
        DEFAULT_SERVER,
        r#"
routes:
  - path: /stuck
    requests:
      - method: get
        delay: 60s
        responses:
          - body: never
"#,
    );
    let orchestrator = server.start().await;
    let url = server.url("/stuck");
    let pending = tokio::spawn(async move { client().get(url).send().await });
    sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    orchestrator.shutdown().await;
    let elapsed = started.elapsed();
    assert!(
        elapsed >= SHUTDOWN_TIMEOUT - Duration::from_millis(500),
        "stopped after {elapsed:?}"
    );
    assert!(
        elapsed < SHUTDOWN_TIMEOUT + Duration::from_secs(3),
        "stopped after {elapsed:?}"
    );

    let result = tokio::time::timeout(TEST_TIMEOUT, pending)
        .await
        .expect("client still waiting")
        .unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_self_referencing_text_block_is_bad_request() {
    let server = TestServer::new(
        DEFAULT_SERVER,
        r#"
texts:
  - name: loop
    data: "x${text(\"loop\")}"
routes:
  - path: /t
    requests:
      - method: get
        responses:
          - body: "${text(\"loop\")}"
  - path: /ok
    requests:
      - method: get
        responses:
          - body: fine
"#,
    );
    let orchestrator = server.start().await;
    let client = client();

    let (status, body) = get_text(&client, &server.url("/t")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Bad Request\n");

    let (status, body) = get_text(&client, &server.url("/ok")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "fine");

    orchestrator.shutdown().await;
}
