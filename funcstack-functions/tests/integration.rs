//! Integration tests for the function server
//!
//! Each test serves the function router on an ephemeral port. Worker-mode
//! functions are `sh` scripts; in-process functions are registered in the
//! handler table under the path of a placeholder `.js` file.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use base64::{engine::general_purpose, Engine};
use http::Request;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower::ServiceExt;

use funcstack_functions::{
    handler_fn, router, Dispatcher, Executor, FunctionRegistry, FunctionSettings, FunctionsState,
    GeoMode, HandlerTable, IdentityProvider, InvocationContext, InvocationError, InvocationEvent,
    NativeHandler, RequestAdapter, ScriptBuilder, StaticGeoLocator, Timeouts, WorkerConfig,
};

struct Fixture {
    dir: TempDir,
    handlers: Arc<HandlerTable>,
    settings: HashMap<String, FunctionSettings>,
    timeouts: Timeouts,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            handlers: Arc::new(HandlerTable::new()),
            settings: HashMap::new(),
            timeouts: Timeouts::default(),
        }
    }

    /// Worker-mode function backed by a shell script
    fn script(self, name: &str, body: &str) -> Self {
        std::fs::write(self.dir.path().join(format!("{name}.sh")), body).unwrap();
        self
    }

    /// In-process function
    fn native(mut self, name: &str, handler: Arc<dyn NativeHandler>) -> Self {
        let path = self.dir.path().join(format!("{name}.js"));
        std::fs::write(&path, "").unwrap();
        self.handlers.register(&path, handler);
        self.settings.entry(name.to_string()).or_default().runtime_api_version = Some(1);
        self
    }

    fn schedule(mut self, name: &str, expression: &str) -> Self {
        self.settings.entry(name.to_string()).or_default().schedule = Some(expression.to_string());
        self
    }

    fn route(mut self, name: &str, path: &str) -> Self {
        self.settings.entry(name.to_string()).or_default().path = Some(path.to_string());
        self
    }

    fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.synchronous = timeout;
        self
    }

    async fn state(self) -> (Arc<FunctionsState>, TempDir) {
        let builder = ScriptBuilder::default().with_settings(self.settings);
        let registry = Arc::new(FunctionRegistry::new(vec![Arc::new(builder)]));
        registry.scan(&[self.dir.path().to_path_buf()]).await;

        let executor = Arc::new(Executor::new(
            self.handlers,
            WorkerConfig {
                program: "sh".to_string(),
                args: Vec::new(),
            },
            HashMap::from([("SITE_NAME".to_string(), "funcstack-test".to_string())]),
        ));
        let adapter = RequestAdapter::new(
            IdentityProvider::new("http://localhost:8888"),
            Arc::new(StaticGeoLocator::default()),
            GeoMode::Mock,
            6 * 1024 * 1024,
        );
        let dispatcher = Dispatcher::new(executor, self.timeouts);

        (
            Arc::new(FunctionsState::new(registry, adapter, dispatcher)),
            self.dir,
        )
    }

    async fn start(self) -> TestServer {
        let (state, dir) = self.state().await;
        let registry = state.registry.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                router(state).into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        TestServer {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            registry,
            dir,
        }
    }
}

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    registry: Arc<FunctionRegistry>,
    dir: TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }

    fn dir(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }
}

/// Collects log output of the current thread
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn respond(value: Value) -> Arc<dyn NativeHandler> {
    handler_fn(move |_event: InvocationEvent, _context: InvocationContext| {
        let value = value.clone();
        async move { Ok(value) }
    })
}

#[tokio::test]
async fn test_synchronous_function_returns_body() {
    let server = Fixture::new()
        .script(
            "hello",
            r#"cat >/dev/null
echo '{"statusCode":200,"body":"hi"}'
"#,
        )
        .start()
        .await;

    let response = server.get("/.netlify/functions/hello").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-nf-request-id"));
    assert_eq!(response.text().await.unwrap(), "hi");
}

#[tokio::test]
async fn test_thrown_error_returns_500_with_stack() {
    let server = Fixture::new()
        .native(
            "boom",
            handler_fn(|_event, _context| async {
                Err(InvocationError::new("Error", "boom").with_stack_trace(vec![
                    "Error: boom".to_string(),
                    "    at handler (boom.js:2:9)".to_string(),
                ]))
            }),
        )
        .script(
            "boom-worker",
            r#"cat >/dev/null
printf '%s\n' '{"errorType":"Error","errorMessage":"boom","stackTrace":"Error: boom\n    at handler"}'
"#,
        )
        .start()
        .await;

    for name in ["boom", "boom-worker"] {
        let response = server
            .client
            .get(server.url(&format!("/.netlify/functions/{name}")))
            .header("accept", "application/json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body: Value = response.json().await.unwrap();
        assert_eq!(body["errorType"], "Error");
        assert_eq!(body["errorMessage"], "boom");
        assert_eq!(body["stackTrace"].as_array().unwrap().len(), 2);
    }

    let html = server
        .client
        .get(server.url("/.netlify/functions/boom"))
        .header("accept", "text/html")
        .send()
        .await
        .unwrap();
    assert_eq!(html.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let text = html.text().await.unwrap();
    assert!(text.contains("<h2>Error: boom</h2>"));
    assert!(text.contains("at handler (boom.js:2:9)"));
}

#[tokio::test]
async fn test_background_function_answers_before_completion() {
    let release = Arc::new(Notify::new());
    let finished = Arc::new(AtomicBool::new(false));

    let handler = {
        let release = release.clone();
        let finished = finished.clone();
        handler_fn(move |_event, _context| {
            let release = release.clone();
            let finished = finished.clone();
            async move {
                release.notified().await;
                finished.store(true, Ordering::SeqCst);
                Ok(json!({"statusCode": 200, "body": "ignored"}))
            }
        })
    };

    let server = Fixture::new()
        .native("send-email-background", handler)
        .start()
        .await;

    let response = server.get("/.netlify/functions/send-email-background").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(response.bytes().await.unwrap().is_empty());
    assert!(!finished.load(Ordering::SeqCst));

    release.notify_one();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !finished.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_failing_background_function_still_accepted() {
    let logs = LogCapture::default();
    let _guard = logs.install();

    let (state, _dir) = Fixture::new()
        .native(
            "cleanup-background",
            handler_fn(|_event, _context| async {
                Err(InvocationError::new("Error", "disk full")
                    .with_stack_trace(vec!["    at cleanup (cleanup.js:4:11)".to_string()]))
            }),
        )
        .state()
        .await;

    let response = router(state)
        .oneshot(
            Request::builder()
                .uri("/.netlify/functions/cleanup-background")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::ACCEPTED);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(body.is_empty());

    tokio::time::timeout(Duration::from_secs(5), async {
        while !logs.contents().contains("Background function failed") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let contents = logs.contents();
    assert!(contents.contains("disk full"));
    assert!(contents.contains("at cleanup (cleanup.js:4:11)"));
}

#[tokio::test]
async fn test_failed_invocation_logs_stack() {
    let logs = LogCapture::default();
    let _guard = logs.install();

    let (state, _dir) = Fixture::new()
        .native(
            "boom",
            handler_fn(|_event, _context| async {
                Err(InvocationError::new("Error", "boom")
                    .with_stack_trace(vec!["    at handler (boom.js:2:9)".to_string()]))
            }),
        )
        .state()
        .await;

    let response = router(state)
        .oneshot(
            Request::builder()
                .uri("/.netlify/functions/boom")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::INTERNAL_SERVER_ERROR);

    let contents = logs.contents();
    assert!(contents.contains("Function invocation failed"));
    assert!(contents.contains("function=boom"));
    assert!(contents.contains("at handler (boom.js:2:9)"));
}

#[tokio::test]
async fn test_requests_without_length_headers_have_no_body() {
    let echo = handler_fn(|event: InvocationEvent, _context| async move {
        let body = match event.body {
            Some(body) => format!("some:{body}"),
            None => "none".to_string(),
        };
        Ok(json!({"statusCode": 200, "body": body}))
    });
    let server = Fixture::new().native("echo", echo).start().await;

    let response = server.get("/.netlify/functions/echo").await;
    assert_eq!(response.text().await.unwrap(), "none");

    let response = server
        .client
        .post(server.url("/.netlify/functions/echo"))
        .header("content-type", "text/plain")
        .body("data")
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "some:data");
}

#[tokio::test]
async fn test_binary_body_round_trip() {
    let mirror = handler_fn(|event: InvocationEvent, _context| async move {
        Ok(json!({
            "statusCode": 200,
            "headers": {"content-type": "application/octet-stream"},
            "body": event.body,
            "isBase64Encoded": event.is_base64_encoded,
        }))
    });
    let server = Fixture::new().native("mirror", mirror).start().await;

    let bytes: Vec<u8> = (0u8..=255).rev().collect();
    let response = server
        .client
        .post(server.url("/.netlify/functions/mirror"))
        .header("content-type", "image/png")
        .body(bytes.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().to_vec(), bytes);
}

#[tokio::test]
async fn test_query_parameters_collapse() {
    let query = handler_fn(|event: InvocationEvent, _context| async move {
        let body = json!({
            "single": event.query_string_parameters,
            "multi": event.multi_value_query_string_parameters,
        });
        Ok(json!({"statusCode": 200, "body": body.to_string()}))
    });
    let server = Fixture::new().native("query", query).start().await;

    let response = server
        .get("/.netlify/functions/query?category=one&category=two")
        .await;
    let body: Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(body["single"]["category"], "one, two");
    assert_eq!(body["multi"]["category"], json!(["one", "two"]));
}

#[tokio::test]
async fn test_builder_requires_metadata() {
    let server = Fixture::new()
        .native("plain", respond(json!({"statusCode": 200, "body": "plain"})))
        .native(
            "page",
            respond(json!({
                "statusCode": 200,
                "body": "page",
                "metadata": {"version": 1, "builder_function": true, "ttl": 0},
            })),
        )
        .start()
        .await;

    let response = server.get("/.netlify/builders/plain").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["errorType"], "MissingBuilderMetadata");
    assert!(body["errorMessage"]
        .as_str()
        .unwrap()
        .contains("/.netlify/functions/plain"));

    let response = server.get("/.netlify/functions/plain").await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = server.get("/.netlify/builders/page").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "page");
}

#[tokio::test]
async fn test_missing_status_code_is_reported() {
    let server = Fixture::new()
        .native("nostatus", respond(json!({"body": "x"})))
        .start()
        .await;

    let response = server.get("/.netlify/functions/nostatus").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["errorType"], "ValidationError");
    let message = body["errorMessage"].as_str().unwrap();
    assert!(message.contains("statusCode"));
    assert!(message.contains("undefined"));
}

#[tokio::test]
async fn test_workers_share_no_state() {
    let server = Fixture::new()
        .script(
            "counter",
            r#"cat >/dev/null
COUNTER=$(( ${COUNTER:-0} + 1 ))
export COUNTER
sleep 0.2
printf '{"statusCode":200,"body":"%s-%s"}\n' "$COUNTER" "$$"
"#,
        )
        .start()
        .await;

    let (first, second) = tokio::join!(
        server.get("/.netlify/functions/counter"),
        server.get("/.netlify/functions/counter"),
    );
    let first = first.text().await.unwrap();
    let second = second.text().await.unwrap();

    let (first_count, first_pid) = first.split_once('-').unwrap();
    let (second_count, second_pid) = second.split_once('-').unwrap();
    assert_eq!(first_count, "1");
    assert_eq!(second_count, "1");
    assert_ne!(first_pid, second_pid);
}

#[tokio::test]
async fn test_worker_receives_environment_and_event() {
    let server = Fixture::new()
        .script(
            "env",
            r#"input=$(cat)
case "$input" in
  *'"httpMethod":"PUT"'*) method=put ;;
  *) method=other ;;
esac
printf '{"statusCode":200,"body":"%s:%s"}\n' "$SITE_NAME" "$method"
"#,
        )
        .start()
        .await;

    let response = server
        .client
        .put(server.url("/.netlify/functions/env"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "funcstack-test:put");
}

#[tokio::test]
async fn test_worker_timeout() {
    let server = Fixture::new()
        .script("slow", "cat >/dev/null\nsleep 5\n")
        .sync_timeout(Duration::from_millis(300))
        .start()
        .await;

    let response = server.get("/.netlify/functions/slow").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["errorType"], "Runtime.TimeoutError");
}

#[tokio::test]
async fn test_streamed_response_body() {
    // The worker serves its own stream port and exits once the body is sent
    let server = Fixture::new()
        .script(
            "stream",
            r#"cat >/dev/null
exec perl -MIO::Socket::INET -e '
$| = 1;
my $server = IO::Socket::INET->new(LocalAddr => "127.0.0.1", LocalPort => 0, Listen => 1, ReuseAddr => 1) or die "listen: $!";
printf "{\"streamPort\":%d,\"statusCode\":200,\"headers\":{\"content-type\":\"text/plain\"}}\n", $server->sockport;
my $client = $server->accept;
for my $chunk ("streamed ", "response ", "body") {
    syswrite($client, $chunk);
    select(undef, undef, undef, 0.02);
}
close $client;
'
"#,
        )
        .sync_timeout(Duration::from_secs(5))
        .start()
        .await;

    let started = std::time::Instant::now();
    let response = server.get("/.netlify/functions/stream").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.text().await.unwrap(), "streamed response body");
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_scheduled_function_gets_synthetic_event() {
    let server = Fixture::new()
        .script(
            "nightly",
            r#"input=$(cat)
case "$input" in
  *'"x-nf-event":"schedule"'*'"next_run'*) echo '{"statusCode":200,"body":"ran"}' ;;
  *'"next_run'*'"x-nf-event":"schedule"'*) echo '{"statusCode":200,"body":"ran"}' ;;
  *) echo '{"statusCode":500,"body":"not a schedule event"}' ;;
esac
"#,
        )
        .schedule("nightly", "@daily")
        .start()
        .await;

    let response = server.get("/.netlify/functions/nightly").await;
    assert_eq!(response.status(), StatusCode::OK);
    let text = response.text().await.unwrap();
    assert!(text.contains("which is a scheduled function"));
    assert!(text.contains("Schedule: @daily"));
    assert!(text.contains("Next run: "));
    assert!(text.contains("ran"));
}

#[tokio::test]
async fn test_unknown_and_invalid_functions() {
    let fixture = Fixture::new().native("bad name", respond(json!({"statusCode": 200})));
    let (state, _dir) = fixture.state().await;
    let app = router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/.netlify/functions/missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/not-a-function").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::NOT_FOUND);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/.netlify/functions/bad%20name")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_custom_route_and_routing_headers() {
    let route_echo = handler_fn(|event: InvocationEvent, _context| async move {
        Ok(json!({
            "statusCode": 200,
            "body": format!("{}|{}", event.path, event.route.unwrap_or_default()),
        }))
    });
    let server = Fixture::new()
        .native("items", route_echo)
        .route("items", "/api/items")
        .start()
        .await;

    let response = server.get("/api/items").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "/api/items|/api/items");

    let response = server
        .client
        .get(server.url("/anything"))
        .header("x-nf-function-name", "items")
        .header("x-nf-function-route", "/anything/:id")
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "/anything|/anything/:id");
}

#[tokio::test]
async fn test_client_context_from_bearer_token() {
    let whoami = handler_fn(|_event, context: InvocationContext| async move {
        let email = context
            .client_context
            .map(|c| c.user["email"].as_str().unwrap_or_default().to_string())
            .unwrap_or_else(|| "anonymous".to_string());
        Ok(json!({"statusCode": 200, "body": email}))
    });
    let server = Fixture::new().native("whoami", whoami).start().await;

    let header = general_purpose::URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = general_purpose::URL_SAFE_NO_PAD.encode(br#"{"email":"dev@example.com"}"#);
    let token = format!("{header}.{payload}.unsigned");

    let response = server
        .client
        .get(server.url("/.netlify/functions/whoami"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "dev@example.com");

    let response = server.get("/.netlify/functions/whoami").await;
    assert_eq!(response.text().await.unwrap(), "anonymous");
}

#[tokio::test]
async fn test_watcher_picks_up_new_functions() {
    let server = Fixture::new()
        .script("first", "cat >/dev/null\necho '{\"statusCode\":200,\"body\":\"first\"}'\n")
        .start()
        .await;
    let _watcher = server.registry.watch(Duration::from_millis(50)).unwrap();

    std::fs::write(
        server.dir().join("second.sh"),
        "cat >/dev/null\necho '{\"statusCode\":200,\"body\":\"second\"}'\n",
    )
    .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while server.registry.get("second").is_none() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap();

    let response = server.get("/.netlify/functions/second").await;
    assert_eq!(response.text().await.unwrap(), "second");
}
