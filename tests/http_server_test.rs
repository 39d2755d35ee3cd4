//! End-to-end tests driving a bound server over real connections.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Client, Request, StatusCode};
use prometheus::Registry;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use eventmesh_http_handler::{
    AsyncContext, BoxError, ChannelContext, CodeCommand, CodeProcessor, Config,
    EventMeshHttpServer, EventProcessor, EventWrapper, RegistrationError, RequestCode, RetCode,
    WorkerPool,
};

struct EchoCodeProcessor {
    invocations: Arc<AtomicUsize>,
}

impl CodeProcessor for EchoCodeProcessor {
    fn process_request(
        &self,
        _channel: &ChannelContext,
        ctx: &Arc<AsyncContext<CodeCommand>>,
    ) -> Result<(), BoxError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let mut payload = Map::new();
        payload.insert("msgId".to_owned(), Value::from("m-1"));
        let response = ctx.request().create_http_command_response_with_body(
            RetCode::Success,
            "success".to_owned(),
            payload,
        );
        ctx.on_complete(response);
        Ok(())
    }
}

struct SleepyCodeProcessor {
    hold: Duration,
}

impl CodeProcessor for SleepyCodeProcessor {
    fn process_request(
        &self,
        _channel: &ChannelContext,
        ctx: &Arc<AsyncContext<CodeCommand>>,
    ) -> Result<(), BoxError> {
        std::thread::sleep(self.hold);
        let response = ctx
            .request()
            .create_http_command_response(RetCode::Success, "success".to_owned());
        ctx.on_complete(response);
        Ok(())
    }
}

struct FailingCodeProcessor;

impl CodeProcessor for FailingCodeProcessor {
    fn process_request(
        &self,
        _channel: &ChannelContext,
        _ctx: &Arc<AsyncContext<CodeCommand>>,
    ) -> Result<(), BoxError> {
        Err("backend exploded".into())
    }
}

struct RejectingCodeProcessor;

impl CodeProcessor for RejectingCodeProcessor {
    fn reject_request(&self) -> bool {
        true
    }

    fn process_request(
        &self,
        _channel: &ChannelContext,
        _ctx: &Arc<AsyncContext<CodeCommand>>,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Echoes the decoded body back so tests can verify the canonical bytes.
struct EchoEventProcessor;

impl EventProcessor for EchoEventProcessor {
    fn process_request(
        &self,
        _channel: &ChannelContext,
        ctx: &Arc<AsyncContext<EventWrapper>>,
    ) -> Result<(), BoxError> {
        let body = ctx.request().body_bytes.clone();
        let response = ctx.request().create_http_response_with_body(
            RetCode::Success,
            "success".to_owned(),
            body,
        );
        ctx.on_complete(response);
        Ok(())
    }
}

/// Completes on the completer pool instead of inline.
struct DeferredEventProcessor;

impl EventProcessor for DeferredEventProcessor {
    fn process_request(
        &self,
        _channel: &ChannelContext,
        ctx: &Arc<AsyncContext<EventWrapper>>,
    ) -> Result<(), BoxError> {
        let deferred = Arc::clone(ctx);
        ctx.completer().try_submit(move || {
            let response = deferred
                .request()
                .create_http_response(RetCode::Success, "deferred".to_owned());
            deferred.on_complete(response);
        })?;
        Ok(())
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.listen_addr = "127.0.0.1:0".parse().unwrap();
    config
}

async fn start_server<F>(config: Config, register: F) -> (EventMeshHttpServer, SocketAddr, Registry)
where
    F: FnOnce(&EventMeshHttpServer),
{
    let registry = Registry::new();
    let server = EventMeshHttpServer::new(config, None, &registry).unwrap();
    register(&server);
    let addr = server.start().await.unwrap();
    (server, addr, registry)
}

async fn post_json(
    addr: SocketAddr,
    path: &str,
    headers: &[(&str, &str)],
    body: Value,
) -> (StatusCode, Value) {
    let client = Client::new();
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("http://{}{}", addr, path))
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = client.request(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn counter_value(registry: &Registry, name: &str) -> f64 {
    registry
        .gather()
        .into_iter()
        .find(|family| family.get_name() == name)
        .map(|family| {
            family
                .get_metric()
                .iter()
                .map(|metric| metric.get_counter().get_value())
                .sum()
        })
        .unwrap_or(0.0)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Reads one HTTP response off a raw socket: the head up to the blank
/// line, then exactly content-length body bytes.
async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before a full response head");
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subsequence(&buffer, b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);
    let mut body = buffer[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before a full response body");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    (head, body)
}

#[tokio::test]
async fn code_path_round_trip() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&invocations);
    let (server, addr, _) = start_server(test_config(), move |server| {
        let pool = WorkerPool::new("sync-msg", 2, 16).unwrap();
        server
            .register_code_processor(
                RequestCode::MsgSendSync,
                Arc::new(EchoCodeProcessor { invocations: seen }),
                pool,
            )
            .unwrap();
    })
    .await;

    let (status, envelope) = post_json(
        addr,
        "/",
        &[("version", "1.0"), ("code", "101")],
        json!({"code": "101", "topic": "T"}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope["retCode"], Value::from(0));
    assert_eq!(envelope["retMsg"], Value::from("success"));
    assert_eq!(envelope["msgId"], Value::from("m-1"));
    assert!(envelope.get("resTime").is_some());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn get_requests_read_the_code_from_the_query_string() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&invocations);
    let (server, addr, _) = start_server(test_config(), move |server| {
        let pool = WorkerPool::new("heartbeat", 1, 8).unwrap();
        server
            .register_code_processor(
                RequestCode::Heartbeat,
                Arc::new(EchoCodeProcessor { invocations: seen }),
                pool,
            )
            .unwrap();
    })
    .await;

    let client = Client::new();
    let request = Request::builder()
        .method("GET")
        .uri(format!("http://{}/?code=203&client=c1", addr))
        .header("version", "1.0")
        .body(Body::empty())
        .unwrap();
    let response = client.request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let envelope: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(envelope["retCode"], Value::from(0));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_code_keeps_the_connection_alive() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&invocations);
    let (server, addr, _) = start_server(test_config(), move |server| {
        let pool = WorkerPool::new("sync-msg", 1, 8).unwrap();
        server
            .register_code_processor(
                RequestCode::MsgSendSync,
                Arc::new(EchoCodeProcessor { invocations: seen }),
                pool,
            )
            .unwrap();
    })
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let unknown = format!(
        "POST / HTTP/1.1\r\nHost: {}\r\nversion: 1.0\r\ncode: 9999\r\nContent-Length: 0\r\n\r\n",
        addr
    );
    stream.write_all(unknown.as_bytes()).await.unwrap();
    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    let envelope: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        envelope["retCode"],
        Value::from(RetCode::RequestCodeInvalid.value())
    );
    // No processor ran for the unroutable code.
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    // Same connection serves the next, valid request.
    let valid = format!(
        "POST / HTTP/1.1\r\nHost: {}\r\nversion: 1.0\r\ncode: 101\r\nContent-Length: 0\r\n\r\n",
        addr
    );
    stream.write_all(valid.as_bytes()).await.unwrap();
    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    let envelope: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(envelope["retCode"], Value::from(0));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn uri_route_body_round_trips_through_canonical_json() {
    let (server, addr, _) = start_server(test_config(), |server| {
        let pool = WorkerPool::new("publish", 2, 16).unwrap();
        server
            .register_uri_processor("/eventmesh/", Arc::new(EchoEventProcessor), pool)
            .unwrap();
    })
    .await;

    let original = json!({"topic": "T", "payload": "P"});
    let (status, echoed) = post_json(
        addr,
        "/eventmesh/publish",
        &[("version", "1.0")],
        original.clone(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(echoed, original);

    server.shutdown().await;
}

#[tokio::test]
async fn deferred_completion_still_answers_the_client() {
    let (server, addr, _) = start_server(test_config(), |server| {
        let pool = WorkerPool::new("deferred", 1, 8).unwrap();
        server
            .register_uri_processor("/deferred/", Arc::new(DeferredEventProcessor), pool)
            .unwrap();
    })
    .await;

    let (status, envelope) =
        post_json(addr, "/deferred/work", &[("version", "1.0")], json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope["retCode"], Value::from(0));
    assert_eq!(envelope["retMsg"], Value::from("deferred"));

    server.shutdown().await;
}

#[tokio::test]
async fn processor_failure_synthesizes_a_runtime_error() {
    let (server, addr, _) = start_server(test_config(), |server| {
        let pool = WorkerPool::new("failing", 1, 8).unwrap();
        server
            .register_code_processor(
                RequestCode::MsgBatchSend,
                Arc::new(FailingCodeProcessor),
                pool,
            )
            .unwrap();
    })
    .await;

    let (status, envelope) = post_json(
        addr,
        "/",
        &[("version", "1.0"), ("code", "102")],
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        envelope["retCode"],
        Value::from(RetCode::RuntimeError.value())
    );

    server.shutdown().await;
}

#[tokio::test]
async fn self_rejecting_processor_answers_with_its_result_code() {
    let (server, addr, _) = start_server(test_config(), |server| {
        let pool = WorkerPool::new("rejecting", 1, 8).unwrap();
        server
            .register_code_processor(
                RequestCode::Heartbeat,
                Arc::new(RejectingCodeProcessor),
                pool,
            )
            .unwrap();
    })
    .await;

    let (status, envelope) = post_json(
        addr,
        "/",
        &[("version", "1.0"), ("code", "203")],
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        envelope["retCode"],
        Value::from(RetCode::RejectedByProcessor.value())
    );

    server.shutdown().await;
}

#[tokio::test]
async fn unsupported_method_is_refused_and_the_channel_closes() {
    let (server, addr, _) = start_server(test_config(), |server| {
        let pool = WorkerPool::new("sync-msg", 1, 8).unwrap();
        server
            .register_code_processor(
                RequestCode::MsgSendSync,
                Arc::new(EchoCodeProcessor {
                    invocations: Arc::new(AtomicUsize::new(0)),
                }),
                pool,
            )
            .unwrap();
    })
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "PUT /anything HTTP/1.1\r\nHost: {}\r\nversion: 1.0\r\nContent-Length: 0\r\n\r\n",
        addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 405"));
    assert!(head.to_lowercase().contains("content-type: text/plain; charset=utf-8"));
    assert!(String::from_utf8_lossy(&body).contains("405"));

    // The server closes the channel after the flush.
    let mut probe = [0u8; 1];
    let n = stream.read(&mut probe).await.unwrap();
    assert_eq!(n, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_protocol_version_is_a_bad_request() {
    let (server, addr, _) = start_server(test_config(), |_| {}).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "POST / HTTP/1.1\r\nHost: {}\r\nversion: 9.9\r\nContent-Length: 0\r\n\r\n",
        addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let (head, _) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 400"));

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn saturated_route_pool_sheds_load_without_closing_connections() {
    let (server, addr, registry) = start_server(test_config(), |server| {
        let pool = WorkerPool::new("slow", 1, 1).unwrap();
        server
            .register_code_processor(
                RequestCode::MsgSendSync,
                Arc::new(SleepyCodeProcessor {
                    hold: Duration::from_millis(600),
                }),
                pool,
            )
            .unwrap();
    })
    .await;

    let mut requests = Vec::new();
    for idx in 0..3 {
        let request = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100 * idx)).await;
            // A client per request forces three distinct connections.
            post_json(addr, "/", &[("version", "1.0"), ("code", "101")], json!({})).await
        });
        requests.push(request);
    }

    let mut ret_codes = Vec::new();
    for request in requests {
        let (status, envelope) = request.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        ret_codes.push(envelope["retCode"].as_i64().unwrap());
    }
    ret_codes.sort_unstable();
    assert_eq!(ret_codes, vec![0, 0, i64::from(RetCode::Overload.value())]);
    assert_eq!(
        counter_value(&registry, "eventmesh_http_discarded_requests_total"),
        1.0
    );

    server.shutdown().await;
}

#[tokio::test]
async fn connections_beyond_the_cap_are_dropped_before_any_exchange() {
    let mut config = test_config();
    config.max_connections = 3;
    let (server, addr, _) = start_server(config, |_| {}).await;

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(TcpStream::connect(addr).await.unwrap());
    }
    // Wait until the gate has counted all three.
    for _ in 0..50 {
        if server.live_connections() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.live_connections(), 3);

    let mut fourth = TcpStream::connect(addr).await.unwrap();
    let mut probe = [0u8; 1];
    let n = fourth.read(&mut probe).await.unwrap();
    assert_eq!(n, 0, "the connection over the cap must be closed unanswered");

    drop(held);
    drop(fourth);
    for _ in 0..100 {
        if server.live_connections() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.live_connections(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn idle_connections_are_closed() {
    let mut config = test_config();
    config.idle_timeout_ms = 100;
    let (server, addr, _) = start_server(config, |_| {}).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut probe = [0u8; 1];
    // No bytes ever flow; the server should hang up on its own.
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut probe))
        .await
        .expect("idle connection was not closed")
        .unwrap();
    assert_eq!(n, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn bound_port_is_reported_to_the_port_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("http.port");
    let mut config = test_config();
    config.port_file_path = Some(path.clone());
    let (server, addr, _) = start_server(config, |_| {}).await;

    let reported = std::fs::read_to_string(&path).unwrap();
    assert_eq!(reported, addr.port().to_string());

    server.shutdown().await;
}

#[tokio::test]
async fn registration_is_closed_once_started() {
    let (server, _addr, _) = start_server(test_config(), |_| {}).await;

    let pool = WorkerPool::new("late", 1, 4).unwrap();
    let err = server
        .register_code_processor(
            RequestCode::MsgSendSync,
            Arc::new(EchoCodeProcessor {
                invocations: Arc::new(AtomicUsize::new(0)),
            }),
            Arc::clone(&pool),
        )
        .unwrap_err();
    assert!(matches!(err, RegistrationError::ServerStarted));
    let err = server
        .register_uri_processor("/late/", Arc::new(EchoEventProcessor), pool)
        .unwrap_err();
    assert!(matches!(err, RegistrationError::ServerStarted));

    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_idempotent_and_stops_accepting() {
    let (server, addr, _) = start_server(test_config(), |_| {}).await;
    assert!(server.is_started());

    server.shutdown().await;
    server.shutdown().await;
    assert!(!server.is_started());

    // The listener is gone; a new connection either fails outright or is
    // closed without ever being served.
    match TcpStream::connect(addr).await {
        Err(_) => {}
        Ok(mut stream) => {
            let mut probe = [0u8; 1];
            match tokio::time::timeout(Duration::from_secs(1), stream.read(&mut probe)).await {
                Ok(Ok(n)) => assert_eq!(n, 0),
                // A refused or reset connection is an acceptable outcome too.
                _ => {}
            }
        }
    }
}
