//! End-to-end proxy scenarios against real in-process upstream servers.
//!
//! Each test spins a hyper server on an ephemeral port, drives one of the
//! engines through its public interface, and asserts on the bytes the
//! client-side sink observed plus the stats both engines must keep.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use olla_proxy::proxy::context::full_body;
use olla_proxy::stats::InMemoryStatsCollector;
use olla_proxy::{
    BoxBody, Endpoint, ErrorCategory, PerformanceEngine, ProxyConfig, ProxyEngine, RequestContext,
    RequestStats, ResponseSink, RoundRobinSelector, SimpleEngine, StaticDiscovery,
};

/// Client-side sink recording everything the pipeline writes.
#[derive(Clone, Default)]
struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
}

#[derive(Default)]
struct SinkState {
    status: Option<StatusCode>,
    headers: HeaderMap,
    chunks: Vec<Bytes>,
    flushes: usize,
}

impl RecordingSink {
    fn new() -> Self {
        Self::default()
    }

    fn status(&self) -> Option<StatusCode> {
        self.state.lock().unwrap().status
    }

    fn header(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn body(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state.chunks.iter().flat_map(|c| c.to_vec()).collect()
    }

    fn chunk_count(&self) -> usize {
        self.state.lock().unwrap().chunks.len()
    }

    fn flushes(&self) -> usize {
        self.state.lock().unwrap().flushes
    }
}

#[async_trait]
impl ResponseSink for RecordingSink {
    async fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.status = Some(status);
        state.headers = headers;
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.state.lock().unwrap().chunks.push(chunk);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().flushes += 1;
        Ok(())
    }
}

/// Response body fed frame by frame from a producer task.
struct FrameRx(mpsc::Receiver<Frame<Bytes>>);

impl hyper::body::Body for FrameRx {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        match self.0.poll_recv(cx) {
            Poll::Ready(Some(frame)) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn streamed_body() -> (mpsc::Sender<Frame<Bytes>>, BoxBody) {
    use http_body_util::BodyExt;
    let (tx, rx) = mpsc::channel(32);
    (tx, FrameRx(rx).boxed())
}

/// Spin an upstream server on an ephemeral port.
async fn spawn_upstream<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<BoxBody>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, hyper::Error>(handler(req).await) }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

fn endpoint_at(name: &str, addr: SocketAddr) -> Endpoint {
    Endpoint::parse(name, &format!("http://{addr}"), "ollama").expect("endpoint url")
}

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn simple_engine(
    config: ProxyConfig,
    endpoints: Vec<Endpoint>,
) -> (SimpleEngine, Arc<InMemoryStatsCollector>) {
    init_logs();
    let collector = Arc::new(InMemoryStatsCollector::new());
    let engine = SimpleEngine::new(
        config,
        Arc::new(StaticDiscovery::new(endpoints)),
        Arc::new(RoundRobinSelector::new()),
        collector.clone(),
    )
    .with_proxy_id("olla-test");
    (engine, collector)
}

fn performance_engine(
    config: ProxyConfig,
    endpoints: Vec<Endpoint>,
) -> (PerformanceEngine, Arc<InMemoryStatsCollector>) {
    init_logs();
    let collector = Arc::new(InMemoryStatsCollector::new());
    let engine = PerformanceEngine::new(
        config,
        Arc::new(StaticDiscovery::new(endpoints)),
        Arc::new(RoundRobinSelector::new()),
        collector.clone(),
    )
    .with_proxy_id("olla-test");
    (engine, collector)
}

fn get(path: &str) -> Request<BoxBody> {
    Request::builder()
        .method("GET")
        .uri(path)
        .body(full_body(""))
        .expect("request")
}

fn ctx() -> RequestContext {
    RequestContext::new()
        .with_request_id("req_test")
        .with_start(Instant::now())
        .with_remote_addr("127.0.0.1:40000")
}

#[tokio::test]
async fn test_happy_path() {
    let addr = spawn_upstream(|_req| async {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(full_body("ok"))
            .unwrap()
    })
    .await;

    let endpoint = endpoint_at("ollama-1", addr);
    let (engine, collector) = simple_engine(ProxyConfig::default(), vec![endpoint.clone()]);

    let mut sink = RecordingSink::new();
    let mut stats = RequestStats::new();
    engine
        .proxy_request(&ctx(), &mut sink, get("/api/chat"), &mut stats)
        .await
        .expect("happy path must succeed");

    assert_eq!(sink.status(), Some(StatusCode::OK));
    assert_eq!(sink.body(), b"ok");
    assert_eq!(sink.header("x-olla-endpoint").as_deref(), Some("ollama-1"));
    assert_eq!(sink.header("x-olla-backend-type").as_deref(), Some("ollama"));
    assert_eq!(sink.header("x-olla-request-id").as_deref(), Some("req_test"));
    assert!(sink.header("x-olla-response-time").unwrap().ends_with("ms"));

    let snapshot = engine.stats();
    assert_eq!(snapshot.total_requests, 1);
    assert_eq!(snapshot.successful_requests, 1);
    assert_eq!(snapshot.failed_requests, 0);

    assert_eq!(stats.total_bytes, 2);
    assert_eq!(stats.endpoint_name, "ollama-1");
    assert!(stats.total >= stats.backend_response);

    assert_eq!(collector.successes("ollama-1"), 1);
    assert_eq!(collector.active_connections("ollama-1"), 0);
    assert_eq!(endpoint.active_requests(), 0);
}

#[tokio::test]
async fn test_streaming_sse_flushes_each_chunk() {
    let addr = spawn_upstream(|_req| async {
        let (tx, body) = streamed_body();
        tokio::spawn(async move {
            for i in 0..5 {
                let chunk = format!("data: {i}\n\n");
                if tx.send(Frame::data(Bytes::from(chunk))).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .body(body)
            .unwrap()
    })
    .await;

    let (engine, _collector) =
        simple_engine(ProxyConfig::default(), vec![endpoint_at("sse", addr)]);

    let mut sink = RecordingSink::new();
    let mut stats = RequestStats::new();
    engine
        .proxy_request(&ctx(), &mut sink, get("/api/generate"), &mut stats)
        .await
        .expect("sse stream must succeed");

    let expected: String = (0..5).map(|i| format!("data: {i}\n\n")).collect();
    assert_eq!(sink.body(), expected.as_bytes());
    assert!(sink.chunk_count() >= 5);
    assert!(sink.flushes() >= 5, "sse chunks must be flushed individually");
    assert!(stats.first_data.unwrap() > Duration::ZERO);
    assert!(stats.streaming >= Duration::from_millis(20));
}

#[tokio::test]
async fn test_prefix_stripping_end_to_end() {
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen_in_handler = seen.clone();
    let addr = spawn_upstream(move |req| {
        let seen = seen_in_handler.clone();
        async move {
            seen.lock().unwrap().push(req.uri().path().to_string());
            Response::builder()
                .status(StatusCode::OK)
                .body(full_body("ok"))
                .unwrap()
        }
    })
    .await;

    let config: ProxyConfig = serde_json::from_str(r#"{"proxy_prefix": "/olla"}"#).unwrap();
    let (engine, _) = simple_engine(config, vec![endpoint_at("prefixed", addr)]);

    let mut sink = RecordingSink::new();
    engine
        .proxy_request(&ctx(), &mut sink, get("/olla/api/chat"), &mut RequestStats::new())
        .await
        .expect("prefixed request");

    let mut sink = RecordingSink::new();
    engine
        .proxy_request(&ctx(), &mut sink, get("/olla"), &mut RequestStats::new())
        .await
        .expect("bare prefix request");

    let paths = seen.lock().unwrap().clone();
    assert_eq!(paths, vec!["/api/chat".to_string(), "/".to_string()]);
}

#[tokio::test]
async fn test_client_disconnect_mid_stream() {
    let addr = spawn_upstream(|_req| async {
        let (tx, body) = streamed_body();
        tokio::spawn(async move {
            for i in 0..10 {
                let chunk = format!("chunk-{i} ");
                if tx.send(Frame::data(Bytes::from(chunk))).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .body(body)
            .unwrap()
    })
    .await;

    let endpoint = endpoint_at("slow", addr);
    let (engine, collector) = simple_engine(ProxyConfig::default(), vec![endpoint.clone()]);

    let ctx = ctx();
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
    });

    let mut sink = RecordingSink::new();
    let mut stats = RequestStats::new();
    let err = engine
        .proxy_request(&ctx, &mut sink, get("/api/generate"), &mut stats)
        .await
        .expect_err("cancelled client must surface an error");

    assert_eq!(err.category, ErrorCategory::ClientDisconnect);
    assert!(err.bytes_streamed > 0);
    assert!(err.bytes_streamed < 80, "must not have received the full payload");
    assert!(err.message.contains("client disconnected early"));

    let snapshot = engine.stats();
    assert_eq!(snapshot.total_requests, 1);
    assert_eq!(snapshot.failed_requests, 1);
    assert_eq!(collector.active_connections("slow"), 0);
    assert_eq!(endpoint.active_requests(), 0);
}

#[tokio::test]
async fn test_backend_refused() {
    // Grab a port that nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let endpoint = endpoint_at("dead", dead_addr);
    let (engine, collector) = performance_engine(ProxyConfig::default(), vec![endpoint.clone()]);

    let mut sink = RecordingSink::new();
    let mut stats = RequestStats::new();
    let err = engine
        .proxy_request(&ctx(), &mut sink, get("/api/chat"), &mut stats)
        .await
        .expect_err("refused backend must fail");

    assert!(
        err.category.is_connection_level(),
        "got {:?} instead of a connection-level category",
        err.category
    );
    assert_eq!(err.upstream_status, 0);

    let snapshot = engine.stats();
    assert_eq!(snapshot.total_requests, 1);
    assert_eq!(snapshot.failed_requests, 1);
    assert_eq!(collector.failures("dead"), 1);
    assert_eq!(
        engine.circuit_breakers().get("dead").consecutive_failures(),
        1
    );
}

#[tokio::test]
async fn test_circuit_breaker_opens_and_recovers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let config: ProxyConfig = serde_json::from_str(
        r#"{"circuit_breaker": {"failure_threshold": 5, "open_timeout": 0.2}}"#,
    )
    .unwrap();
    let (engine, _collector) = performance_engine(config, vec![]);

    let dead = endpoint_at("flaky", dead_addr);
    for _ in 0..5 {
        let err = engine
            .proxy_request_to_endpoints(
                &ctx(),
                &mut RecordingSink::new(),
                get("/api/chat"),
                std::slice::from_ref(&dead),
                &mut RequestStats::new(),
            )
            .await
            .expect_err("dead endpoint");
        assert!(err.category.is_connection_level());
    }

    // Sixth request must be rejected at admission, before any dial.
    let before = Instant::now();
    let err = engine
        .proxy_request_to_endpoints(
            &ctx(),
            &mut RecordingSink::new(),
            get("/api/chat"),
            std::slice::from_ref(&dead),
            &mut RequestStats::new(),
        )
        .await
        .expect_err("breaker must reject");
    assert_eq!(err.category, ErrorCategory::CircuitOpen);
    assert!(before.elapsed() < Duration::from_millis(50));

    // After the open window, a live endpoint under the same name closes the
    // breaker again.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let live_addr = spawn_upstream(|_req| async {
        Response::builder()
            .status(StatusCode::OK)
            .body(full_body("back"))
            .unwrap()
    })
    .await;
    let live = endpoint_at("flaky", live_addr);

    let mut sink = RecordingSink::new();
    engine
        .proxy_request_to_endpoints(
            &ctx(),
            &mut sink,
            get("/api/chat"),
            std::slice::from_ref(&live),
            &mut RequestStats::new(),
        )
        .await
        .expect("half-open probe must pass");
    assert_eq!(sink.body(), b"back");
    assert_eq!(
        engine.circuit_breakers().get("flaky").consecutive_failures(),
        0
    );

    let snapshot = engine.stats();
    assert_eq!(snapshot.total_requests, 7);
    assert_eq!(snapshot.successful_requests, 1);
    assert_eq!(snapshot.failed_requests, 6);
}

#[tokio::test]
async fn test_no_healthy_endpoints() {
    let (engine, _) = simple_engine(ProxyConfig::default(), vec![]);
    let err = engine
        .proxy_request(
            &ctx(),
            &mut RecordingSink::new(),
            get("/api/chat"),
            &mut RequestStats::new(),
        )
        .await
        .expect_err("no endpoints must fail");
    assert_eq!(err.category, ErrorCategory::NoHealthyEndpoints);

    let snapshot = engine.stats();
    assert_eq!(snapshot.total_requests, 1);
    assert_eq!(snapshot.failed_requests, 1);
}
