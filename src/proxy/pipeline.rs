use crate::buffer::BufferPool;
use crate::config::ProxyConfig;
use crate::error::{
    classify, client_disconnect_message, format_elapsed, timeout_message, ErrorCategory, ProxyError,
};
use crate::proxy::context::{BoxBody, synthesize_request_id, RequestContext};
use crate::proxy::flush::flush_decision;
use crate::proxy::headers::{apply_response_overlay, prepare_upstream_headers, ResponseOverlay};
use crate::proxy::path::resolve_upstream_url;
use crate::proxy::sink::ResponseSink;
use crate::proxy::stream::{stream_response, StreamError};
use crate::stats::{ProxyStatsCore, RequestOutcome, RequestStats, StatsCollector};
use crate::upstream::pool::build_transport;
use crate::upstream::{
    CircuitBreakerRegistry, ConnectionPoolManager, DiscoveryService, Endpoint, EndpointSelector,
    HttpClient, TransportOptions,
};
use arc_swap::ArcSwap;
use bytes::Bytes;
use futures_util::FutureExt;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Request, StatusCode};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Transport strategy distinguishing the two engines: one shared client, or
/// a per-endpoint pool with isolation and reaping.
pub(crate) enum Transports {
    Shared(ArcSwap<HttpClient>),
    PerEndpoint(Arc<ConnectionPoolManager>),
}

/// State shared by both engines: the config snapshot, counters, buffer pool,
/// the external collaborators, and the transport strategy.
pub(crate) struct ProxyCore {
    pub config: Arc<ArcSwap<ProxyConfig>>,
    pub stats: ProxyStatsCore,
    pub buffers: BufferPool,
    pub discovery: Arc<dyn DiscoveryService>,
    pub selector: Arc<dyn EndpointSelector>,
    pub collector: Arc<dyn StatsCollector>,
    pub transports: Transports,
    pub breakers: Option<Arc<CircuitBreakerRegistry>>,
    pub proxy_id: Arc<str>,
}

impl ProxyCore {
    pub(crate) fn default_proxy_id() -> Arc<str> {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| crate::proxy::headers::PROXY_NAME.to_string())
            .into()
    }

    async fn transport_for(
        &self,
        endpoint: &Endpoint,
        cfg: &ProxyConfig,
    ) -> (HttpClient, Option<OwnedSemaphorePermit>) {
        match &self.transports {
            Transports::Shared(client) => (client.load().as_ref().clone(), None),
            Transports::PerEndpoint(pools) => {
                let opts = TransportOptions::from_config(cfg);
                let entry = pools.transport(endpoint, &opts);
                let permit = entry.acquire_slot().await;
                (entry.client(), permit)
            }
        }
    }

    pub(crate) fn update_config(&self, new: ProxyConfig) {
        if let Transports::Shared(client) = &self.transports {
            let current = self.config.load();
            let new_opts = TransportOptions::from_config(&new);
            if TransportOptions::from_config(&current) != new_opts {
                client.store(Arc::new(build_transport(&new_opts)));
            }
        }
        self.config.store(Arc::new(new));
    }
}

/// Pairs `increment_connections` with its decrement on every exit path,
/// panics included. The pipeline is the only party doing this accounting.
struct ConnectionGuard {
    selector: Arc<dyn EndpointSelector>,
    collector: Arc<dyn StatsCollector>,
    endpoint: Endpoint,
}

impl ConnectionGuard {
    fn new(
        selector: Arc<dyn EndpointSelector>,
        collector: Arc<dyn StatsCollector>,
        endpoint: Endpoint,
    ) -> Self {
        selector.increment_connections(&endpoint);
        collector.record_connection(&endpoint, 1);
        Self {
            selector,
            collector,
            endpoint,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.selector.decrement_connections(&self.endpoint);
        self.collector.record_connection(&self.endpoint, -1);
    }
}

/// In-flight gauge that survives panics.
struct InFlightGuard;

impl InFlightGuard {
    fn new() -> Self {
        metrics::gauge!("olla_proxy_requests_in_flight").increment(1.0);
        Self
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        metrics::gauge!("olla_proxy_requests_in_flight").decrement(1.0);
    }
}

/// Request identity threaded into every surfaced error.
struct Scope {
    request_id: String,
    method: String,
    path: String,
    target_url: String,
    upstream_status: u16,
    bytes: u64,
    start: Instant,
}

impl Scope {
    fn stamp(&self, mut err: ProxyError) -> ProxyError {
        err.request_id = self.request_id.clone();
        err.method = self.method.clone();
        err.path = self.path.clone();
        err.target_url = self.target_url.clone();
        if err.upstream_status == 0 {
            err.upstream_status = self.upstream_status;
        }
        err.elapsed = self.start.elapsed();
        err.bytes_streamed = self.bytes;
        err
    }
}

fn fail(
    core: &ProxyCore,
    recorded: &AtomicBool,
    scope: &Scope,
    err: ProxyError,
) -> ProxyError {
    if !recorded.swap(true, Ordering::AcqRel) {
        core.stats.record_failure();
    }
    let err = scope.stamp(err);
    metrics::counter!(
        "olla_proxy_requests_total",
        "outcome" => "failure",
        "category" => err.category.as_str(),
    )
    .increment(1);
    warn!(
        request_id = %err.request_id,
        category = err.category.as_str(),
        target = %err.target_url,
        status = err.upstream_status,
        elapsed_ms = err.elapsed.as_millis() as u64,
        bytes = err.bytes_streamed,
        "proxy request failed: {}", err.message
    );
    err
}

/// Run one proxy request end to end, with a panic guard that records the
/// failure and writes a generic 500 when the head has not gone out yet.
pub(crate) async fn run<S>(
    core: &ProxyCore,
    ctx: &RequestContext,
    sink: &mut S,
    request: Request<BoxBody>,
    provided: Option<Vec<Endpoint>>,
    stats: &mut RequestStats,
) -> Result<(), ProxyError>
where
    S: ResponseSink + ?Sized,
{
    // First action of the pipeline, before any fallible work.
    core.stats.record_request_start();
    let _in_flight = InFlightGuard::new();

    let head_sent = AtomicBool::new(false);
    let outcome_recorded = AtomicBool::new(false);

    let result = std::panic::AssertUnwindSafe(run_inner(
        core,
        ctx,
        sink,
        request,
        provided,
        stats,
        &head_sent,
        &outcome_recorded,
    ))
    .catch_unwind()
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(panic = %message, "panic in proxy pipeline");

            if !outcome_recorded.swap(true, Ordering::AcqRel) {
                core.stats.record_failure();
            }
            if !head_sent.load(Ordering::Acquire) {
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                let _ = sink
                    .send_head(StatusCode::INTERNAL_SERVER_ERROR, headers)
                    .await;
                let _ = sink
                    .write_chunk(Bytes::from_static(br#"{"error":"internal server error"}"#))
                    .await;
            }
            Err(ProxyError::new(
                ErrorCategory::Generic,
                format!("internal proxy error: {message}"),
            ))
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_inner<S>(
    core: &ProxyCore,
    ctx: &RequestContext,
    sink: &mut S,
    request: Request<BoxBody>,
    provided: Option<Vec<Endpoint>>,
    stats: &mut RequestStats,
    head_sent: &AtomicBool,
    outcome_recorded: &AtomicBool,
) -> Result<(), ProxyError>
where
    S: ResponseSink + ?Sized,
{
    let cfg = core.config.load_full();

    let request_id = match &ctx.request_id {
        Some(id) => id.clone(),
        None => {
            let id = synthesize_request_id();
            warn!(request_id = %id, "request arrived without an id, synthesized one");
            id
        }
    };
    let start = match ctx.start {
        Some(s) => s,
        None => {
            warn!(request_id = %request_id, "request arrived without a start time, using now");
            Instant::now()
        }
    };
    stats.request_id = request_id.clone();
    stats.start = start;

    let mut scope = Scope {
        request_id,
        method: request.method().as_str().to_string(),
        path: request.uri().path().to_string(),
        target_url: String::new(),
        upstream_status: 0,
        bytes: 0,
        start,
    };
    let raw_query = request.uri().query().map(str::to_string);

    // Endpoints: pre-filtered by the caller, or asked from discovery.
    let endpoints = match provided {
        Some(eps) => eps,
        None => match core.discovery.healthy_endpoints().await {
            Ok(eps) => eps,
            Err(e) => return Err(fail(core, outcome_recorded, &scope, e)),
        },
    };
    if endpoints.is_empty() {
        return Err(fail(
            core,
            outcome_recorded,
            &scope,
            ProxyError::new(
                ErrorCategory::NoHealthyEndpoints,
                "no healthy AI backends available",
            ),
        ));
    }

    let selection_start = Instant::now();
    let endpoint = match core.selector.select(&endpoints).await {
        Ok(ep) => ep,
        Err(e) => return Err(fail(core, outcome_recorded, &scope, e)),
    };
    stats.selection = selection_start.elapsed();
    stats.endpoint_name = endpoint.name().to_string();

    // Breaker admission (performance engine; a no-op on the simple engine).
    if let Some(breakers) = &core.breakers {
        if breakers.is_open(endpoint.name(), &cfg.circuit_breaker) {
            metrics::counter!(
                "olla_proxy_breaker_rejected_total",
                "endpoint" => endpoint.name().to_string(),
            )
            .increment(1);
            return Err(fail(
                core,
                outcome_recorded,
                &scope,
                ProxyError::new(
                    ErrorCategory::CircuitOpen,
                    format!("circuit breaker open for endpoint {}", endpoint.name()),
                ),
            ));
        }
    }

    let target = match resolve_upstream_url(
        &scope.path,
        raw_query.as_deref(),
        endpoint.url(),
        &cfg.proxy_prefix,
    ) {
        Ok(url) => url,
        Err(e) => return Err(fail(core, outcome_recorded, &scope, e)),
    };
    scope.target_url = target.to_string();
    stats.target_url = scope.target_url.clone();

    // Upstream context: a token cancelled by the response deadline (when
    // configured) and guaranteed-cancelled when this request unwinds.
    let upstream_token = CancellationToken::new();
    let _upstream_guard = upstream_token.clone().drop_guard();
    if let Some(timeout) = cfg.response_timeout() {
        let token = upstream_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => token.cancel(),
                _ = token.cancelled() => {}
            }
        });
    }

    // Build the upstream request; the client body is forwarded as a stream,
    // never collected.
    let headers_start = Instant::now();
    let (parts, client_body) = request.into_parts();
    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(target.as_str());
    if let Some(headers) = builder.headers_mut() {
        prepare_upstream_headers(headers, &parts.headers, ctx, &core.proxy_id);
    }
    let upstream_request = match builder.body(client_body) {
        Ok(req) => req,
        Err(e) => {
            return Err(fail(
                core,
                outcome_recorded,
                &scope,
                ProxyError::new(
                    ErrorCategory::UpstreamRequestCreationFailed,
                    format!("failed to build upstream request: {e}"),
                )
                .with_source(Box::new(e)),
            ));
        }
    };
    stats.header_processing = headers_start.elapsed();
    stats.request_processing = start.elapsed();

    let (client, _slot) = core.transport_for(&endpoint, &cfg).await;

    let round_trip_start = Instant::now();
    let response = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            return Err(fail(
                core,
                outcome_recorded,
                &scope,
                ProxyError::new(
                    ErrorCategory::ClientDisconnect,
                    client_disconnect_message(start.elapsed()),
                ),
            ));
        }
        _ = upstream_token.cancelled() => {
            return Err(fail(
                core,
                outcome_recorded,
                &scope,
                ProxyError::new(ErrorCategory::Timeout, timeout_message(start.elapsed())),
            ));
        }
        result = client.request(upstream_request) => match result {
            Ok(response) => response,
            Err(e) => {
                let (category, message) = classify(&e, start.elapsed());
                if category.is_connection_level() {
                    if let Some(breakers) = &core.breakers {
                        breakers.record_failure(endpoint.name());
                    }
                }
                core.collector.record_request(
                    &endpoint,
                    RequestOutcome::Failure,
                    start.elapsed(),
                    0,
                );
                return Err(fail(
                    core,
                    outcome_recorded,
                    &scope,
                    ProxyError::new(category, message).with_source(Box::new(e)),
                ));
            }
        }
    };
    stats.backend_response = round_trip_start.elapsed();

    // Exactly one increment/decrement pair per request, released on every
    // exit from here on.
    let _connections = ConnectionGuard::new(
        core.selector.clone(),
        core.collector.clone(),
        endpoint.clone(),
    );

    let (resp_parts, resp_body) = response.into_parts();
    scope.upstream_status = resp_parts.status.as_u16();

    let content_type = resp_parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // Upstream headers go back verbatim, then the proxy overlay lands on
    // top so upstream values can never mask it.
    let mut headers = resp_parts.headers;
    apply_response_overlay(
        &mut headers,
        &ResponseOverlay {
            endpoint_name: endpoint.name(),
            backend_type: endpoint.backend_type(),
            request_id: &scope.request_id,
            model: ctx.model.as_deref(),
            response_time: start.elapsed(),
            proxy_id: &core.proxy_id,
        },
    );

    let decision = flush_decision(cfg.profile, content_type.as_deref(), ctx.stream_hint);

    if let Err(e) = sink.send_head(resp_parts.status, headers).await {
        core.collector
            .record_request(&endpoint, RequestOutcome::Failure, start.elapsed(), 0);
        return Err(fail(
            core,
            outcome_recorded,
            &scope,
            ProxyError::new(
                ErrorCategory::StreamingFailed,
                format!(
                    "failed to write response head after {}: {e}",
                    format_elapsed(start.elapsed())
                ),
            )
            .with_source(Box::new(e)),
        ));
    }
    head_sent.store(true, Ordering::Release);

    let streaming_start = Instant::now();
    let outcome = stream_response(
        &ctx.cancel,
        &upstream_token,
        sink,
        resp_body,
        cfg.read_timeout(),
        &core.buffers,
        cfg.stream_buffer_size,
        decision,
    )
    .await;
    stats.streaming = streaming_start.elapsed();
    stats.first_data = outcome.first_data;
    stats.total_bytes = outcome.bytes;
    stats.total = start.elapsed();
    scope.bytes = outcome.bytes;

    match outcome.error {
        None => {
            if !outcome_recorded.swap(true, Ordering::AcqRel) {
                core.stats.record_success(stats.total.as_millis() as u64);
            }
            core.collector.record_request(
                &endpoint,
                RequestOutcome::Success,
                stats.total,
                outcome.bytes,
            );
            if let Some(breakers) = &core.breakers {
                breakers.record_success(endpoint.name());
            }
            metrics::counter!(
                "olla_proxy_requests_total",
                "outcome" => "success",
                "category" => "",
            )
            .increment(1);
            metrics::histogram!(
                "olla_proxy_request_duration_seconds",
                "endpoint" => endpoint.name().to_string(),
            )
            .record(stats.total.as_secs_f64());
            info!(
                request_id = %scope.request_id,
                method = %scope.method,
                path = %scope.path,
                endpoint = endpoint.name(),
                status = scope.upstream_status,
                latency_ms = stats.total.as_millis() as u64,
                bytes = outcome.bytes,
                "request proxied"
            );
            Ok(())
        }
        Some(stream_err) => {
            let err = stream_error_to_proxy(stream_err, &scope);
            if err.category.is_connection_level() {
                if let Some(breakers) = &core.breakers {
                    breakers.record_failure(endpoint.name());
                }
            }
            core.collector.record_request(
                &endpoint,
                RequestOutcome::Failure,
                stats.total,
                outcome.bytes,
            );
            Err(fail(core, outcome_recorded, &scope, err))
        }
    }
}

fn stream_error_to_proxy(err: StreamError, scope: &Scope) -> ProxyError {
    let elapsed = scope.start.elapsed();
    match err {
        StreamError::ClientDisconnect => ProxyError::new(
            ErrorCategory::ClientDisconnect,
            client_disconnect_message(elapsed),
        ),
        StreamError::UpstreamCancelled => {
            ProxyError::new(ErrorCategory::Timeout, timeout_message(elapsed))
        }
        StreamError::ReadTimeout => ProxyError::new(
            ErrorCategory::Timeout,
            format!(
                "backend stopped responding after {}",
                format_elapsed(elapsed)
            ),
        ),
        StreamError::Read(e) => {
            let (category, message) = classify(e.as_ref(), elapsed);
            ProxyError::new(category, message).with_source(e)
        }
        StreamError::Write(e) => {
            if e.kind() == io::ErrorKind::BrokenPipe {
                ProxyError::new(
                    ErrorCategory::ClientDisconnect,
                    client_disconnect_message(elapsed),
                )
            } else {
                ProxyError::new(
                    ErrorCategory::StreamingFailed,
                    format!("streaming failed after {}: {e}", format_elapsed(elapsed)),
                )
                .with_source(Box::new(e))
            }
        }
    }
}
