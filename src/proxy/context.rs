use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request context threaded through the pipeline. Explicit fields, not a
/// string-keyed map: the request id and start time sit on the hot path of
/// every log line and header overlay.
pub struct RequestContext {
    /// Caller-assigned request id. Synthesized (with a warning) when absent.
    pub request_id: Option<String>,
    /// When the request entered the outer server. Synthesized when absent.
    pub start: Option<Instant>,
    /// Model name extracted by the caller, used only for `X-Olla-Model`.
    pub model: Option<String>,
    /// Caller's streaming preference; consulted only under the `auto`
    /// profile.
    pub stream_hint: Option<bool>,
    /// Raw remote address (`host:port`) of the downstream client.
    pub remote_addr: Option<String>,
    /// Whether the client connection arrived over TLS.
    pub tls: bool,
    /// Fires when the downstream client goes away.
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: None,
            start: None,
            model: None,
            stream_hint: None,
            remote_addr: None,
            tls: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_start(mut self, start: Instant) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_stream_hint(mut self, hint: bool) -> Self {
        self.stream_hint = Some(hint);
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a request id for callers that did not assign one.
pub fn synthesize_request_id() -> String {
    format!("req_{:016x}", rand::random::<u64>())
}
