use std::error::Error;
use std::fmt;
use std::io;
use std::time::Duration;

/// User-facing error category. The primary discriminator callers use to map
/// a failure to an HTTP status or a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NoHealthyEndpoints,
    SelectionFailed,
    CircuitOpen,
    UrlResolutionFailed,
    UpstreamRequestCreationFailed,
    ConnectionFailed,
    Timeout,
    ClientDisconnect,
    UpstreamEof,
    Dns,
    Network,
    Reset,
    StreamingFailed,
    Generic,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoHealthyEndpoints => "no_healthy_endpoints",
            Self::SelectionFailed => "selection_failed",
            Self::CircuitOpen => "circuit_open",
            Self::UrlResolutionFailed => "url_resolution_failed",
            Self::UpstreamRequestCreationFailed => "upstream_request_creation_failed",
            Self::ConnectionFailed => "connection_failed",
            Self::Timeout => "timeout",
            Self::ClientDisconnect => "client_disconnect",
            Self::UpstreamEof => "upstream_eof",
            Self::Dns => "dns",
            Self::Network => "network",
            Self::Reset => "reset",
            Self::StreamingFailed => "streaming_failed",
            Self::Generic => "generic",
        }
    }

    /// Whether the failure happened at the connection level (dial, refuse,
    /// reset, DNS). Only these feed the circuit breaker; upstream 5xx and
    /// client-side aborts do not.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed | Self::Dns | Self::Network | Self::Reset
        )
    }

    /// Suggested HTTP status when the response head has not been written yet.
    pub fn suggested_status(&self) -> u16 {
        match self {
            Self::NoHealthyEndpoints | Self::CircuitOpen => 503,
            Self::Timeout => 504,
            Self::ClientDisconnect => 499,
            _ => 502,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Surface error for a single proxy request. Uniform across both engines:
/// the category is the discriminator, the remaining fields carry the
/// structured request context for logging and stats.
pub struct ProxyError {
    pub category: ErrorCategory,
    pub message: String,
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub target_url: String,
    /// Upstream HTTP status, 0 when the round-trip never produced one.
    pub upstream_status: u16,
    pub elapsed: Duration,
    pub bytes_streamed: u64,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl ProxyError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            request_id: String::new(),
            method: String::new(),
            path: String::new(),
            target_url: String::new(),
            upstream_status: 0,
            elapsed: Duration::ZERO,
            bytes_streamed: 0,
            source: None,
        }
    }

    pub fn with_source(mut self, source: Box<dyn Error + Send + Sync>) -> Self {
        self.source = Some(source);
        self
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyError")
            .field("category", &self.category)
            .field("message", &self.message)
            .field("request_id", &self.request_id)
            .field("target_url", &self.target_url)
            .field("upstream_status", &self.upstream_status)
            .field("elapsed", &self.elapsed)
            .field("bytes_streamed", &self.bytes_streamed)
            .finish()
    }
}

impl Error for ProxyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.source {
            Some(e) => Some(&**e),
            None => None,
        }
    }
}

/// Render an elapsed duration for error messages: one decimal of seconds
/// (`"1.5s"`), or whole milliseconds below 100ms so short-lived failures
/// never read as `"0.0s"`.
pub fn format_elapsed(elapsed: Duration) -> String {
    if elapsed < Duration::from_millis(100) {
        let mut buf = itoa::Buffer::new();
        format!("{}ms", buf.format(elapsed.as_millis() as u64))
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}

/// Classify a low-level round-trip or streaming error into a user-facing
/// category and message. Walks the error's `source()` chain looking for the
/// most specific cause; anything unrecognized falls back to `generic` with
/// the original message.
pub fn classify(raw: &(dyn Error + 'static), elapsed: Duration) -> (ErrorCategory, String) {
    let after = format_elapsed(elapsed);

    let mut cur: Option<&(dyn Error + 'static)> = Some(raw);
    let mut connect_error = false;
    while let Some(err) = cur {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => {
                    return (
                        ErrorCategory::Network,
                        format!("network error after {after} — connection refused"),
                    );
                }
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                    return (
                        ErrorCategory::Reset,
                        format!("connection reset after {after} — closed connection unexpectedly"),
                    );
                }
                io::ErrorKind::TimedOut => {
                    return (
                        ErrorCategory::Timeout,
                        format!("request timeout after {after} — server timeout exceeded"),
                    );
                }
                io::ErrorKind::UnexpectedEof => {
                    return (
                        ErrorCategory::UpstreamEof,
                        format!(
                            "AI backend closed connection after {after} — response stream ended unexpectedly"
                        ),
                    );
                }
                _ => {}
            }
        }
        if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return (
                ErrorCategory::Timeout,
                format!("request timeout after {after} — server timeout exceeded"),
            );
        }
        if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() {
                return (
                    ErrorCategory::UpstreamEof,
                    format!(
                        "AI backend closed connection after {after} — response stream ended unexpectedly"
                    ),
                );
            }
        }
        if let Some(client_err) = err.downcast_ref::<hyper_util::client::legacy::Error>() {
            if client_err.is_connect() {
                connect_error = true;
            }
        }

        let text = err.to_string();
        if text.contains("failed to lookup address") || text.contains("no such host") {
            return (
                ErrorCategory::Dns,
                format!("DNS lookup failed after {after} — cannot resolve backend hostname"),
            );
        }
        if text.contains("unreachable") {
            return (
                ErrorCategory::Network,
                format!("request failed after {after} — network is unreachable"),
            );
        }

        cur = err.source();
    }

    if connect_error {
        return (
            ErrorCategory::ConnectionFailed,
            format!("failed to connect to AI backend after {after}"),
        );
    }

    (ErrorCategory::Generic, format!("{raw} after {after}"))
}

/// Message for a client that went away mid-request.
pub fn client_disconnect_message(elapsed: Duration) -> String {
    format!(
        "request cancelled after {} — client disconnected early",
        format_elapsed(elapsed)
    )
}

/// Message for an exceeded server-side deadline.
pub fn timeout_message(elapsed: Duration) -> String {
    format!(
        "request timeout after {} — server timeout exceeded",
        format_elapsed(elapsed)
    )
}
