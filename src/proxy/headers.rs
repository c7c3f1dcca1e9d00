use crate::proxy::context::RequestContext;
use http::header::HOST;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

pub const PROXY_NAME: &str = "olla";
pub const PROXY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hop-by-hop headers (RFC 7230): meaningful for a single transport
/// connection only, never forwarded. `HeaderName` is lowercase by
/// construction so a `match` on the name string is a constant-time set.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Credentials the proxy must not leak to backends.
fn is_sensitive(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "authorization" | "cookie" | "x-api-key" | "x-auth-token" | "proxy-authorization"
    )
}

/// Host portion of a `host:port` remote address, split on the last colon.
/// Returns `None` when there is no port separator to split on.
fn caller_ip(remote_addr: &str) -> Option<&str> {
    let (host, _port) = remote_addr.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some(host)
}

/// Prepare the header map sent upstream from the client's headers.
///
/// Copies everything except sensitive and hop-by-hop headers (and `Host`,
/// which the transport derives from the target URL), then sets the
/// forwarding headers. Pre-existing entries in `out` survive unless a copied
/// header of the same name lands on top of them.
pub fn prepare_upstream_headers(
    out: &mut HeaderMap,
    client_headers: &HeaderMap,
    ctx: &RequestContext,
    proxy_id: &str,
) {
    for name in client_headers.keys() {
        if is_hop_by_hop(name) || is_sensitive(name) || name == &HOST {
            continue;
        }
        let mut values = client_headers.get_all(name).iter();
        if let Some(first) = values.next() {
            // Insert replaces any pre-existing entry of the same name;
            // further client values for the name are appended after it.
            out.insert(name.clone(), first.clone());
        }
        for value in values {
            out.append(name.clone(), value.clone());
        }
    }

    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");
    static VIA: HeaderName = HeaderName::from_static("via");
    static PROXIED_BY: HeaderName = HeaderName::from_static("x-proxied-by");

    // X-Forwarded-Host: the Host the client addressed.
    if let Some(host) = client_headers.get(HOST) {
        out.insert(XFH.clone(), host.clone());
    }

    // X-Forwarded-Proto: preserve an existing value (a front proxy may have
    // terminated TLS), otherwise reflect this hop.
    if !out.contains_key(&XFP) {
        let proto = if ctx.tls { "https" } else { "http" };
        out.insert(XFP.clone(), HeaderValue::from_static(proto));
    }

    if let Some(ip) = ctx.remote_addr.as_deref().and_then(caller_ip) {
        // X-Forwarded-For: append unless the chain already ends with this
        // caller, so repeated preparation does not grow the list.
        match out.get(&XFF).and_then(|v| v.to_str().ok()) {
            Some(existing) => {
                let last = existing.rsplit(',').next().map(str::trim);
                if last != Some(ip) {
                    let mut combined = String::with_capacity(existing.len() + 2 + ip.len());
                    combined.push_str(existing);
                    combined.push_str(", ");
                    combined.push_str(ip);
                    if let Ok(v) = HeaderValue::from_str(&combined) {
                        out.insert(XFF.clone(), v);
                    }
                }
            }
            None => {
                if let Ok(v) = HeaderValue::from_str(ip) {
                    out.insert(XFF.clone(), v);
                }
            }
        }

        // X-Real-IP: preserve if a front proxy already set it.
        if !out.contains_key(&XRI) {
            if let Ok(v) = HeaderValue::from_str(ip) {
                out.insert(XRI.clone(), v);
            }
        }
    }

    append_via(out, &VIA, proxy_id);

    let proxied_by = format!("{PROXY_NAME}/{PROXY_VERSION}");
    if let Ok(v) = HeaderValue::from_str(&proxied_by) {
        out.insert(PROXIED_BY.clone(), v);
    }
}

/// Append `1.1 <proxy-id>` to a Via chain, comma-separated when one exists.
fn append_via(headers: &mut HeaderMap, name: &HeaderName, proxy_id: &str) {
    let hop = format!("1.1 {proxy_id}");
    let value = match headers.get(name).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {hop}"),
        None => hop,
    };
    if let Ok(v) = HeaderValue::from_str(&value) {
        headers.insert(name.clone(), v);
    }
}

/// Metadata for the response-header overlay.
pub struct ResponseOverlay<'a> {
    pub endpoint_name: &'a str,
    pub backend_type: &'a str,
    pub request_id: &'a str,
    pub model: Option<&'a str>,
    pub response_time: Duration,
    pub proxy_id: &'a str,
}

/// Overlay the proxy's response headers after the upstream copy. Applied
/// with set-semantics so an upstream cannot spoof them.
pub fn apply_response_overlay(headers: &mut HeaderMap, overlay: &ResponseOverlay<'_>) {
    static SERVED_BY: HeaderName = HeaderName::from_static("x-served-by");
    static ENDPOINT: HeaderName = HeaderName::from_static("x-olla-endpoint");
    static BACKEND: HeaderName = HeaderName::from_static("x-olla-backend-type");
    static REQUEST_ID: HeaderName = HeaderName::from_static("x-olla-request-id");
    static MODEL: HeaderName = HeaderName::from_static("x-olla-model");
    static RESPONSE_TIME: HeaderName = HeaderName::from_static("x-olla-response-time");
    static VIA: HeaderName = HeaderName::from_static("via");

    let set = |headers: &mut HeaderMap, name: &HeaderName, value: &str| {
        if let Ok(v) = HeaderValue::from_str(value) {
            headers.insert(name.clone(), v);
        }
    };

    set(headers, &SERVED_BY, overlay.endpoint_name);
    set(headers, &ENDPOINT, overlay.endpoint_name);
    set(headers, &BACKEND, overlay.backend_type);
    set(headers, &REQUEST_ID, overlay.request_id);
    if let Some(model) = overlay.model {
        set(headers, &MODEL, model);
    }

    let mut buf = itoa::Buffer::new();
    let ms = buf.format(overlay.response_time.as_millis() as u64);
    let mut rendered = String::with_capacity(ms.len() + 2);
    rendered.push_str(ms);
    rendered.push_str("ms");
    set(headers, &RESPONSE_TIME, &rendered);

    append_via(headers, &VIA, overlay.proxy_id);
}
