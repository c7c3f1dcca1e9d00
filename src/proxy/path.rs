use crate::error::{ErrorCategory, ProxyError};
use url::Url;

/// Build the upstream URL for a client request path.
///
/// The configured prefix is stripped literally, with no segment-boundary
/// check: `/olla` strips from `/ollama/api` leaving `/ma/api`. This is
/// long-documented behavior; strict segment stripping is an explicit opt-in
/// this resolver does not implement. Encoded slashes are decoded before the
/// strip, dot segments are normalised, and the raw query is carried over
/// verbatim.
pub fn resolve_upstream_url(
    client_path: &str,
    raw_query: Option<&str>,
    endpoint_base: &Url,
    prefix: &str,
) -> Result<Url, ProxyError> {
    let decoded = decode_encoded_slashes(client_path);

    let stripped: String = if !prefix.is_empty() && decoded.starts_with(prefix) {
        let rest = &decoded[prefix.len()..];
        if rest.is_empty() || !rest.starts_with('/') {
            let mut p = String::with_capacity(rest.len() + 1);
            p.push('/');
            p.push_str(rest);
            p
        } else {
            rest.to_string()
        }
    } else {
        decoded.into_owned()
    };

    let normalized = remove_dot_segments(&stripped);

    let mut target = endpoint_base.clone();
    if target.cannot_be_a_base() {
        return Err(ProxyError::new(
            ErrorCategory::UrlResolutionFailed,
            format!("failed to resolve upstream URL against base {endpoint_base}"),
        ));
    }
    // set_path keeps a leading "//" as path, where reference-resolution
    // would reparse it as an authority.
    target.set_path(&normalized);
    target.set_query(raw_query);
    Ok(target)
}

/// Decode percent-encoded slashes so prefix stripping sees the same path the
/// backend will.
fn decode_encoded_slashes(path: &str) -> std::borrow::Cow<'_, str> {
    if path.contains("%2F") || path.contains("%2f") {
        std::borrow::Cow::Owned(path.replace("%2F", "/").replace("%2f", "/"))
    } else {
        std::borrow::Cow::Borrowed(path)
    }
}

/// RFC 3986 §5.2.4 dot-segment removal, preserving empty segments so double
/// slashes survive. The result always begins with `/`.
fn remove_dot_segments(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "." => {}
            ".." => {
                // Never pop the leading root marker.
                if segments.len() > 1 {
                    segments.pop();
                }
            }
            s => segments.push(s),
        }
    }

    let mut out = segments.join("/");
    if !out.starts_with('/') {
        out.insert(0, '/');
    }
    // A trailing "." or ".." resolves to a directory reference.
    if (path.ends_with("/.") || path.ends_with("/..")) && !out.ends_with('/') {
        out.push('/');
    }
    out
}
