use crate::config::StreamProfile;

/// Per-response flushing decision, computed once when the response head
/// arrives and applied to every chunk after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// Push each chunk to the client immediately. Token streams stay live.
    Always,
    /// Let chunks coalesce into full buffers. Bulk transfers stay efficient.
    Never,
}

/// Decide the flushing policy for one response.
///
/// `standard` and `streaming` are unconditional. Under `auto` the request's
/// stream hint wins when present; otherwise the upstream `Content-Type`
/// decides: only explicitly binary types opt out of flushing, everything
/// else (including an absent or unknown type) is treated as a live stream.
pub fn flush_decision(
    profile: StreamProfile,
    content_type: Option<&str>,
    stream_hint: Option<bool>,
) -> FlushDecision {
    match profile {
        StreamProfile::Standard => FlushDecision::Never,
        StreamProfile::Streaming => FlushDecision::Always,
        StreamProfile::Auto => {
            if let Some(hint) = stream_hint {
                return if hint {
                    FlushDecision::Always
                } else {
                    FlushDecision::Never
                };
            }
            match content_type {
                Some(ct) if is_binary_mime(ct) => FlushDecision::Never,
                _ => FlushDecision::Always,
            }
        }
    }
}

/// MIME types that are definitely not token streams.
fn is_binary_mime(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    essence.starts_with("image/")
        || essence.starts_with("video/")
        || essence.starts_with("audio/")
        || essence == "application/pdf"
        || essence == "application/octet-stream"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_profiles_ignore_everything() {
        assert_eq!(
            flush_decision(StreamProfile::Standard, Some("text/event-stream"), Some(true)),
            FlushDecision::Never
        );
        assert_eq!(
            flush_decision(StreamProfile::Streaming, Some("application/pdf"), Some(false)),
            FlushDecision::Always
        );
    }

    #[test]
    fn test_auto_streaming_mimes_flush() {
        for ct in [
            "text/event-stream",
            "application/x-ndjson",
            "text/plain",
            "text/html; charset=utf-8",
            "application/json",
            "application/json; charset=utf-8",
            "application/vnd.something+json",
        ] {
            assert_eq!(
                flush_decision(StreamProfile::Auto, Some(ct), None),
                FlushDecision::Always,
                "content-type {ct} must flush"
            );
        }
    }

    #[test]
    fn test_auto_unknown_or_missing_flushes() {
        assert_eq!(
            flush_decision(StreamProfile::Auto, None, None),
            FlushDecision::Always
        );
        assert_eq!(
            flush_decision(StreamProfile::Auto, Some(""), None),
            FlushDecision::Always
        );
    }

    #[test]
    fn test_auto_binary_mimes_do_not_flush() {
        for ct in [
            "image/png",
            "video/mp4",
            "audio/wav",
            "application/pdf",
            "application/octet-stream",
            "Image/PNG",
        ] {
            assert_eq!(
                flush_decision(StreamProfile::Auto, Some(ct), None),
                FlushDecision::Never,
                "content-type {ct} must not flush"
            );
        }
    }

    #[test]
    fn test_auto_hint_overrides_mime() {
        assert_eq!(
            flush_decision(StreamProfile::Auto, Some("application/pdf"), Some(true)),
            FlushDecision::Always
        );
        assert_eq!(
            flush_decision(StreamProfile::Auto, Some("text/event-stream"), Some(false)),
            FlushDecision::Never
        );
    }
}
