use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

/// One configured backend target. Identity is the name; the URL is the base
/// every request path resolves against.
///
/// Cheap to clone: hot fields are `Arc<str>` and the active-request counter
/// is shared, so clones handed to requests all observe the same count.
#[derive(Debug, Clone)]
pub struct Endpoint {
    name: Arc<str>,
    url: Url,
    backend_type: Arc<str>,
    active_requests: Arc<AtomicUsize>,
}

impl Endpoint {
    pub fn new(name: impl AsRef<str>, url: Url, backend_type: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            url,
            backend_type: Arc::from(backend_type.as_ref()),
            active_requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Parse `url` and build the endpoint, for callers holding plain strings.
    pub fn parse(
        name: impl AsRef<str>,
        url: &str,
        backend_type: impl AsRef<str>,
    ) -> Result<Self, url::ParseError> {
        Ok(Self::new(name, Url::parse(url)?, backend_type))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[inline]
    pub fn backend_type(&self) -> &str {
        &self.backend_type
    }

    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_active(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_active(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}
