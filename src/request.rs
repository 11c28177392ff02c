use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use parking_lot::Mutex;

use crate::body::BodyStream;

/// Payload of an outbound request. `Bytes` bodies are finite and can be
/// replayed; `Stream` bodies may be consumed once.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Stream(SharedBodyStream),
}

/// Take-once handle around a streamed request body. Clones share the
/// underlying stream, so the at-most-once property holds across the
/// request clones the pipeline makes.
#[derive(Clone, Default)]
pub struct SharedBodyStream {
    inner: Arc<Mutex<Option<BodyStream>>>,
}

impl SharedBodyStream {
    pub fn new(stream: BodyStream) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(stream))),
        }
    }

    /// Removes and returns the stream. `None` once it has been consumed.
    pub fn take(&self) -> Option<BodyStream> {
        self.inner.lock().take()
    }
}

impl fmt::Debug for SharedBodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedBodyStream")
    }
}

/// An outbound request as seen by the pipeline. Interceptors receive it by
/// value and hand it forward through their stage action, so mutations are
/// visible to every later stage.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Uri,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn new(method: Method, url: Uri) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: Uri) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_body_stream_is_consumed_once() {
        let shared = SharedBodyStream::new(BodyStream::from_bytes("payload"));
        let cloned = shared.clone();
        assert!(shared.take().is_some());
        assert!(cloned.take().is_none(), "clone shares the same stream");
    }

    #[test]
    fn builder_sets_headers() {
        let request = HttpRequest::get(Uri::from_static("https://example.com/a")).with_header(
            http::header::ACCEPT,
            HeaderValue::from_static("text/plain"),
        );
        assert_eq!(request.header_str(&http::header::ACCEPT), Some("text/plain"));
        assert_eq!(request.method, Method::GET);
    }
}
