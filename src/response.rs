use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::body::BodyStream;
use crate::request::HttpRequest;

/// A response whose payload is an at-most-once chunk stream, together with
/// a back-reference to the request that produced it.
#[derive(Debug)]
pub struct StreamedResponse {
    pub status: StatusCode,
    pub reason: String,
    pub content_length: Option<u64>,
    pub headers: HeaderMap,
    pub body: BodyStream,
    pub request: HttpRequest,
}

impl StreamedResponse {
    pub fn new(status: StatusCode, request: HttpRequest) -> Self {
        Self {
            status,
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            content_length: None,
            headers: HeaderMap::new(),
            body: BodyStream::empty(),
            request,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body_bytes(mut self, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        self.content_length = Some(bytes.len() as u64);
        self.body = BodyStream::from_bytes(bytes);
        self
    }

    pub fn with_body(mut self, content_length: Option<u64>, body: BodyStream) -> Self {
        self.content_length = content_length;
        self.body = body;
        self
    }

    /// Detaches the body, leaving an exhausted stream in place.
    pub fn take_body(&mut self) -> BodyStream {
        std::mem::take(&mut self.body)
    }

    pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}
