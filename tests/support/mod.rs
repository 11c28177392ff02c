use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use http::{HeaderName, HeaderValue, StatusCode, Uri};

use fetchpipe::{HttpRequest, StreamedResponse, Transport, TransportError};

/// Scripted origin: a handler receives the request and the zero-based call
/// index and decides the reply. Counts every call so tests can assert how
/// often the origin was contacted.
pub struct MockTransport {
    handler: Handler,
    calls: AtomicUsize,
}

type Handler = Box<dyn Fn(&HttpRequest, usize) -> Result<MockReply> + Send + Sync>;

pub struct MockReply {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl MockReply {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest, usize) -> Result<MockReply> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
        })
    }

    /// Origin that always answers the same way.
    pub fn always(reply: impl Fn() -> MockReply + Send + Sync + 'static) -> Arc<Self> {
        Self::new(move |_request, _call| Ok(reply()))
    }

    /// Origin whose transport is unreachable.
    pub fn failing(message: &'static str) -> Arc<Self> {
        Self::new(move |_request, _call| Err(TransportError::new(message).into()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<StreamedResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = (self.handler)(&request, call)?;

        let mut response = StreamedResponse::new(reply.status, request);
        for (name, value) in reply.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|_| anyhow!("invalid mock header name {name:?}"))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|_| anyhow!("invalid mock header value {value:?}"))?;
            response.headers.insert(name, value);
        }
        Ok(response.with_body_bytes(reply.body))
    }
}

pub fn url(s: &str) -> Uri {
    s.parse().expect("test uri")
}

/// Collects a response body as UTF-8.
pub async fn body_string(response: StreamedResponse) -> Result<String> {
    let bytes = response.body.collect().await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Polls `probe` until it returns true or the deadline passes. Background
/// work such as blob writes finishes asynchronously, so assertions on it
/// need a grace period.
pub async fn wait_until<F>(probe: F, deadline: Duration) -> bool
where
    F: Fn() -> bool,
{
    let started = tokio::time::Instant::now();
    loop {
        if probe() {
            return true;
        }
        if started.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
