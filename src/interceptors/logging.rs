use anyhow::Error;
use async_trait::async_trait;
use http::{HeaderName, HeaderValue};
use tracing::{info, warn};

use crate::headers::cache_status::CACHE_STATUS;
use crate::pipeline::{ErrorAction, Interceptor, RequestAction, ResponseAction};
use crate::request::HttpRequest;
use crate::response::StreamedResponse;
use crate::util::request_id;

/// Tracking header the logging interceptor stamps onto each request.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Emits one structured event per pipeline stage, correlated by a stable
/// per-request ID that also travels in the tracking header.
#[derive(Debug, Default)]
pub struct LoggingInterceptor;

impl LoggingInterceptor {
    pub fn new() -> Self {
        Self
    }

    fn id_of(request: &HttpRequest) -> String {
        request
            .header_str(&REQUEST_ID_HEADER)
            .unwrap_or("-")
            .to_string()
    }
}

#[async_trait]
impl Interceptor for LoggingInterceptor {
    async fn on_request(&self, mut request: HttpRequest) -> RequestAction {
        let id = match request.header_str(&REQUEST_ID_HEADER).map(str::to_owned) {
            Some(existing) => existing,
            None => {
                let id = request_id();
                if let Ok(value) = HeaderValue::from_str(&id) {
                    request.headers.insert(REQUEST_ID_HEADER, value);
                }
                id
            }
        };
        info!(
            target: "request_log",
            id,
            method = %request.method,
            url = %request.url,
            "request dispatched"
        );
        RequestAction::Next(request)
    }

    async fn on_response(&self, response: StreamedResponse) -> ResponseAction {
        let id = Self::id_of(&response.request);
        let cache_status = response.header_str(&CACHE_STATUS).unwrap_or_default();
        info!(
            target: "request_log",
            id,
            status = response.status.as_u16(),
            cache_status,
            "response received"
        );
        ResponseAction::Next(response)
    }

    async fn on_error(&self, request: HttpRequest, error: Error) -> ErrorAction {
        warn!(
            target: "request_log",
            id = Self::id_of(&request),
            method = %request.method,
            url = %request.url,
            error = %error,
            "request failed"
        );
        ErrorAction::Next { request, error }
    }
}
