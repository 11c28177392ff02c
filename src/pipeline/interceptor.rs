use anyhow::Error;
use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::request::HttpRequest;
use crate::response::StreamedResponse;

/// Outcome of a request-stage handler.
#[derive(Debug)]
pub enum RequestAction {
    /// Hand the (possibly rewritten) request to the next stage.
    Next(HttpRequest),
    /// Complete with `response`. With `skip_response_stages` set the call
    /// finishes immediately; otherwise the remaining request handlers still
    /// run and the response then passes through the response stage.
    Resolve {
        response: StreamedResponse,
        skip_response_stages: bool,
    },
    /// Complete the caller with `response` while still forwarding the
    /// request to the transport in the background.
    ResolveAndNext {
        response: StreamedResponse,
        skip_response_stages: bool,
    },
    Reject {
        error: Error,
        skip_error_stages: bool,
    },
}

/// Outcome of a response-stage handler.
#[derive(Debug)]
pub enum ResponseAction {
    Next(StreamedResponse),
    /// Complete the call with `response`, skipping later response handlers.
    Resolve(StreamedResponse),
    Reject {
        error: Error,
        skip_error_stages: bool,
    },
}

/// Outcome of an error-stage handler.
#[derive(Debug)]
pub enum ErrorAction {
    /// Forward the (possibly rewritten) request and error to the next
    /// error handler.
    Next { request: HttpRequest, error: Error },
    /// Complete the call with a synthetic response.
    Resolve(StreamedResponse),
    /// Complete the call with `error`, skipping later error handlers.
    Reject(Error),
}

/// A stage in the pipeline. Every handler defaults to forwarding, so an
/// interceptor only implements the stages it cares about. One instance
/// serves many concurrent requests; per-request state belongs on the
/// request or response, never on the interceptor itself.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn on_request(&self, request: HttpRequest) -> RequestAction {
        RequestAction::Next(request)
    }

    async fn on_response(&self, response: StreamedResponse) -> ResponseAction {
        ResponseAction::Next(response)
    }

    async fn on_error(&self, request: HttpRequest, error: Error) -> ErrorAction {
        ErrorAction::Next { request, error }
    }

    /// Invoked once when the owning pipeline closes.
    async fn dispose(&self) {}
}

type RequestHandler = Box<dyn Fn(HttpRequest) -> BoxFuture<'static, RequestAction> + Send + Sync>;
type ResponseHandler =
    Box<dyn Fn(StreamedResponse) -> BoxFuture<'static, ResponseAction> + Send + Sync>;
type ErrorHandler =
    Box<dyn Fn(HttpRequest, Error) -> BoxFuture<'static, ErrorAction> + Send + Sync>;

/// Interceptor assembled from closures, for callers who prefer inline
/// handler definitions over a named type.
#[derive(Default)]
pub struct FnInterceptor {
    on_request: Option<RequestHandler>,
    on_response: Option<ResponseHandler>,
    on_error: Option<ErrorHandler>,
}

impl FnInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RequestAction> + Send + 'static,
    {
        self.on_request = Some(Box::new(move |request| Box::pin(handler(request))));
        self
    }

    pub fn response<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(StreamedResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResponseAction> + Send + 'static,
    {
        self.on_response = Some(Box::new(move |response| Box::pin(handler(response))));
        self
    }

    pub fn error<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(HttpRequest, Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ErrorAction> + Send + 'static,
    {
        self.on_error = Some(Box::new(move |request, error| {
            Box::pin(handler(request, error))
        }));
        self
    }
}

#[async_trait]
impl Interceptor for FnInterceptor {
    async fn on_request(&self, request: HttpRequest) -> RequestAction {
        match &self.on_request {
            Some(handler) => handler(request).await,
            None => RequestAction::Next(request),
        }
    }

    async fn on_response(&self, response: StreamedResponse) -> ResponseAction {
        match &self.on_response {
            Some(handler) => handler(response).await,
            None => ResponseAction::Next(response),
        }
    }

    async fn on_error(&self, request: HttpRequest, error: Error) -> ErrorAction {
        match &self.on_error {
            Some(handler) => handler(request, error).await,
            None => ErrorAction::Next { request, error },
        }
    }
}
