mod interceptor;

pub use interceptor::{ErrorAction, FnInterceptor, Interceptor, RequestAction, ResponseAction};

use std::sync::Arc;

use anyhow::{Error, Result};
use futures::StreamExt;
use tracing::debug;

use crate::request::HttpRequest;
use crate::response::StreamedResponse;
use crate::transport::{Transport, TransportError};

/// Converts an ordered interceptor list and an inner transport into a
/// single asynchronous send operation.
///
/// Stage ordering per request: request handlers in declaration order, then
/// the transport, then response handlers (declaration order, or reverse
/// when configured), with error handlers only on failure paths. Cloning is
/// cheap and shares the interceptor chain.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    interceptors: Vec<Arc<dyn Interceptor>>,
    transport: Option<Arc<dyn Transport>>,
    reverse_response: bool,
}

impl Pipeline {
    pub fn new(
        interceptors: Vec<Arc<dyn Interceptor>>,
        transport: Option<Arc<dyn Transport>>,
    ) -> Self {
        Self::with_options(interceptors, transport, false)
    }

    /// `reverse_response` runs response handlers in reverse declaration
    /// order, which gives onion-style wrapping semantics.
    pub fn with_options(
        interceptors: Vec<Arc<dyn Interceptor>>,
        transport: Option<Arc<dyn Transport>>,
        reverse_response: bool,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                interceptors,
                transport,
                reverse_response,
            }),
        }
    }

    pub async fn send(&self, request: HttpRequest) -> Result<StreamedResponse> {
        self.inner.clone().execute(request).await
    }

    /// Disposes every interceptor, then the transport.
    pub async fn close(&self) {
        for interceptor in &self.inner.interceptors {
            interceptor.dispose().await;
        }
        if let Some(transport) = &self.inner.transport {
            transport.close().await;
        }
    }
}

impl PipelineInner {
    async fn execute(self: Arc<Self>, request: HttpRequest) -> Result<StreamedResponse> {
        let mut request = request;
        let mut resolved: Option<StreamedResponse> = None;
        let mut skip_response_stages = false;
        let mut forward_committed = false;

        for interceptor in &self.interceptors {
            // The handler consumes the request; keep a copy for the error
            // stage, which still needs one after a rejection.
            let checkpoint = request.clone();
            match interceptor.on_request(request).await {
                RequestAction::Next(next) => request = next,
                RequestAction::Resolve {
                    response,
                    skip_response_stages: skip,
                } => {
                    if skip {
                        return Ok(response);
                    }
                    request = response.request.clone();
                    resolved = Some(response);
                    skip_response_stages = false;
                }
                RequestAction::ResolveAndNext {
                    response,
                    skip_response_stages: skip,
                } => {
                    request = response.request.clone();
                    resolved = Some(response);
                    skip_response_stages = skip;
                    forward_committed = true;
                }
                RequestAction::Reject {
                    error,
                    skip_error_stages,
                } => {
                    if skip_error_stages {
                        return Err(error);
                    }
                    return self.run_error_stage(checkpoint, error).await;
                }
            }
        }

        match resolved {
            None => self.forward(request).await,
            Some(response) if forward_committed => {
                // The caller gets the resolved response now; the committed
                // forward runs to completion on its own, unaffected by the
                // caller dropping its future.
                let inner = self.clone();
                let background = request.clone();
                tokio::spawn(async move {
                    match inner.forward(background).await {
                        Ok(response) => drain(response).await,
                        Err(err) => debug!(error = %err, "background forward failed"),
                    }
                });
                if skip_response_stages {
                    return Ok(response);
                }
                self.run_response_stage(request, response).await
            }
            Some(response) => self.run_response_stage(request, response).await,
        }
    }

    async fn forward(self: Arc<Self>, request: HttpRequest) -> Result<StreamedResponse> {
        let Some(transport) = &self.transport else {
            return Err(
                TransportError::new("no transport configured and no interceptor resolved").into(),
            );
        };
        match transport.send(request.clone()).await {
            Ok(response) => self.run_response_stage(request, response).await,
            Err(error) => self.run_error_stage(request, error).await,
        }
    }

    async fn run_response_stage(
        &self,
        request: HttpRequest,
        mut response: StreamedResponse,
    ) -> Result<StreamedResponse> {
        let order: Vec<&Arc<dyn Interceptor>> = if self.reverse_response {
            self.interceptors.iter().rev().collect()
        } else {
            self.interceptors.iter().collect()
        };
        for interceptor in order {
            match interceptor.on_response(response).await {
                ResponseAction::Next(next) => response = next,
                ResponseAction::Resolve(resolved) => return Ok(resolved),
                ResponseAction::Reject {
                    error,
                    skip_error_stages,
                } => {
                    if skip_error_stages {
                        return Err(error);
                    }
                    return self.run_error_stage(request, error).await;
                }
            }
        }
        Ok(response)
    }

    async fn run_error_stage(
        &self,
        mut request: HttpRequest,
        mut error: Error,
    ) -> Result<StreamedResponse> {
        for interceptor in &self.interceptors {
            match interceptor.on_error(request, error).await {
                ErrorAction::Next {
                    request: next_request,
                    error: next_error,
                } => {
                    request = next_request;
                    error = next_error;
                }
                ErrorAction::Resolve(response) => return Ok(response),
                ErrorAction::Reject(rejected) => return Err(rejected),
            }
        }
        Err(error)
    }
}

/// Consumes a response body so side effects chained onto it, such as cache
/// blob writes, run to completion.
async fn drain(mut response: StreamedResponse) {
    let mut body = response.take_body();
    while let Some(chunk) = body.next().await {
        if chunk.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use http::{StatusCode, Uri};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct EchoTransport {
        calls: AtomicUsize,
    }

    impl EchoTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn send(&self, request: HttpRequest) -> Result<StreamedResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StreamedResponse::new(StatusCode::OK, request).with_body_bytes("origin"))
        }
    }

    fn tracer(label: &'static str, trace: Arc<Mutex<Vec<String>>>) -> Arc<dyn Interceptor> {
        let request_trace = trace.clone();
        let response_trace = trace;
        Arc::new(
            FnInterceptor::new()
                .request(move |request| {
                    request_trace.lock().push(format!("req:{label}"));
                    async move { RequestAction::Next(request) }
                })
                .response(move |response| {
                    response_trace.lock().push(format!("resp:{label}"));
                    async move { ResponseAction::Next(response) }
                }),
        )
    }

    fn test_url() -> Uri {
        Uri::from_static("https://server/test")
    }

    #[tokio::test]
    async fn request_stages_run_in_declared_order_response_in_declared_order() -> Result<()> {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            vec![tracer("a", trace.clone()), tracer("b", trace.clone())],
            Some(EchoTransport::new()),
        );
        pipeline.send(HttpRequest::get(test_url())).await?;
        assert_eq!(
            *trace.lock(),
            vec!["req:a", "req:b", "resp:a", "resp:b"],
            "declared order on both stages by default"
        );
        Ok(())
    }

    #[tokio::test]
    async fn reverse_response_flag_reverses_only_response_stage() -> Result<()> {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::with_options(
            vec![tracer("a", trace.clone()), tracer("b", trace.clone())],
            Some(EchoTransport::new()),
            true,
        );
        pipeline.send(HttpRequest::get(test_url())).await?;
        assert_eq!(*trace.lock(), vec!["req:a", "req:b", "resp:b", "resp:a"]);
        Ok(())
    }

    #[tokio::test]
    async fn resolve_with_skip_bypasses_transport_and_response_stage() -> Result<()> {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let resolver = Arc::new(FnInterceptor::new().request(|request| async move {
            RequestAction::Resolve {
                response: StreamedResponse::new(StatusCode::OK, request).with_body_bytes("local"),
                skip_response_stages: true,
            }
        }));
        let transport = EchoTransport::new();
        let pipeline = Pipeline::new(
            vec![resolver, tracer("late", trace.clone())],
            Some(transport.clone()),
        );

        let response = pipeline.send(HttpRequest::get(test_url())).await?;
        assert_eq!(response.body.collect().await?, "local");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert!(trace.lock().is_empty(), "no later stage may run");
        Ok(())
    }

    #[tokio::test]
    async fn resolve_without_skip_still_runs_later_stages() -> Result<()> {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let resolver = Arc::new(FnInterceptor::new().request(|request| async move {
            RequestAction::Resolve {
                response: StreamedResponse::new(StatusCode::OK, request).with_body_bytes("local"),
                skip_response_stages: false,
            }
        }));
        let transport = EchoTransport::new();
        let pipeline = Pipeline::new(
            vec![resolver, tracer("late", trace.clone())],
            Some(transport.clone()),
        );

        let response = pipeline.send(HttpRequest::get(test_url())).await?;
        assert_eq!(response.body.collect().await?, "local");
        assert_eq!(
            transport.calls.load(Ordering::SeqCst),
            0,
            "a plain resolve must not forward"
        );
        assert_eq!(*trace.lock(), vec!["req:late", "resp:late"]);
        Ok(())
    }

    #[tokio::test]
    async fn resolve_and_next_returns_response_and_forwards_in_background() -> Result<()> {
        let resolver = Arc::new(FnInterceptor::new().request(|request| async move {
            RequestAction::ResolveAndNext {
                response: StreamedResponse::new(StatusCode::OK, request).with_body_bytes("stale"),
                skip_response_stages: false,
            }
        }));
        let transport = EchoTransport::new();
        let pipeline = Pipeline::new(vec![resolver], Some(transport.clone()));

        let response = pipeline.send(HttpRequest::get(test_url())).await?;
        assert_eq!(response.body.collect().await?, "stale");

        for _ in 0..50 {
            if transport.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn reject_with_skip_bypasses_error_stage() {
        let rejecting = Arc::new(FnInterceptor::new().request(|_request| async move {
            RequestAction::Reject {
                error: anyhow!("denied"),
                skip_error_stages: true,
            }
        }));
        let recovering = Arc::new(FnInterceptor::new().error(|request, _error| async move {
            ErrorAction::Resolve(StreamedResponse::new(StatusCode::OK, request))
        }));
        let pipeline = Pipeline::new(vec![rejecting, recovering], Some(EchoTransport::new()));

        let err = pipeline
            .send(HttpRequest::get(test_url()))
            .await
            .expect_err("skip flag must bypass recovery");
        assert!(err.to_string().contains("denied"));
    }

    #[tokio::test]
    async fn error_stage_can_rewrite_the_error() {
        let rejecting = Arc::new(FnInterceptor::new().request(|_request| async move {
            RequestAction::Reject {
                error: anyhow!("original"),
                skip_error_stages: false,
            }
        }));
        let rewriting = Arc::new(FnInterceptor::new().error(|request, error| async move {
            ErrorAction::Next {
                request,
                error: error.context("annotated"),
            }
        }));
        let pipeline = Pipeline::new(vec![rejecting, rewriting], Some(EchoTransport::new()));

        let err = pipeline
            .send(HttpRequest::get(test_url()))
            .await
            .expect_err("no handler resolves");
        assert!(err.to_string().contains("annotated"));
    }

    #[tokio::test]
    async fn missing_transport_without_resolver_fails() {
        let pipeline = Pipeline::new(Vec::new(), None);
        let err = pipeline
            .send(HttpRequest::get(test_url()))
            .await
            .expect_err("nothing can produce a response");
        assert!(err.downcast_ref::<TransportError>().is_some());
    }

    #[tokio::test]
    async fn close_disposes_interceptors() {
        struct Disposable {
            disposed: Arc<AtomicBool>,
        }

        #[async_trait]
        impl Interceptor for Disposable {
            async fn dispose(&self) {
                self.disposed.store(true, Ordering::SeqCst);
            }
        }

        let disposed = Arc::new(AtomicBool::new(false));
        let pipeline = Pipeline::new(
            vec![Arc::new(Disposable {
                disposed: disposed.clone(),
            })],
            None,
        );
        pipeline.close().await;
        assert!(disposed.load(Ordering::SeqCst));
    }
}
