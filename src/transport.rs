use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::request::HttpRequest;
use crate::response::StreamedResponse;

/// Failure raised by the inner transport: connection refused, DNS, TLS,
/// read errors. Kept as a distinct type so callers can classify it apart
/// from interceptor-raised failures.
#[derive(Debug, Error)]
#[error("transport failure: {message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The exchange the pipeline wraps. Connection management, TLS and
/// timeouts all live behind this seam.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<StreamedResponse>;

    async fn close(&self) {}
}
