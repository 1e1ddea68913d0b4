//! Verbose request tracing.

use crate::{chain::Next, Envelope, Request, Result, Wrapper};
use async_trait::async_trait;
use http::{header, HeaderMap};
use std::time::Instant;

/// Wrapper that traces every exchange passing through it.
///
/// It only observes: the request handed to the next layer and the result
/// handed back are the ones it received. Credentials are redacted.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestLogger;

impl RequestLogger {
    /// Creates a logger.
    pub fn new() -> Self {
        Self
    }
}

fn redacted(headers: &HeaderMap) -> Vec<String> {
    headers
        .iter()
        .map(|(name, value)| {
            if name == header::AUTHORIZATION {
                format!("{}: [PRIVATE DATA HIDDEN]", name)
            } else {
                format!("{}: {}", name, value.to_str().unwrap_or("<binary>"))
            }
        })
        .collect()
}

#[async_trait]
impl Wrapper for RequestLogger {
    async fn wrap(&self, request: &Request, next: Next<'_>) -> Result<Envelope> {
        let start = Instant::now();

        tracing::debug!(
            method = %request.method(),
            target = ?request.target(),
            headers = ?redacted(request.headers()),
            body_bytes = request.body().map_or(0, |b| b.len()),
            "REQUEST"
        );

        let result = next.run(request).await;

        match &result {
            Ok(envelope) => tracing::debug!(
                status = envelope.status.as_u16(),
                latency_ms = start.elapsed().as_millis(),
                headers = ?redacted(&envelope.headers),
                body = %String::from_utf8_lossy(&envelope.body),
                "RESPONSE"
            ),
            Err(e) => tracing::debug!(
                error = %e,
                latency_ms = start.elapsed().as_millis(),
                "RESPONSE FAILED"
            ),
        }

        result
    }
}
