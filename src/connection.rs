//! The lowest layer of the chain: one request, one exchange.

use crate::{error::TransportStage, Envelope, Error, Request, Result};
use async_trait::async_trait;
use http::HeaderMap;
use std::error::Error as StdError;
use std::time::{Duration, Instant};
use url::Url;

/// Sends a single request and returns whatever the server answered.
///
/// Implementations perform exactly one exchange: no retries, no
/// authentication. Any status code is returned as an [`Envelope`]; only
/// failures to obtain a response are errors.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Performs one exchange.
    async fn make(&self, request: &Request) -> Result<Envelope>;
}

/// A [`Connection`] backed by `reqwest`.
pub struct HttpConnection {
    http_client: reqwest::Client,
    base_url: Url,
    default_headers: HeaderMap,
    timeout: Option<Duration>,
}

/// Settings for [`HttpConnection::new`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    /// Accept any server certificate. Only meant for test environments.
    pub skip_ssl_validation: bool,
    /// Timeout for establishing a connection.
    pub dial_timeout: Option<Duration>,
    /// Timeout for a whole exchange.
    pub timeout: Option<Duration>,
    /// Headers added to every request.
    pub default_headers: HeaderMap,
    /// Value of the `User-Agent` header.
    pub user_agent: Option<String>,
}

impl HttpConnection {
    /// Creates a connection for the given base URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] if the HTTP client cannot be built.
    pub fn new(base_url: Url, config: ConnectionConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.skip_ssl_validation)
            .tcp_keepalive(Duration::from_secs(30));
        if let Some(dial_timeout) = config.dial_timeout {
            builder = builder.connect_timeout(dial_timeout);
        }
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        let http_client = builder.build().map_err(|e| {
            Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
        })?;

        Ok(Self {
            http_client,
            base_url,
            default_headers: config.default_headers,
            timeout: config.timeout,
        })
    }

    /// The base URL relative targets are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn transport_error(url: &Url, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            return Error::Timeout;
        }
        if is_unknown_authority(&e) {
            return Error::UnverifiedServer {
                url: url.to_string(),
            };
        }
        let stage = if e.is_connect() {
            TransportStage::Connect
        } else {
            TransportStage::Exchange
        };
        Error::request(stage, e)
    }
}

/// Returns `true` when the server's certificate was signed by an authority
/// the client does not trust. Expired certificates, name mismatches and other
/// TLS failures are ordinary connect failures.
fn is_unknown_authority(error: &(dyn StdError + 'static)) -> bool {
    let mut source = Some(error);
    while let Some(err) = source {
        let message = err.to_string().to_ascii_lowercase();
        if message.contains("unknownissuer")
            || message.contains("unknown issuer")
            || message.contains("unable to get local issuer certificate")
        {
            return true;
        }
        source = err.source();
    }
    false
}

#[async_trait]
impl Connection for HttpConnection {
    async fn make(&self, request: &Request) -> Result<Envelope> {
        let url = request.url(&self.base_url)?;
        let start = Instant::now();

        tracing::debug!(
            method = %request.method(),
            url = %url,
            "Executing HTTP request"
        );

        let mut builder = self
            .http_client
            .request(request.method().clone(), url.clone());

        for (name, value) in &self.default_headers {
            builder = builder.header(name, value);
        }
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.body() {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::transport_error(&url, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        // A body that breaks off mid-read means the exchange was incomplete.
        let body = response
            .bytes()
            .await
            .map_err(|e| Self::transport_error(&url, e))?;

        let mut envelope = Envelope::new(status, headers, body);
        envelope.latency = start.elapsed();

        tracing::info!(
            status = status.as_u16(),
            latency_ms = envelope.latency.as_millis(),
            warnings = envelope.warnings.len(),
            "Received HTTP response"
        );

        Ok(envelope)
    }
}
