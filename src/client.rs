//! Control-plane client: one wrapper chain per instance plus the operations
//! built on top of it.
//!
//! The [`Client`] type is the main entry point. Use [`ClientBuilder`] to
//! configure and create clients.

use crate::{
    auth::{AuthWrapper, TokenSource},
    connection::{ConnectionConfig, HttpConnection},
    error::Failure,
    job::{self, JobHandle, JobPoll, JobResource, PollSettings},
    logging::RequestLogger,
    pagination::{self, Paginated},
    retry::{RetryPredicate, RetryStrategy, RetryWrapper},
    CallResult, Chain, Connection, Envelope, Error, Request, Response, Result, Wrapper,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// A client for a control-plane API.
///
/// Every request goes through the same chain: Authentication → Retry →
/// Logging → Transport. The credential held by the authentication layer is
/// shared by all clones of one client and by nothing else.
///
/// # Examples
///
/// ```no_run
/// use cplane::{Client, Request};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct App {
///     guid: String,
///     name: String,
/// }
///
/// # async fn example() -> Result<(), cplane::Failure> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// let apps = client
///     .fetch_all_pages::<App>(Request::get("/v3/apps"))
///     .await?;
/// for app in &apps.resources {
///     println!("{} {}", app.guid, app.name);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    chain: Chain,
    poll_settings: PollSettings,
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Sends a request through the chain and returns the raw envelope.
    ///
    /// Statuses >= 400 are returned as envelopes, not errors.
    pub async fn send(&self, request: &Request) -> Result<Envelope> {
        self.inner.chain.send(request).await
    }

    /// Sends a request and decodes the response into `T`.
    ///
    /// On failure the [`Failure`] still carries the response's warnings.
    pub async fn call<T>(&self, request: Request) -> CallResult<Response<T>>
    where
        T: DeserializeOwned,
    {
        let start = Instant::now();
        let envelope = self.send(&request).await?;
        let decoded = envelope.decode::<T>();
        finish(envelope, decoded, start)
    }

    /// Sends a request whose success response carries no body of interest.
    pub async fn execute(&self, request: Request) -> CallResult<Response<()>> {
        let start = Instant::now();
        let envelope = self.send(&request).await?;
        let checked = match envelope.error() {
            Some(error) => Err(error),
            None => Ok(()),
        };
        finish(envelope, checked, start)
    }

    /// Makes a GET request to the specified path.
    pub async fn get<Res>(&self, path: impl Into<String>) -> CallResult<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        self.call(Request::new(Method::GET, path)).await
    }

    /// Makes a POST request to the specified path with a JSON body.
    pub async fn post<Req, Res>(&self, path: impl Into<String>, body: &Req) -> CallResult<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        self.call(Request::new(Method::POST, path).with_json(body)?).await
    }

    /// Makes a PUT request to the specified path with a JSON body.
    pub async fn put<Req, Res>(&self, path: impl Into<String>, body: &Req) -> CallResult<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        self.call(Request::new(Method::PUT, path).with_json(body)?).await
    }

    /// Makes a PATCH request to the specified path with a JSON body.
    pub async fn patch<Req, Res>(&self, path: impl Into<String>, body: &Req) -> CallResult<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        self.call(Request::new(Method::PATCH, path).with_json(body)?).await
    }

    /// Makes a DELETE request to the specified path.
    pub async fn delete(&self, path: impl Into<String>) -> CallResult<Response<()>> {
        self.execute(Request::new(Method::DELETE, path)).await
    }

    /// Fetches every page of a paginated collection.
    ///
    /// Either all resources are returned or none; warnings are returned in
    /// both cases.
    pub async fn fetch_all_pages<T>(&self, first: Request) -> CallResult<Paginated<T>>
    where
        T: DeserializeOwned,
    {
        pagination::fetch_all_pages(&self.inner.chain, first).await
    }

    /// Polls an existing job until it reaches a terminal state.
    pub fn poll_job<J: JobResource>(&self, handle: JobHandle) -> JobPoll<J> {
        job::poll(self.inner.chain.clone(), handle, self.inner.poll_settings)
    }

    /// Submits a request that starts an asynchronous operation and polls the
    /// resulting job.
    ///
    /// The job is located through its `links.self.href`, or the response's
    /// `Location` header.
    pub fn submit_job<J: JobResource>(&self, request: Request) -> JobPoll<J> {
        job::submit(self.inner.chain.clone(), request, self.inner.poll_settings)
    }

    /// The configured polling settings.
    pub fn poll_settings(&self) -> PollSettings {
        self.inner.poll_settings
    }
}

fn finish<T>(envelope: Envelope, decoded: Result<T>, start: Instant) -> CallResult<Response<T>> {
    match decoded {
        Ok(data) => {
            let mut response = envelope.into_response(data);
            response.latency = start.elapsed();
            Ok(response)
        }
        Err(error) => {
            tracing::warn!(
                error = %error,
                status = envelope.status.as_u16(),
                "Request failed"
            );
            Err(Failure::new(error, envelope.warnings))
        }
    }
}

/// Builds the `User-Agent` value `"{app}/{version} ({arch}; {os})"`.
pub fn user_agent(app_name: &str, app_version: &str) -> String {
    format!(
        "{}/{} ({}; {})",
        app_name,
        app_version,
        std::env::consts::ARCH,
        std::env::consts::OS
    )
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use cplane::{ClientBuilder, RetryStrategy};
/// use std::time::Duration;
///
/// # fn example() -> Result<(), cplane::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://api.example.com")?
///     .timeout(Duration::from_secs(30))
///     .retry_strategy(RetryStrategy::Immediate { max_retries: 3 })
///     .user_agent("my-tool", "1.0.0")
///     .polling_interval(Duration::from_secs(2))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    default_headers: HeaderMap,
    user_agent: Option<String>,
    timeout: Option<Duration>,
    dial_timeout: Option<Duration>,
    skip_ssl_validation: bool,
    retry_strategy: RetryStrategy,
    retry_predicate: Option<Box<dyn RetryPredicate>>,
    token_source: Option<Arc<dyn TokenSource>>,
    request_logging: bool,
    poll_settings: PollSettings,
    connection: Option<Arc<dyn Connection>>,
    wrappers: Vec<Arc<dyn Wrapper>>,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            user_agent: None,
            timeout: None,
            dial_timeout: None,
            skip_ssl_validation: false,
            retry_strategy: RetryStrategy::default(),
            retry_predicate: None,
            token_source: None,
            request_logging: false,
            poll_settings: PollSettings::default(),
            connection: None,
            wrappers: Vec::new(),
        }
    }

    /// Sets the base URL for all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Adds a default header that will be included in all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Sets the `User-Agent` from an application name and version.
    pub fn user_agent(mut self, app_name: &str, app_version: &str) -> Self {
        self.user_agent = Some(user_agent(app_name, app_version));
        self
    }

    /// Sets the timeout for a single exchange.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the connect timeout.
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    /// Accept any server certificate. Never use against production systems.
    pub fn skip_ssl_validation(mut self, skip: bool) -> Self {
        self.skip_ssl_validation = skip;
        self
    }

    /// Sets the retry strategy. Defaults to two immediate retries.
    pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    /// Sets a custom retry predicate.
    ///
    /// By default only failures that cannot repeat a side effect are retried,
    /// see [`crate::retry::RetryOnSafeFailure`].
    pub fn retry_predicate(mut self, predicate: Box<dyn RetryPredicate>) -> Self {
        self.retry_predicate = Some(predicate);
        self
    }

    /// Authenticates every request with tokens from `source`.
    pub fn token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    /// Enables tracing of every request and response.
    pub fn request_logging(mut self, enabled: bool) -> Self {
        self.request_logging = enabled;
        self
    }

    /// Sets the wait between job polls. Defaults to 5 seconds.
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.poll_settings.interval = interval;
        self
    }

    /// Gives up polling a job after this long. Unlimited by default.
    pub fn polling_timeout(mut self, timeout: Duration) -> Self {
        self.poll_settings.timeout = Some(timeout);
        self
    }

    /// Replaces the HTTP transport, e.g. with a test double.
    pub fn connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Adds a wrapper outside the built-in ones. Wrappers added later run
    /// first.
    pub fn wrapper(mut self, wrapper: Arc<dyn Wrapper>) -> Self {
        self.wrappers.push(wrapper);
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if no base URL was provided and no connection was
    /// supplied, or if the HTTP client cannot be built.
    pub fn build(self) -> Result<Client> {
        let connection: Arc<dyn Connection> = match self.connection {
            Some(connection) => connection,
            None => {
                let base_url = self
                    .base_url
                    .ok_or_else(|| Error::ConfigurationError("Base URL is required".to_string()))?;
                Arc::new(HttpConnection::new(
                    base_url,
                    ConnectionConfig {
                        skip_ssl_validation: self.skip_ssl_validation,
                        dial_timeout: self.dial_timeout,
                        timeout: self.timeout,
                        default_headers: self.default_headers,
                        user_agent: self.user_agent,
                    },
                )?)
            }
        };

        let mut chain = Chain::new(connection);
        if self.request_logging {
            chain = chain.wrap(Arc::new(RequestLogger::new()));
        }
        let retry = match self.retry_predicate {
            Some(predicate) => RetryWrapper::with_predicate(self.retry_strategy, predicate),
            None => RetryWrapper::new(self.retry_strategy),
        };
        chain = chain.wrap(Arc::new(retry));
        if let Some(source) = self.token_source {
            chain = chain.wrap(Arc::new(AuthWrapper::new(source)));
        }
        for wrapper in self.wrappers {
            chain = chain.wrap(wrapper);
        }

        Ok(Client {
            inner: Arc::new(ClientInner {
                chain,
                poll_settings: self.poll_settings,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
