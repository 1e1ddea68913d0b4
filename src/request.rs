//! Request type shared by every layer of the wrapper chain.

use crate::{Error, Result};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use url::Url;

/// Where a request is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A path relative to the client's base URL.
    Path(String),
    /// A fully qualified URL, e.g. a pagination link returned by the server.
    Url(Url),
}

impl Target {
    /// Resolves this target against a base URL.
    pub fn resolve(&self, base: &Url) -> Result<Url> {
        match self {
            Target::Url(url) => Ok(url.clone()),
            Target::Path(path) => {
                let (path, query) = match path.split_once('?') {
                    Some((path, query)) => (path, Some(query)),
                    None => (path.as_str(), None),
                };
                let mut url = base.clone();
                let joined = format!(
                    "{}/{}",
                    base.path().trim_end_matches('/'),
                    path.trim_start_matches('/')
                );
                url.set_path(&joined);
                if query.is_some() {
                    url.set_query(query);
                }
                Ok(url)
            }
        }
    }
}

/// A single HTTP request.
///
/// A `Request` is immutable once built. The body is kept as [`Bytes`], so any
/// layer can send the same request again without consuming it.
///
/// # Examples
///
/// ```
/// use cplane::Request;
///
/// let request = Request::get("/v3/apps")
///     .with_query_param("names", "my-app")
///     .with_header("Accept", "application/json")
///     .unwrap();
///
/// assert_eq!(request.method(), &http::Method::GET);
/// assert!(request.body().is_none());
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    target: Target,
    headers: HeaderMap,
    query_params: Vec<(String, String)>,
    body: Option<Bytes>,
}

impl Request {
    /// Creates a request to a path relative to the base URL.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self::with_target(method, Target::Path(path.into()))
    }

    /// Creates a request to an absolute URL.
    pub fn to_url(method: Method, url: Url) -> Self {
        Self::with_target(method, Target::Url(url))
    }

    fn with_target(method: Method, target: Target) -> Self {
        Self {
            method,
            target,
            headers: HeaderMap::new(),
            query_params: Vec::new(),
            body: None,
        }
    }

    /// Shorthand for a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Shorthand for a POST request.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Shorthand for a DELETE request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Adds a header to the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Adds a query parameter. Repeated keys are kept in insertion order.
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.push((key.into(), value.into()));
        self
    }

    /// Sets a raw body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes `body` as JSON and sets the content type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SerializationFailed`] if serialization fails.
    pub fn with_json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        let json = serde_json::to_vec(body).map_err(|e| Error::SerializationFailed(e.to_string()))?;
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(Bytes::from(json));
        Ok(self)
    }

    /// Returns a copy of this request with the given header value replaced.
    pub(crate) fn with_header_value(&self, name: HeaderName, value: HeaderValue) -> Self {
        let mut request = self.clone();
        request.headers.insert(name, value);
        request
    }

    /// Returns a body-less request with the same method and headers aimed at
    /// another URL. Used to follow pagination links.
    pub(crate) fn follow(&self, url: Url) -> Self {
        let mut headers = self.headers.clone();
        headers.remove(header::CONTENT_TYPE);
        Self {
            method: self.method.clone(),
            target: Target::Url(url),
            headers,
            query_params: Vec::new(),
            body: None,
        }
    }

    /// The HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request target.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The query parameters.
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query_params
    }

    /// The request body, if any.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Returns `true` for methods that can be repeated without additional
    /// side effects.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
        )
    }

    /// Builds the full URL for this request.
    pub fn url(&self, base: &Url) -> Result<Url> {
        let mut url = self.target.resolve(base)?;
        if !self.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query_params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}
