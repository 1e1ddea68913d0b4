//! Typed response that keeps the decoded data, its warnings and the raw
//! exchange details.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::time::Duration;

/// A successfully decoded response.
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
/// let response = client.call::<App>(Request::get("/v3/apps/some-guid")).await?;
///
/// println!("App: {}", response.data.name);
/// for warning in &response.warnings {
///     println!("warning: {}", warning);
/// }
/// println!("Took {:?} over {} attempt(s)", response.latency, response.attempts);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// The deserialized response data.
    pub data: T,

    /// Non-fatal warnings the server attached to this response.
    pub warnings: Vec<String>,

    /// The raw response body.
    pub raw_body: Bytes,

    /// The HTTP status code of the response.
    pub status: StatusCode,

    /// The response headers.
    pub headers: HeaderMap,

    /// The total latency of the call, including all retry attempts.
    pub latency: Duration,

    /// The number of attempts made to complete this request.
    ///
    /// This will be `1` for requests that succeeded on the first try,
    /// and higher for requests that required retries.
    pub attempts: usize,
}

impl<T> Response<T> {
    /// Maps the response data to a different type using the provided function.
    ///
    /// # Examples
    ///
    /// ```
    /// # use cplane::{Envelope, Response};
    /// # use http::{HeaderMap, StatusCode};
    /// let response = Envelope::new(StatusCode::OK, HeaderMap::new(), "42".into())
    ///     .into_response(42);
    ///
    /// let string_response = response.map(|n| n.to_string());
    /// assert_eq!(string_response.data, "42");
    /// ```
    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            data: f(self.data),
            warnings: self.warnings,
            raw_body: self.raw_body,
            status: self.status,
            headers: self.headers,
            latency: self.latency,
            attempts: self.attempts,
        }
    }

    /// Returns `true` if the request required retries.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Returns a reference to a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

impl<T> AsRef<T> for Response<T> {
    fn as_ref(&self) -> &T {
        &self.data
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
