//! Error types for control-plane API calls.
//!
//! Errors keep whatever diagnostic context the failure produced: raw response
//! bytes for unparsable error bodies, every structured error entry the server
//! returned, and the URL of a server whose certificate could not be verified.
//!
//! Operations that accumulate warnings across several HTTP exchanges return a
//! [`Failure`] instead of a bare [`Error`], so the warnings collected before the
//! failing call are never lost.

use bytes::Bytes;
use http::StatusCode;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Boxed source error carried by transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How far a request got before the transport failed.
///
/// Used by the retry logic: a request that never left the client is always
/// safe to resend, one that was (possibly) written is only safe when the
/// method is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStage {
    /// Connecting failed (DNS, TCP, TLS handshake). Nothing was sent.
    Connect,
    /// The request may have been written, but no complete response was read.
    Exchange,
}

/// One entry of a structured `{"errors": [...]}` body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiErrorDetail {
    /// Numeric error code assigned by the server.
    #[serde(default)]
    pub code: i64,
    /// Short error name, e.g. `CF-ResourceNotFound`.
    #[serde(default)]
    pub title: String,
    /// Human readable description.
    #[serde(default)]
    pub detail: String,
}

impl fmt::Display for ApiErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.title, self.code, self.detail)
    }
}

/// The main error type for control-plane API calls.
///
/// # Examples
///
/// ```no_run
/// use cplane::{Client, Error, Request};
///
/// # async fn example() -> Result<(), cplane::Failure> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// match client.call::<serde_json::Value>(Request::get("/v3/apps")).await {
///     Ok(response) => println!("Success: {:?}", response.data),
///     Err(failure) => {
///         for warning in &failure.warnings {
///             eprintln!("warning: {}", warning);
///         }
///         match failure.error {
///             Error::Api { errors, .. } => {
///                 for e in errors {
///                     eprintln!("{}: {}", e.title, e.detail);
///                 }
///             }
///             Error::RawHttpStatus { status, raw_response } => {
///                 eprintln!("HTTP {}: {:?}", status, raw_response);
///             }
///             e => eprintln!("Other error: {}", e),
///         }
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The request could not be completed: no response was obtained.
    ///
    /// Covers connection, DNS and TLS failures as well as responses that broke
    /// off before the body was fully read.
    #[error("Request could not be completed: {source}")]
    Request {
        /// How far the request got.
        stage: TransportStage,
        /// The underlying transport error.
        #[source]
        source: BoxError,
    },

    /// The server presented a certificate signed by an unknown authority.
    #[error("x509: certificate signed by unknown authority ({url})")]
    UnverifiedServer {
        /// The URL that was being requested.
        url: String,
    },

    /// The request timed out.
    #[error("Request timed out")]
    Timeout,

    /// A response was obtained but its body did not match the expected shape.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body that failed to deserialize
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// The server answered with status >= 400 and a structured error body.
    ///
    /// When the body lists several errors, all of them are kept.
    #[error("{}", join_details(.errors))]
    Api {
        /// The HTTP status code
        status: StatusCode,
        /// Every error entry from the body, in server order
        errors: Vec<ApiErrorDetail>,
    },

    /// The server answered with status >= 400 and a body that is not a
    /// structured error.
    #[error("Error Code: {status}\nRaw Response: {}", String::from_utf8_lossy(.raw_response))]
    RawHttpStatus {
        /// The HTTP status code
        status: StatusCode,
        /// The unparsed response body
        raw_response: Bytes,
    },

    /// The server rejected the bearer credential, even after a refresh.
    #[error("Invalid auth token: {message}")]
    InvalidAuthToken {
        /// Message reported by the server
        message: String,
    },

    /// A credential could not be acquired or refreshed.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// An asynchronous job reached a failed terminal state.
    #[error("Job failed: {reason}")]
    JobFailed {
        /// Failure reason reported by the server
        reason: String,
    },

    /// A job did not reach a terminal state within the polling timeout.
    #[error("Job at {url} did not finish within {timeout:?}")]
    JobTimeout {
        /// The URL being polled
        url: String,
        /// The configured overall polling timeout
        timeout: Duration,
    },

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// A filtered task lookup returned no results.
    #[error("Task sequence ID {sequence_id} not found.")]
    TaskNotFound {
        /// The sequence id that was looked up
        sequence_id: u64,
    },

    /// A filtered service instance lookup returned no results.
    #[error("Service instance '{name}' not found.")]
    ServiceInstanceNotFound {
        /// The name that was looked up
        name: String,
    },

    /// Invalid configuration was provided.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Failed to serialize the request body.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

fn join_details(errors: &[ApiErrorDetail]) -> String {
    errors
        .iter()
        .map(|e| e.detail.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

impl Error {
    /// Creates a transport error from any error type.
    pub fn request(stage: TransportStage, source: impl Into<BoxError>) -> Self {
        Error::Request {
            stage,
            source: source.into(),
        }
    }

    /// Returns `true` if no response was obtained for this error.
    ///
    /// Certificate failures are transport errors too, but retrying them is
    /// pointless, so [`Error::is_retryable`] excludes them.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Request { .. } | Error::UnverifiedServer { .. } | Error::Timeout
        )
    }

    /// Returns `true` if this error is potentially transient.
    ///
    /// Only failures where no response was obtained qualify. Application
    /// errors, whatever their status, are never considered retryable because
    /// the server may already have applied the request.
    ///
    /// # Examples
    ///
    /// ```
    /// use cplane::{Error, TransportStage};
    ///
    /// let err = Error::request(TransportStage::Connect, "connection refused");
    /// assert!(err.is_retryable());
    ///
    /// let err = Error::Api {
    ///     status: http::StatusCode::INTERNAL_SERVER_ERROR,
    ///     errors: vec![],
    /// };
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Request { .. } | Error::Timeout)
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Api { status, .. } => Some(*status),
            Error::RawHttpStatus { status, .. } => Some(*status),
            Error::DeserializationFailed { status, .. } => Some(*status),
            Error::InvalidAuthToken { .. } => Some(StatusCode::UNAUTHORIZED),
            _ => None,
        }
    }

    /// Returns the raw response body if this error carries one.
    pub fn raw_response(&self) -> Option<&[u8]> {
        match self {
            Error::RawHttpStatus { raw_response, .. } => Some(raw_response),
            Error::DeserializationFailed { raw_response, .. } => Some(raw_response.as_bytes()),
            _ => None,
        }
    }

    /// Returns the structured error entries of an application error.
    pub fn api_errors(&self) -> &[ApiErrorDetail] {
        match self {
            Error::Api { errors, .. } => errors,
            _ => &[],
        }
    }
}

/// An error together with the warnings collected before and during the call
/// that failed.
#[derive(thiserror::Error, Debug)]
#[error("{error}")]
pub struct Failure {
    /// What went wrong.
    pub error: Error,
    /// Warnings from every exchange of the operation, in call order.
    pub warnings: Vec<String>,
}

impl Failure {
    /// Creates a failure carrying the given warnings.
    pub fn new(error: Error, warnings: Vec<String>) -> Self {
        Self { error, warnings }
    }

    /// Discards the warnings.
    pub fn into_error(self) -> Error {
        self.error
    }
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Self::new(error, Vec::new())
    }
}

impl From<url::ParseError> for Failure {
    fn from(error: url::ParseError) -> Self {
        Error::from(error).into()
    }
}

/// A specialized `Result` type for single exchanges.
pub type Result<T> = std::result::Result<T, Error>;

/// A `Result` whose error keeps the accumulated warnings.
pub type CallResult<T> = std::result::Result<T, Failure>;
