//! The raw result of one HTTP exchange and its decoding rules.

use crate::{error::ApiErrorDetail, Error, Response, Result};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use std::time::Duration;

/// Response header carrying non-fatal warnings, one per occurrence.
pub const WARNINGS_HEADER: &str = "x-cf-warnings";

/// Error code the control plane uses for an invalid or expired token.
const INVALID_AUTH_TOKEN_CODE: i64 = 1000;
const INVALID_AUTH_TOKEN_TITLE: &str = "CF-InvalidAuthToken";

/// The undecoded result of one HTTP exchange.
///
/// Status codes >= 400 are not errors at this level: they arrive as an
/// envelope and are classified by [`Envelope::error`] when the caller decodes.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The HTTP status code.
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// The raw response body, retained for diagnostics.
    pub body: Bytes,
    /// Warnings from the warnings header, in the order the server sent them.
    pub warnings: Vec<String>,
    /// Time spent on this exchange.
    pub latency: Duration,
    /// Number of attempts it took to obtain this envelope.
    pub attempts: usize,
}

#[derive(Deserialize)]
struct ErrorBody {
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: String,
}

impl Envelope {
    /// Builds an envelope from raw response parts, reading the warnings header.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let warnings = warnings_from_headers(&headers);
        Self {
            status,
            headers,
            body,
            warnings,
            latency: Duration::ZERO,
            attempts: 1,
        }
    }

    /// Returns `true` for 2xx and 3xx statuses.
    pub fn is_success(&self) -> bool {
        self.status.as_u16() < 400
    }

    /// Returns a reference to a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    fn structured_errors(&self) -> Option<Vec<ApiErrorDetail>> {
        serde_json::from_slice::<ErrorBody>(&self.body)
            .ok()
            .map(|b| b.errors)
            .filter(|errors| !errors.is_empty())
    }

    /// Returns `true` if the server rejected the request's credential.
    ///
    /// Only a 401 whose body names an invalid token counts; other 401s and
    /// 403s are ordinary application errors.
    pub fn is_auth_rejection(&self) -> bool {
        self.auth_rejection_message().is_some()
    }

    fn auth_rejection_message(&self) -> Option<String> {
        if self.status != StatusCode::UNAUTHORIZED {
            return None;
        }
        if let Some(errors) = self.structured_errors() {
            return errors
                .into_iter()
                .find(|e| e.code == INVALID_AUTH_TOKEN_CODE || e.title == INVALID_AUTH_TOKEN_TITLE)
                .map(|e| e.detail);
        }
        serde_json::from_slice::<OAuthErrorBody>(&self.body)
            .ok()
            .filter(|b| b.error == "invalid_token")
            .map(|b| b.error_description)
    }

    /// Classifies a status >= 400 into an error. Returns `None` for success.
    pub fn error(&self) -> Option<Error> {
        if self.is_success() {
            return None;
        }
        if let Some(message) = self.auth_rejection_message() {
            return Some(Error::InvalidAuthToken { message });
        }
        Some(match self.structured_errors() {
            Some(errors) => Error::Api {
                status: self.status,
                errors,
            },
            None => Error::RawHttpStatus {
                status: self.status,
                raw_response: self.body.clone(),
            },
        })
    }

    /// Decodes the body into `T`, or returns the classified error.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        if let Some(error) = self.error() {
            return Err(error);
        }
        serde_json::from_slice(&self.body).map_err(|e| self.deserialization_failed(e))
    }

    /// Like [`Envelope::decode`], but an empty body decodes to `None`.
    pub fn decode_optional<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if let Some(error) = self.error() {
            return Err(error);
        }
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&self.body)
            .map(Some)
            .map_err(|e| self.deserialization_failed(e))
    }

    fn deserialization_failed(&self, e: serde_json::Error) -> Error {
        let raw_response = String::from_utf8_lossy(&self.body).into_owned();
        tracing::error!(
            error = %e,
            raw_response = %raw_response,
            "Failed to deserialize response"
        );
        Error::DeserializationFailed {
            raw_response,
            serde_error: e.to_string(),
            status: self.status,
        }
    }

    /// Wraps already decoded data together with this envelope's metadata.
    pub fn into_response<T>(self, data: T) -> Response<T> {
        Response {
            data,
            warnings: self.warnings,
            raw_body: self.body,
            status: self.status,
            headers: self.headers,
            latency: self.latency,
            attempts: self.attempts,
        }
    }
}

/// Reads every occurrence of the warnings header, one warning per value.
pub fn warnings_from_headers(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(WARNINGS_HEADER)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
        .collect()
}
