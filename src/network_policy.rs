//! Client for the container networking policy API.
//!
//! Policies are applied in batches: one POST of `{"policies": [...]}` to
//! `/policies`. The server accepts or rejects the batch as a whole.
//!
//! ```no_run
//! use cplane::network_policy::{Policy, PolicyClient};
//!
//! # async fn example() -> Result<(), cplane::Failure> {
//! let client = PolicyClient::builder()
//!     .base_url("https://api.example.com/networking/v0/external")?
//!     .build()?;
//!
//! client.add_policy("frontend-guid", "backend-guid", "tcp", 8080).await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    auth::TokenSource, client::ClientBuilder, CallResult, Client, Connection, Request, Response,
    Result, RetryStrategy,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// One allow rule from a source application to a destination application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Where the traffic comes from.
    pub source: Source,
    /// Where the traffic is allowed to go.
    pub destination: Destination,
}

/// Traffic origin.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Source {
    /// Application GUID.
    pub id: String,
    /// Policy tag assigned by the server; omitted when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
}

/// Traffic destination.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Destination {
    /// Application GUID.
    pub id: String,
    /// Policy tag assigned by the server; omitted when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    /// `tcp` or `udp`.
    pub protocol: String,
    /// Single port; superseded by `ports` on newer servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Port range; omitted when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Ports>,
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ports {
    /// First allowed port.
    pub start: u16,
    /// Last allowed port.
    pub end: u16,
}

impl Policy {
    /// A policy allowing `protocol` traffic on a single port.
    pub fn allow(source_guid: &str, destination_guid: &str, protocol: &str, port: u16) -> Self {
        Self {
            source: Source {
                id: source_guid.to_string(),
                ..Default::default()
            },
            destination: Destination {
                id: destination_guid.to_string(),
                protocol: protocol.to_string(),
                port: Some(port),
                ports: Some(Ports {
                    start: port,
                    end: port,
                }),
                ..Default::default()
            },
        }
    }
}

#[derive(Serialize)]
struct PolicyBatch<'a> {
    policies: &'a [Policy],
}

/// Client for the networking policy API.
///
/// It owns its own chain, separate from any control-plane [`Client`], so its
/// credential is never shared with another client by accident.
#[derive(Clone)]
pub struct PolicyClient {
    client: Client,
}

impl PolicyClient {
    /// Creates a new `PolicyClientBuilder`.
    pub fn builder() -> PolicyClientBuilder {
        PolicyClientBuilder::new()
    }

    /// Wraps an already configured client whose base URL points at the
    /// networking API.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Applies all policies in one request. Success carries no body.
    pub async fn add_policies(&self, policies: &[Policy]) -> CallResult<Response<()>> {
        let request = Request::post("/policies").with_json(&PolicyBatch { policies })?;
        tracing::debug!(count = policies.len(), "Adding network policies");
        self.client.execute(request).await
    }

    /// Allows `protocol` traffic on `port` from one application to another.
    pub async fn add_policy(
        &self,
        source_guid: &str,
        destination_guid: &str,
        protocol: &str,
        port: u16,
    ) -> CallResult<Response<()>> {
        self.add_policies(&[Policy::allow(source_guid, destination_guid, protocol, port)])
            .await
    }
}

/// Builder for a [`PolicyClient`].
///
/// Accepts the subset of [`ClientBuilder`] settings that apply to the
/// networking API.
pub struct PolicyClientBuilder {
    inner: ClientBuilder,
}

impl PolicyClientBuilder {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self {
            inner: ClientBuilder::new(),
        }
    }

    /// Sets the networking API URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.inner = self.inner.base_url(url)?;
        Ok(self)
    }

    /// Sets the `User-Agent` from an application name and version.
    pub fn user_agent(mut self, app_name: &str, app_version: &str) -> Self {
        self.inner = self.inner.user_agent(app_name, app_version);
        self
    }

    /// Sets the connect timeout.
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.inner = self.inner.dial_timeout(timeout);
        self
    }

    /// Accept any server certificate.
    pub fn skip_ssl_validation(mut self, skip: bool) -> Self {
        self.inner = self.inner.skip_ssl_validation(skip);
        self
    }

    /// Sets the retry strategy.
    pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.inner = self.inner.retry_strategy(strategy);
        self
    }

    /// Authenticates every request with tokens from `source`.
    pub fn token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.inner = self.inner.token_source(source);
        self
    }

    /// Enables tracing of every request and response.
    pub fn request_logging(mut self, enabled: bool) -> Self {
        self.inner = self.inner.request_logging(enabled);
        self
    }

    /// Replaces the HTTP transport.
    pub fn connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.inner = self.inner.connection(connection);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns an error if no base URL was provided.
    pub fn build(self) -> Result<PolicyClient> {
        Ok(PolicyClient::from_client(self.inner.build()?))
    }
}

impl Default for PolicyClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
