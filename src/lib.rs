//! # cplane - A resilient control-plane API client
//!
//! cplane is a client layer for a cloud-platform control plane, built on top
//! of `reqwest`. Every request passes through a chain of wrappers that
//! authenticates it, retries it when that cannot repeat a side effect, and
//! optionally traces it. On top of the chain sit pagination, job polling and
//! typed resource helpers. Server warnings are collected on every path,
//! including failures.
//!
//! ## Quick Start
//!
//! ```no_run
//! use cplane::{Client, Request, RetryStrategy};
//! use serde::Deserialize;
//! use std::time::Duration;
//!
//! #[derive(Deserialize)]
//! struct Space {
//!     guid: String,
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cplane::Failure> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")?
//!         .timeout(Duration::from_secs(30))
//!         .retry_strategy(RetryStrategy::Immediate { max_retries: 2 })
//!         .user_agent("my-tool", "1.0.0")
//!         .build()?;
//!
//!     // One page
//!     let space = client.get::<Space>("/v3/spaces/some-guid").await?;
//!     println!("Space: {}", space.data.name);
//!
//!     // Every page
//!     let spaces = client
//!         .fetch_all_pages::<Space>(Request::get("/v3/spaces"))
//!         .await?;
//!     for warning in &spaces.warnings {
//!         eprintln!("warning: {}", warning);
//!     }
//!     println!("{} spaces", spaces.resources.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Application errors are decoded from the server's `{"errors": [...]}`
//! body. Bodies that cannot be parsed are preserved verbatim:
//!
//! ```no_run
//! use cplane::{Client, Error};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder().base_url("https://api.example.com")?.build()?;
//! match client.get::<serde_json::Value>("/v3/apps/missing").await {
//!     Ok(response) => println!("Success: {:?}", response.data),
//!     Err(failure) => {
//!         for warning in &failure.warnings {
//!             eprintln!("warning: {}", warning);
//!         }
//!         match failure.error {
//!             Error::Api { status, errors } => {
//!                 for e in errors {
//!                     eprintln!("{} {} ({}): {}", status, e.title, e.code, e.detail);
//!                 }
//!             }
//!             Error::RawHttpStatus { status, raw_response } => {
//!                 eprintln!("HTTP {}: {}", status, String::from_utf8_lossy(&raw_response));
//!             }
//!             e => eprintln!("Other error: {}", e),
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Retries
//!
//! By default a failed request is retried twice, immediately, and only when
//! resending is safe. Both the strategy and the predicate can be replaced:
//!
//! ```no_run
//! use cplane::{Client, RetryStrategy, retry::{OrPredicate, RetryOnConnectionError, RetryOnSafeFailure}};
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), cplane::Error> {
//! let client = Client::builder()
//!     .base_url("https://api.example.com")?
//!     .retry_strategy(RetryStrategy::ExponentialBackoff {
//!         initial_delay: Duration::from_millis(100),
//!         max_delay: Duration::from_secs(10),
//!         max_retries: 4,
//!         jitter: true,
//!     })
//!     .retry_predicate(Box::new(OrPredicate::new(vec![
//!         Box::new(RetryOnSafeFailure),
//!         Box::new(RetryOnConnectionError),
//!     ])))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod auth;
pub mod chain;
mod client;
pub mod connection;
mod envelope;
mod error;
pub mod job;
pub mod logging;
pub mod network_policy;
pub mod pagination;
mod request;
pub mod resources;
mod response;
pub mod retry;

pub use auth::{AccessToken, AuthWrapper, TokenSource};
pub use chain::{Chain, Next, Wrapper};
pub use client::{user_agent, Client, ClientBuilder};
pub use connection::{Connection, ConnectionConfig, HttpConnection};
pub use envelope::{warnings_from_headers, Envelope, WARNINGS_HEADER};
pub use error::{ApiErrorDetail, CallResult, Error, Failure, Result, TransportStage};
pub use job::{Job, JobHandle, JobPoll, JobResource, JobState, PollSettings};
pub use logging::RequestLogger;
pub use network_policy::{Policy, PolicyClient};
pub use pagination::{Page, Paginated};
pub use request::{Request, Target};
pub use resources::SortOrder;
pub use response::Response;
pub use retry::{RetryPredicate, RetryStrategy, RetryWrapper};
