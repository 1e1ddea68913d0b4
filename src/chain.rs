//! Composition of request wrappers around a transport connection.
//!
//! A [`Chain`] is a fixed sequence of [`Wrapper`]s ending in a
//! [`Connection`]. Each wrapper receives the request and a [`Next`] handle to
//! the rest of the chain. A wrapper that retries calls [`Next::run`] again and
//! re-enters the chain from its own position downward.
//!
//! ```
//! use async_trait::async_trait;
//! use cplane::{Chain, Connection, Envelope, Next, Request, Result, Wrapper};
//! use http::{HeaderMap, StatusCode};
//! use std::sync::Arc;
//!
//! struct Canned;
//!
//! #[async_trait]
//! impl Connection for Canned {
//!     async fn make(&self, _request: &Request) -> Result<Envelope> {
//!         Ok(Envelope::new(StatusCode::OK, HeaderMap::new(), "{}".into()))
//!     }
//! }
//!
//! struct Tag;
//!
//! #[async_trait]
//! impl Wrapper for Tag {
//!     async fn wrap(&self, request: &Request, next: Next<'_>) -> Result<Envelope> {
//!         let mut envelope = next.run(request).await?;
//!         envelope.warnings.push("tagged".to_string());
//!         Ok(envelope)
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let chain = Chain::new(Arc::new(Canned)).wrap(Arc::new(Tag));
//! let envelope = chain.send(&Request::get("/")).await.unwrap();
//! assert_eq!(envelope.warnings, vec!["tagged"]);
//! # }
//! ```

use crate::{Connection, Envelope, Request, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// A request/response interceptor.
///
/// Implementations may inspect or replace the outgoing request, inspect the
/// envelope coming back, and decide to send again.
#[async_trait]
pub trait Wrapper: Send + Sync {
    /// Handles `request`, delegating to the rest of the chain through `next`.
    async fn wrap(&self, request: &Request, next: Next<'_>) -> Result<Envelope>;
}

/// The remainder of a chain below the current wrapper.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    wrappers: &'a [Arc<dyn Wrapper>],
    connection: &'a dyn Connection,
}

impl<'a> Next<'a> {
    /// Sends `request` through the remaining wrappers and the connection.
    pub async fn run(self, request: &Request) -> Result<Envelope> {
        match self.wrappers.split_first() {
            Some((wrapper, rest)) => {
                let next = Next {
                    wrappers: rest,
                    connection: self.connection,
                };
                wrapper.wrap(request, next).await
            }
            None => self.connection.make(request).await,
        }
    }
}

/// An ordered set of wrappers around a connection.
#[derive(Clone)]
pub struct Chain {
    // Outermost first.
    wrappers: Vec<Arc<dyn Wrapper>>,
    connection: Arc<dyn Connection>,
}

impl Chain {
    /// Creates a chain with no wrappers.
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            wrappers: Vec::new(),
            connection,
        }
    }

    /// Makes `wrapper` the new outermost layer.
    pub fn wrap(mut self, wrapper: Arc<dyn Wrapper>) -> Self {
        self.wrappers.insert(0, wrapper);
        self
    }

    /// Number of wrappers in the chain.
    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    /// Returns `true` if the chain has no wrappers.
    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }

    /// Sends `request` through every wrapper, outermost first.
    pub async fn send(&self, request: &Request) -> Result<Envelope> {
        Next {
            wrappers: &self.wrappers,
            connection: self.connection.as_ref(),
        }
        .run(request)
        .await
    }
}
