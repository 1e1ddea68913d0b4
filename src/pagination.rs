//! Following `pagination.next.href` links across a collection.

use crate::{error::Failure, CallResult, Chain, Error, Request};
use serde::{de::DeserializeOwned, Deserialize};
use url::Url;

/// One page of a paginated collection.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    /// Link to the next page.
    #[serde(default)]
    pub pagination: Pagination,
    /// The resources on this page.
    pub resources: Vec<T>,
}

/// The `pagination` object of a page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pagination {
    /// Total number of resources, when the server reports it.
    #[serde(default)]
    pub total_results: Option<u64>,
    /// The next page, `null` on the last page.
    #[serde(default)]
    pub next: Option<Link>,
}

/// A hypermedia link.
#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    /// Absolute URL of the linked resource.
    pub href: String,
}

impl<T> Page<T> {
    /// The URL of the next page, if any.
    pub fn next_url(&self) -> Option<&str> {
        self.pagination.next.as_ref().map(|link| link.href.as_str())
    }
}

/// Every resource of a collection and every warning collected on the way.
#[derive(Debug, Clone)]
pub struct Paginated<T> {
    /// Resources in page order.
    pub resources: Vec<T>,
    /// Warnings in call order.
    pub warnings: Vec<String>,
    /// Number of pages fetched.
    pub pages: usize,
}

/// Fetches the first page and follows next links until there are none.
///
/// Follow-up requests reuse the first request's method and headers, without
/// a body. Any failing page aborts the whole operation: no resources are
/// returned, only the warnings gathered up to and including the failure.
pub(crate) async fn fetch_all_pages<T: DeserializeOwned>(
    chain: &Chain,
    first: Request,
) -> CallResult<Paginated<T>> {
    let mut resources = Vec::new();
    let mut warnings = Vec::new();
    let mut pages = 0;
    let mut request = first;

    loop {
        let envelope = match chain.send(&request).await {
            Ok(envelope) => envelope,
            Err(error) => return Err(Failure::new(error, warnings)),
        };
        warnings.extend(envelope.warnings.iter().cloned());

        let page: Page<T> = match envelope.decode() {
            Ok(page) => page,
            Err(error) => return Err(Failure::new(error, warnings)),
        };
        pages += 1;

        let next = match page.next_url().map(Url::parse).transpose() {
            Ok(next) => next,
            Err(e) => return Err(Failure::new(Error::from(e), warnings)),
        };
        resources.extend(page.resources);

        match next {
            Some(url) => {
                tracing::debug!(page = pages, next = %url, "Following pagination link");
                request = request.follow(url);
            }
            None => {
                return Ok(Paginated {
                    resources,
                    warnings,
                    pages,
                })
            }
        }
    }
}
