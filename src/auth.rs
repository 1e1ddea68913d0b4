//! Bearer authentication with single-flight credential refresh.
//!
//! [`AuthWrapper`] owns the credential for one client. Every request carries
//! the current token; a request rejected for an invalid token triggers one
//! refresh and one resend. Concurrent callers that see the same stale token
//! share a single refresh: the refresh runs under the credential lock, and a
//! caller that acquires the lock after someone else refreshed simply reuses
//! the new token.

use crate::{chain::Next, Envelope, Error, Request, Result, Wrapper};
use async_trait::async_trait;
use http::{header, HeaderValue};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// A bearer token and when it stops being valid.
#[derive(Clone)]
pub struct AccessToken {
    /// The token value, without the `Bearer` prefix.
    pub value: String,
    /// When the token expires, if known.
    pub expires_at: Option<Instant>,
}

impl AccessToken {
    /// Creates a token with no known expiry.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }

    /// Sets the expiry.
    pub fn expiring_at(mut self, expires_at: Instant) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Returns `true` if the token is known to have expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    fn header_value(&self) -> Result<HeaderValue> {
        let mut value = HeaderValue::try_from(format!("Bearer {}", self.value))
            .map_err(|e| Error::Authentication(format!("Invalid token: {}", e)))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Issues and refreshes bearer tokens.
///
/// Implementations talk to whatever token service the deployment uses; this
/// crate only calls them.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns the currently stored token.
    async fn access_token(&self) -> Result<AccessToken>;

    /// Obtains a fresh token, e.g. through a refresh-token grant.
    async fn refresh_token(&self) -> Result<AccessToken>;
}

/// Lifecycle of the held credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    /// No credential has been acquired yet.
    Empty,
    /// The credential is believed valid.
    Valid,
    /// The credential expired or was rejected and awaits a refresh.
    Expired,
    /// The credential was replaced by a refresh.
    Refreshed,
}

struct Credential {
    token: Option<AccessToken>,
    state: CredentialState,
    // Bumped on every acquisition or refresh; lets a caller tell whether the
    // token it was rejected with is still the stored one.
    generation: u64,
}

/// Wrapper that authenticates requests and refreshes rejected credentials.
pub struct AuthWrapper {
    source: Arc<dyn TokenSource>,
    credential: Mutex<Credential>,
}

impl AuthWrapper {
    /// Creates a wrapper that takes tokens from `source`.
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            credential: Mutex::new(Credential {
                token: None,
                state: CredentialState::Empty,
                generation: 0,
            }),
        }
    }

    /// The current credential state.
    pub async fn state(&self) -> CredentialState {
        self.credential.lock().await.state
    }

    /// Returns a usable token and its generation, acquiring or refreshing as
    /// needed.
    async fn current(&self) -> Result<(AccessToken, u64)> {
        let mut credential = self.credential.lock().await;
        match credential.token.clone() {
            Some(token) if !token.is_expired() => Ok((token, credential.generation)),
            Some(_) => {
                credential.state = CredentialState::Expired;
                tracing::debug!("Access token expired, refreshing");
                let token = self.source.refresh_token().await?;
                Ok(store(&mut credential, token, CredentialState::Refreshed))
            }
            None => {
                tracing::debug!("Acquiring access token");
                let token = self.source.access_token().await?;
                Ok(store(&mut credential, token, CredentialState::Valid))
            }
        }
    }

    /// Replaces a rejected token, unless a concurrent caller already did.
    async fn refresh_after_rejection(&self, rejected_generation: u64) -> Result<AccessToken> {
        let mut credential = self.credential.lock().await;
        if credential.generation != rejected_generation {
            if let Some(token) = credential.token.clone() {
                tracing::debug!("Reusing token refreshed by a concurrent request");
                return Ok(token);
            }
        }

        credential.state = CredentialState::Expired;
        tracing::info!("Access token rejected, refreshing");
        let token = self.source.refresh_token().await?;
        Ok(store(&mut credential, token, CredentialState::Refreshed).0)
    }
}

fn store(credential: &mut Credential, token: AccessToken, state: CredentialState) -> (AccessToken, u64) {
    credential.generation += 1;
    credential.token = Some(token.clone());
    credential.state = state;
    (token, credential.generation)
}

#[async_trait]
impl Wrapper for AuthWrapper {
    async fn wrap(&self, request: &Request, next: Next<'_>) -> Result<Envelope> {
        let (token, generation) = self.current().await?;
        let authorized = request.with_header_value(header::AUTHORIZATION, token.header_value()?);

        let envelope = next.run(&authorized).await?;
        if !envelope.is_auth_rejection() {
            return Ok(envelope);
        }

        let token = self.refresh_after_rejection(generation).await?;
        let authorized = request.with_header_value(header::AUTHORIZATION, token.header_value()?);

        // A second rejection is returned as-is and surfaces as InvalidAuthToken.
        next.run(&authorized).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Chain, Connection};
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const REJECTION: &str =
        r#"{"errors":[{"code":1000,"title":"CF-InvalidAuthToken","detail":"Invalid Auth Token"}]}"#;

    /// Hands out "token-N" where N counts refreshes.
    struct CountingSource {
        refreshes: AtomicUsize,
        delay: Duration,
    }

    impl CountingSource {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                refreshes: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn access_token(&self) -> Result<AccessToken> {
            Ok(AccessToken::new("token-0"))
        }

        async fn refresh_token(&self) -> Result<AccessToken> {
            tokio::time::sleep(self.delay).await;
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AccessToken::new(format!("token-{}", n)))
        }
    }

    /// Accepts only the bearer token it was told to accept.
    struct Gate {
        accepted: &'static str,
        sends: AtomicUsize,
    }

    #[async_trait]
    impl Connection for Gate {
        async fn make(&self, request: &Request) -> Result<Envelope> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            // Let concurrent callers interleave.
            tokio::task::yield_now().await;
            let authorized = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                == Some(self.accepted);
            let (status, body) = if authorized {
                (StatusCode::OK, "{}")
            } else {
                (StatusCode::UNAUTHORIZED, REJECTION)
            };
            Ok(Envelope::new(status, HeaderMap::new(), Bytes::from_static(body.as_bytes())))
        }
    }

    fn gate(accepted: &'static str) -> Arc<Gate> {
        Arc::new(Gate {
            accepted,
            sends: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_rejection_refreshes_once_and_resends() {
        let source = CountingSource::new(Duration::ZERO);
        let connection = gate("Bearer token-1");
        let auth = Arc::new(AuthWrapper::new(source.clone()));
        let chain = Chain::new(connection.clone()).wrap(auth.clone());

        let envelope = chain.send(&Request::get("/v3/apps")).await.unwrap();

        assert_eq!(envelope.status, StatusCode::OK);
        assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(connection.sends.load(Ordering::SeqCst), 2);
        assert_eq!(auth.state().await, CredentialState::Refreshed);
    }

    #[tokio::test]
    async fn test_second_rejection_is_not_retried() {
        let source = CountingSource::new(Duration::ZERO);
        let connection = gate("Bearer never");
        let chain = Chain::new(connection.clone()).wrap(Arc::new(AuthWrapper::new(source.clone())));

        let envelope = chain.send(&Request::get("/v3/apps")).await.unwrap();

        assert!(matches!(envelope.error(), Some(Error::InvalidAuthToken { .. })));
        assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(connection.sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_rejections_share_one_refresh() {
        let source = CountingSource::new(Duration::from_millis(50));
        let connection = gate("Bearer token-1");
        let chain = Chain::new(connection).wrap(Arc::new(AuthWrapper::new(source.clone())));

        let get = Request::get("/v3/apps");
        let (a, b) = tokio::join!(chain.send(&get), chain.send(&get));

        assert_eq!(a.unwrap().status, StatusCode::OK);
        assert_eq!(b.unwrap().status, StatusCode::OK);
        assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_token_refreshed_before_send() {
        struct Expiring;

        #[async_trait]
        impl TokenSource for Expiring {
            async fn access_token(&self) -> Result<AccessToken> {
                Ok(AccessToken::new("stale")
                    .expiring_at(Instant::now() + Duration::from_millis(20)))
            }

            async fn refresh_token(&self) -> Result<AccessToken> {
                Ok(AccessToken::new("fresh"))
            }
        }

        #[derive(Default)]
        struct Recorder {
            seen: std::sync::Mutex<Vec<String>>,
        }

        #[async_trait]
        impl Connection for Recorder {
            async fn make(&self, request: &Request) -> Result<Envelope> {
                let value = request
                    .headers()
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                self.seen.lock().unwrap().push(value);
                Ok(Envelope::new(StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"{}")))
            }
        }

        let connection = Arc::new(Recorder::default());
        let auth = Arc::new(AuthWrapper::new(Arc::new(Expiring)));
        let chain = Chain::new(connection.clone()).wrap(auth.clone());

        chain.send(&Request::get("/")).await.unwrap();
        assert_eq!(auth.state().await, CredentialState::Valid);

        tokio::time::sleep(Duration::from_millis(40)).await;
        chain.send(&Request::get("/")).await.unwrap();

        assert_eq!(
            *connection.seen.lock().unwrap(),
            vec!["Bearer stale", "Bearer fresh"]
        );
        assert_eq!(auth.state().await, CredentialState::Refreshed);
    }

    #[tokio::test]
    async fn test_token_source_failure_propagates() {
        struct Broken;

        #[async_trait]
        impl TokenSource for Broken {
            async fn access_token(&self) -> Result<AccessToken> {
                Err(Error::Authentication("not logged in".to_string()))
            }

            async fn refresh_token(&self) -> Result<AccessToken> {
                Err(Error::Authentication("not logged in".to_string()))
            }
        }

        let connection = gate("Bearer x");
        let chain = Chain::new(connection.clone()).wrap(Arc::new(AuthWrapper::new(Arc::new(Broken))));

        let result = chain.send(&Request::get("/")).await;
        assert!(matches!(result, Err(Error::Authentication(_))));
        assert_eq!(connection.sends.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_debug_redacts_token() {
        let token = AccessToken::new("secret-value");
        assert!(!format!("{:?}", token).contains("secret-value"));
    }
}
