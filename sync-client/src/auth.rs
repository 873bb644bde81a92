//! Access token refresh with a cached fallback.

use crate::backend::{Backend, BackendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_core::Backoff;
use sync_types::AuthToken;

/// Refreshes access tokens and remembers the last good one.
pub struct TokenManager<B> {
    backend: Arc<B>,
    cached: Mutex<Option<AuthToken>>,
    attempts: u32,
    backoff: Backoff,
}

impl<B: Backend> TokenManager<B> {
    /// Create a manager making up to `attempts` refresh calls per refresh.
    pub fn new(backend: Arc<B>, attempts: u32, backoff: Backoff) -> Self {
        Self {
            backend,
            cached: Mutex::new(None),
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Last token obtained, if any.
    pub fn cached(&self) -> Option<AuthToken> {
        self.slot().clone()
    }

    /// Refresh the token, retrying with backoff.
    pub async fn refresh(&self) -> Result<AuthToken, BackendError> {
        let mut attempt = 1;
        loop {
            match self.backend.refresh_token().await {
                Ok(token) => {
                    tracing::debug!("Token refreshed ({})", token.id);
                    *self.slot() = Some(token.clone());
                    return Ok(token);
                }
                Err(e) if attempt < self.attempts && !e.is_permanent() => {
                    let delay = self.backoff.delay(attempt);
                    tracing::debug!(
                        "Token refresh attempt {} failed: {}, retrying in {:?}",
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Refresh the token, falling back to the cached one on failure.
    pub async fn refresh_or_cached(&self) -> Option<AuthToken> {
        match self.refresh().await {
            Ok(token) => Some(token),
            Err(e) => {
                let cached = self.cached();
                tracing::warn!(
                    "Token refresh failed ({}), {}",
                    e,
                    if cached.is_some() {
                        "using cached token"
                    } else {
                        "no cached token"
                    }
                );
                cached
            }
        }
    }

    /// Refresh (or fall back) and hand the token to the backend.
    ///
    /// Returns `false` when there was no token to apply.
    pub async fn refresh_and_apply(&self) -> Result<bool, BackendError> {
        match self.refresh_or_cached().await {
            Some(token) => {
                self.backend.set_token(&token).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Hand the cached token to the backend without refreshing.
    pub async fn apply_cached(&self) -> Result<bool, BackendError> {
        match self.cached() {
            Some(token) => {
                self.backend.set_token(&token).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<AuthToken>> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
