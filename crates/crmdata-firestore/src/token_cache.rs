//! Access-token caching for Firestore authentication.
//!
//! Tokens from a service account are cached with a refresh margin; refresh is
//! single-flight behind a write lock, and a failed refresh falls back to the
//! current token while it is still usable. Emulator mode uses a fixed token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use gcp_auth::TokenProvider;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{FirestoreError, FirestoreResult};

/// Refresh this long before the token expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// TTL assumed when the provider's expiry cannot be converted.
const TOKEN_FALLBACK_TTL: Duration = Duration::from_secs(50 * 60);

/// OAuth scope for Firestore/Datastore access.
pub const FIRESTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

/// Token accepted by the Firestore emulator.
pub const EMULATOR_TOKEN: &str = "owner";

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + TOKEN_REFRESH_MARGIN < self.expires_at
    }

    fn is_usable(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

enum TokenSource {
    Provider(Arc<dyn TokenProvider>),
    Fixed(String),
}

/// Shared token cache.
pub struct TokenCache {
    source: TokenSource,
    cache: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    /// Cache tokens minted by a service-account provider.
    pub fn new(auth: Arc<dyn TokenProvider>) -> Self {
        Self {
            source: TokenSource::Provider(auth),
            cache: RwLock::new(None),
        }
    }

    /// Always hand out `token` (emulator and tests).
    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            source: TokenSource::Fixed(token.into()),
            cache: RwLock::new(None),
        }
    }

    /// Drop the cached token so the next call refreshes.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Get a valid access token, refreshing if necessary.
    pub async fn get_token(&self) -> FirestoreResult<String> {
        let auth = match &self.source {
            TokenSource::Fixed(token) => return Ok(token.clone()),
            TokenSource::Provider(auth) => auth,
        };

        if let Some(cached) = self.cache.read().await.as_ref() {
            if cached.is_fresh() {
                return Ok(cached.access_token.clone());
            }
        }

        let mut cache = self.cache.write().await;

        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = cache.as_ref() {
            if cached.is_fresh() {
                return Ok(cached.access_token.clone());
            }
        }

        match auth.token(&[FIRESTORE_SCOPE]).await {
            Ok(token) => {
                let now = Utc::now();
                let expires = token.expires_at();
                let expires_at = if expires > now {
                    Instant::now() + (expires - now).to_std().unwrap_or(TOKEN_FALLBACK_TTL)
                } else {
                    Instant::now()
                };

                let access_token = token.as_str().to_string();
                *cache = Some(CachedToken {
                    access_token: access_token.clone(),
                    expires_at,
                });

                debug!("Refreshed Firestore access token");
                Ok(access_token)
            }
            Err(e) => match cache.as_ref() {
                Some(cached) if cached.is_usable() => {
                    warn!(error = %e, "Token refresh failed, using existing token");
                    Ok(cached.access_token.clone())
                }
                _ => Err(FirestoreError::auth_error(format!(
                    "Failed to obtain auth token: {}",
                    e
                ))),
            },
        }
    }
}
