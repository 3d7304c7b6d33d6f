use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::AuthError;

/// Credentials within this window of expiry are renewed eagerly rather than
/// raced against the server clock.
const RENEWAL_LEEWAY_SECS: i64 = 30;

#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now + TimeDelta::seconds(RENEWAL_LEEWAY_SECS)
    }
}

/// External auth/session collaborator. Called for the initial credential and
/// again for every renewal.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn issue(&self) -> Result<Credential, AuthError>;
}

/// Caches the session credential and deduplicates renewal: the cache lock is
/// held across the `issue` call, so concurrent callers that discover an
/// expired credential all await the one renewal instead of issuing their own.
pub struct SessionAuth {
    provider: Arc<dyn CredentialProvider>,
    cached: Mutex<Option<Credential>>,
}

impl SessionAuth {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            cached: Mutex::new(None),
        }
    }

    pub async fn bearer(&self) -> Result<Credential, AuthError> {
        let mut guard = self.cached.lock().await;
        if let Some(credential) = guard.as_ref() {
            if credential.is_fresh(Utc::now()) {
                return Ok(credential.clone());
            }
        }

        info!("auth: renewing session credential");
        let fresh = self.provider.issue().await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drops the cached credential so the next caller renews. Used after a
    /// 401-equivalent rejection.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CountingProvider {
        issued: AtomicU32,
    }

    #[async_trait]
    impl CredentialProvider for CountingProvider {
        async fn issue(&self) -> Result<Credential, AuthError> {
            self.issued.fetch_add(1, Ordering::SeqCst);
            // Slow renewal widens the race window for concurrent callers.
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Credential {
                token: "token".to_string(),
                expires_at: Utc::now() + TimeDelta::hours(1),
            })
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_callers_share_a_single_renewal() {
        let provider = Arc::new(CountingProvider {
            issued: AtomicU32::new(0),
        });
        let auth = Arc::new(SessionAuth::new(provider.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let auth = Arc::clone(&auth);
            handles.push(tokio::spawn(async move { auth.bearer().await }));
        }
        for handle in handles {
            handle.await.expect("join").expect("bearer");
        }

        assert_eq!(provider.issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_a_renewal() {
        let provider = Arc::new(CountingProvider {
            issued: AtomicU32::new(0),
        });
        let auth = SessionAuth::new(provider.clone());

        auth.bearer().await.expect("first");
        auth.bearer().await.expect("cached");
        assert_eq!(provider.issued.load(Ordering::SeqCst), 1);

        auth.invalidate().await;
        auth.bearer().await.expect("renewed");
        assert_eq!(provider.issued.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn near_expiry_credentials_are_renewed_eagerly() {
        struct ShortLived;

        #[async_trait]
        impl CredentialProvider for ShortLived {
            async fn issue(&self) -> Result<Credential, AuthError> {
                Ok(Credential {
                    token: "short".to_string(),
                    expires_at: Utc::now() + TimeDelta::seconds(5),
                })
            }
        }

        let auth = SessionAuth::new(Arc::new(ShortLived));
        // Each call sees a credential inside the leeway window and renews.
        let first = auth.bearer().await.expect("first");
        let second = auth.bearer().await.expect("second");
        assert_eq!(first.token, second.token);
    }
}
