//! Private key caching
//!
//! Local users' private keys are looked up on first use and kept for the
//! process lifetime. Entries are written once; only an explicit
//! [`PrivateKeyCache::invalidate`] drops one.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::AppError;
use crate::metrics::CACHE_LOOKUPS_TOTAL;
use crate::store::UserStore;

/// Per-user private key cache over a [`UserStore`]
pub struct PrivateKeyCache {
    /// Cache storage: user name -> PEM
    cache: RwLock<HashMap<String, Arc<str>>>,
    users: Arc<dyn UserStore>,
}

impl PrivateKeyCache {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            users,
        }
    }

    /// Private key PEM for a local user
    ///
    /// # Errors
    /// `AppError::LocalLookup` when the store has no key for `user`.
    pub async fn get_or_fetch(&self, user: &str) -> Result<Arc<str>, AppError> {
        if let Some(pem) = self.get(user).await {
            return Ok(pem);
        }

        let pem: Arc<str> = self
            .users
            .get_private_key_for_user(user)
            .await?
            .ok_or_else(|| AppError::LocalLookup(format!("No private key for user {}", user)))?
            .into();

        let mut cache = self.cache.write().await;
        // A concurrent fetch may have won; keep the first value.
        let stored = cache.entry(user.to_string()).or_insert(pem).clone();
        Ok(stored)
    }

    /// Cached key only
    pub async fn get(&self, user: &str) -> Option<Arc<str>> {
        let cache = self.cache.read().await;
        let hit = cache.get(user).cloned();
        let result = if hit.is_some() { "hit" } else { "miss" };
        CACHE_LOOKUPS_TOTAL
            .with_label_values(&["private_key", result])
            .inc();
        hit
    }

    /// Forget a user's key so the next use re-reads the store (key rotation).
    pub async fn invalidate(&self, user: &str) {
        self.cache.write().await.remove(user);
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockUserStore;

    #[tokio::test]
    async fn store_is_consulted_once_per_user() {
        let mut users = MockUserStore::new();
        users
            .expect_get_private_key_for_user()
            .withf(|user| user == "alice")
            .times(1)
            .returning(|_| Ok(Some("alice-pem".to_string())));

        let cache = PrivateKeyCache::new(Arc::new(users));

        assert_eq!(&*cache.get_or_fetch("alice").await.unwrap(), "alice-pem");
        assert_eq!(&*cache.get_or_fetch("alice").await.unwrap(), "alice-pem");
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_user_is_local_lookup_failure_and_not_cached() {
        let mut users = MockUserStore::new();
        users
            .expect_get_private_key_for_user()
            .times(2)
            .returning(|_| Ok(None));

        let cache = PrivateKeyCache::new(Arc::new(users));

        for _ in 0..2 {
            assert!(matches!(
                cache.get_or_fetch("carol").await,
                Err(AppError::LocalLookup(_))
            ));
        }
        assert!(cache.get("carol").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_read() {
        let mut users = MockUserStore::new();
        let mut reads = 0;
        users
            .expect_get_private_key_for_user()
            .times(2)
            .returning(move |_| {
                reads += 1;
                Ok(Some(format!("pem-{reads}")))
            });

        let cache = PrivateKeyCache::new(Arc::new(users));

        assert_eq!(&*cache.get_or_fetch("alice").await.unwrap(), "pem-1");
        cache.invalidate("alice").await;
        assert_eq!(&*cache.get_or_fetch("alice").await.unwrap(), "pem-2");
    }
}
