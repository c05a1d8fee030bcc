//! Collaborator stores
//!
//! The federation core never owns users, relationships or posts. It reaches
//! them through these traits; the in-memory implementations back the binary
//! and the test suite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::error::{AppError, Result};

/// Local user key lookup
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn user_exists(&self, user: &str) -> Result<bool>;

    /// PKCS#8 (or PKCS#1) PEM private key, `None` for unknown users
    async fn get_private_key_for_user(&self, user: &str) -> Result<Option<String>>;

    /// SPKI PEM public key, `None` for unknown users
    async fn get_public_key_for_user(&self, user: &str) -> Result<Option<String>>;
}

/// A follow relationship between two users.
///
/// `follower`/`followed` are user names: `name` for local users and
/// `name@host` for remote ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowRelationship {
    /// Store-assigned paging cursor, increasing with insertion order
    pub seq: u64,
    pub follower: String,
    pub followed: String,
    pub follower_actor_url: String,
    pub followed_actor_url: String,
    /// Human-facing profile of the remote side
    pub profile_url: String,
}

/// Relationship to create; the store assigns `seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRelationship {
    pub follower: String,
    pub followed: String,
    pub follower_actor_url: String,
    pub followed_actor_url: String,
    pub profile_url: String,
}

/// Follow relationship store
///
/// Paging methods return relationships with `seq > min_id` (all when
/// `min_id` is `None`) in ascending `seq` order.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FriendStore: Send + Sync {
    async fn find(&self, follower: &str, followed: &str) -> Result<Option<FollowRelationship>>;

    /// Returns the stored relationship and whether it was created now.
    async fn find_or_create(&self, relationship: NewRelationship)
    -> Result<(FollowRelationship, bool)>;

    /// Returns whether a relationship was removed.
    async fn delete(&self, follower: &str, followed: &str) -> Result<bool>;

    /// Relationships where `user` is followed
    async fn followers_of(
        &self,
        user: &str,
        min_id: Option<u64>,
        limit: usize,
    ) -> Result<Vec<FollowRelationship>>;

    /// Relationships where `user` is the follower
    async fn following_of(
        &self,
        user: &str,
        min_id: Option<u64>,
        limit: usize,
    ) -> Result<Vec<FollowRelationship>>;

    async fn count_followers(&self, user: &str) -> Result<u64>;

    async fn count_following(&self, user: &str) -> Result<u64>;
}

/// A local user's own outbound post
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPost {
    /// Store-assigned paging cursor
    pub seq: u64,
    pub author: String,
    /// Canonical URL of the post
    pub url: String,
    pub content: String,
    pub published: DateTime<Utc>,
    pub in_reply_to: Option<String>,
    /// Actor URLs of explicitly addressed recipients
    pub recipients: Vec<String>,
    pub is_private: bool,
    pub attachments: Vec<Value>,
}

/// Enumeration of local users' published posts
///
/// Only public posts are listed; private posts never appear in an outbox.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn count_posts(&self, user: &str) -> Result<u64>;

    async fn posts_of(&self, user: &str, min_id: Option<u64>, limit: usize)
    -> Result<Vec<LocalPost>>;
}

#[derive(Debug, Clone)]
struct UserKeys {
    private_key_pem: String,
    public_key_pem: String,
}

/// In-memory [`UserStore`]
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<String, UserKeys>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with a fresh RSA key pair for every name.
    pub async fn generate(names: &[String], bits: usize) -> Result<Self> {
        let store = Self::new();
        for name in names {
            let (private_key_pem, public_key_pem) = generate_key_pair(bits)?;
            store.insert(name, private_key_pem, public_key_pem).await;
            tracing::info!(user = %name, bits, "Generated key pair for local user");
        }
        Ok(store)
    }

    pub async fn insert(
        &self,
        name: &str,
        private_key_pem: impl Into<String>,
        public_key_pem: impl Into<String>,
    ) {
        let mut users = self.users.write().await;
        users.insert(
            name.to_string(),
            UserKeys {
                private_key_pem: private_key_pem.into(),
                public_key_pem: public_key_pem.into(),
            },
        );
    }

    pub async fn user_names(&self) -> Vec<String> {
        let users = self.users.read().await;
        let mut names: Vec<String> = users.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Generate an RSA key pair as (PKCS#8 private PEM, SPKI public PEM).
pub fn generate_key_pair(bits: usize) -> Result<(String, String)> {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits).map_err(|e| AppError::Internal(e.into()))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?;

    Ok((private_key_pem, public_key_pem))
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn user_exists(&self, user: &str) -> Result<bool> {
        Ok(self.users.read().await.contains_key(user))
    }

    async fn get_private_key_for_user(&self, user: &str) -> Result<Option<String>> {
        let users = self.users.read().await;
        Ok(users.get(user).map(|keys| keys.private_key_pem.clone()))
    }

    async fn get_public_key_for_user(&self, user: &str) -> Result<Option<String>> {
        let users = self.users.read().await;
        Ok(users.get(user).map(|keys| keys.public_key_pem.clone()))
    }
}

/// In-memory [`FriendStore`]
///
/// A single mutex serializes every operation, so find-or-create and delete
/// are atomic per call.
#[derive(Default)]
pub struct MemoryFriendStore {
    relationships: Mutex<Vec<FollowRelationship>>,
    next_seq: AtomicU64,
}

impl MemoryFriendStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn page(
        relationships: &[FollowRelationship],
        matches: impl Fn(&FollowRelationship) -> bool,
        min_id: Option<u64>,
        limit: usize,
    ) -> Vec<FollowRelationship> {
        let floor = min_id.unwrap_or(0);
        let mut page: Vec<FollowRelationship> = relationships
            .iter()
            .filter(|r| matches(r) && r.seq > floor)
            .cloned()
            .collect();
        page.sort_by_key(|r| r.seq);
        page.truncate(limit);
        page
    }
}

#[async_trait]
impl FriendStore for MemoryFriendStore {
    async fn find(&self, follower: &str, followed: &str) -> Result<Option<FollowRelationship>> {
        let relationships = self.relationships.lock().await;
        Ok(relationships
            .iter()
            .find(|r| r.follower == follower && r.followed == followed)
            .cloned())
    }

    async fn find_or_create(
        &self,
        relationship: NewRelationship,
    ) -> Result<(FollowRelationship, bool)> {
        let mut relationships = self.relationships.lock().await;
        if let Some(existing) = relationships
            .iter()
            .find(|r| r.follower == relationship.follower && r.followed == relationship.followed)
        {
            return Ok((existing.clone(), false));
        }

        let created = FollowRelationship {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst) + 1,
            follower: relationship.follower,
            followed: relationship.followed,
            follower_actor_url: relationship.follower_actor_url,
            followed_actor_url: relationship.followed_actor_url,
            profile_url: relationship.profile_url,
        };
        relationships.push(created.clone());
        Ok((created, true))
    }

    async fn delete(&self, follower: &str, followed: &str) -> Result<bool> {
        let mut relationships = self.relationships.lock().await;
        let before = relationships.len();
        relationships.retain(|r| !(r.follower == follower && r.followed == followed));
        Ok(relationships.len() != before)
    }

    async fn followers_of(
        &self,
        user: &str,
        min_id: Option<u64>,
        limit: usize,
    ) -> Result<Vec<FollowRelationship>> {
        let relationships = self.relationships.lock().await;
        Ok(Self::page(&relationships, |r| r.followed == user, min_id, limit))
    }

    async fn following_of(
        &self,
        user: &str,
        min_id: Option<u64>,
        limit: usize,
    ) -> Result<Vec<FollowRelationship>> {
        let relationships = self.relationships.lock().await;
        Ok(Self::page(&relationships, |r| r.follower == user, min_id, limit))
    }

    async fn count_followers(&self, user: &str) -> Result<u64> {
        let relationships = self.relationships.lock().await;
        Ok(relationships.iter().filter(|r| r.followed == user).count() as u64)
    }

    async fn count_following(&self, user: &str) -> Result<u64> {
        let relationships = self.relationships.lock().await;
        Ok(relationships.iter().filter(|r| r.follower == user).count() as u64)
    }
}

/// Post to add to a [`MemoryPostStore`]; the store assigns `seq`.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub author: String,
    pub url: String,
    pub content: String,
    pub in_reply_to: Option<String>,
    pub recipients: Vec<String>,
    pub is_private: bool,
}

/// In-memory [`PostStore`]
#[derive(Default)]
pub struct MemoryPostStore {
    posts: RwLock<Vec<LocalPost>>,
    next_seq: AtomicU64,
}

impl MemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, post: NewPost) -> LocalPost {
        let stored = LocalPost {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst) + 1,
            author: post.author,
            url: post.url,
            content: post.content,
            published: Utc::now(),
            in_reply_to: post.in_reply_to,
            recipients: post.recipients,
            is_private: post.is_private,
            attachments: Vec::new(),
        };
        self.posts.write().await.push(stored.clone());
        stored
    }
}

#[async_trait]
impl PostStore for MemoryPostStore {
    async fn count_posts(&self, user: &str) -> Result<u64> {
        let posts = self.posts.read().await;
        Ok(posts
            .iter()
            .filter(|p| p.author == user && !p.is_private)
            .count() as u64)
    }

    async fn posts_of(
        &self,
        user: &str,
        min_id: Option<u64>,
        limit: usize,
    ) -> Result<Vec<LocalPost>> {
        let posts = self.posts.read().await;
        let floor = min_id.unwrap_or(0);
        let mut page: Vec<LocalPost> = posts
            .iter()
            .filter(|p| p.author == user && !p.is_private && p.seq > floor)
            .cloned()
            .collect();
        page.sort_by_key(|p| p.seq);
        page.truncate(limit);
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn follow(follower: &str, followed: &str) -> NewRelationship {
        NewRelationship {
            follower: follower.to_string(),
            followed: followed.to_string(),
            follower_actor_url: format!("https://remote.example/actor/{follower}"),
            followed_actor_url: format!("https://local.example/actor/{followed}"),
            profile_url: format!("https://remote.example/@{follower}"),
        }
    }

    #[tokio::test]
    async fn find_or_create_is_idempotent() {
        let store = MemoryFriendStore::new();
        let (first, created) = store.find_or_create(follow("bob", "alice")).await.unwrap();
        let (second, created_again) = store.find_or_create(follow("bob", "alice")).await.unwrap();

        assert!(created);
        assert!(!created_again);
        assert_eq!(first, second);
        assert_eq!(store.count_followers("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_reports_whether_anything_was_removed() {
        let store = MemoryFriendStore::new();
        store.find_or_create(follow("bob", "alice")).await.unwrap();

        assert!(store.delete("bob", "alice").await.unwrap());
        assert!(!store.delete("bob", "alice").await.unwrap());
        assert!(store.find("bob", "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn followers_page_honours_cursor_and_limit() {
        let store = MemoryFriendStore::new();
        for name in ["a", "b", "c", "d"] {
            store.find_or_create(follow(name, "alice")).await.unwrap();
        }
        store.find_or_create(follow("alice", "zed")).await.unwrap();

        let first = store.followers_of("alice", None, 2).await.unwrap();
        assert_eq!(
            first.iter().map(|r| r.follower.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        let rest = store
            .followers_of("alice", Some(first[1].seq), 10)
            .await
            .unwrap();
        assert_eq!(
            rest.iter().map(|r| r.follower.as_str()).collect::<Vec<_>>(),
            vec!["c", "d"]
        );

        let following = store.following_of("alice", Some(0), 10).await.unwrap();
        assert_eq!(following.len(), 1);
        assert_eq!(store.count_following("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn private_posts_stay_out_of_the_outbox() {
        let store = MemoryPostStore::new();
        store
            .add(NewPost {
                author: "alice".to_string(),
                url: "https://local.example/posts/1".to_string(),
                content: "hello".to_string(),
                in_reply_to: None,
                recipients: Vec::new(),
                is_private: false,
            })
            .await;
        store
            .add(NewPost {
                author: "alice".to_string(),
                url: "https://local.example/posts/2".to_string(),
                content: "secret".to_string(),
                in_reply_to: None,
                recipients: vec!["https://remote.example/actor/bob".to_string()],
                is_private: true,
            })
            .await;

        assert_eq!(store.count_posts("alice").await.unwrap(), 1);
        let posts = store.posts_of("alice", None, 10).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].content, "hello");
    }

    #[tokio::test]
    async fn user_store_returns_inserted_keys() {
        let store = MemoryUserStore::new();
        store.insert("alice", "private", "public").await;

        assert!(store.user_exists("alice").await.unwrap());
        assert!(!store.user_exists("carol").await.unwrap());
        assert_eq!(
            store.get_private_key_for_user("alice").await.unwrap(),
            Some("private".to_string())
        );
        assert_eq!(store.get_public_key_for_user("carol").await.unwrap(), None);
        assert_eq!(store.user_names().await, vec!["alice".to_string()]);
    }
}
