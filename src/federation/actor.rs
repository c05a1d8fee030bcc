//! Actor Directory
//!
//! Fetches remote actor documents and keeps them in an in-process cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::activity::ACTIVITY_JSON;
use super::signature::parse_public_key_pem;
use crate::error::AppError;
use crate::metrics::CACHE_LOOKUPS_TOTAL;

/// Accept header for actor document requests
pub const ACTOR_ACCEPT: &str = "application/activity+json, application/ld+json";

/// Actor document (Person, Service, Application, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub id: String,
    #[serde(rename = "type", default = "default_actor_type")]
    pub actor_type: String,
    pub inbox: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<ActorEndpoints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Human-facing profile page; a string or a Link object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<ActorPublicKey>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_actor_type() -> String {
    "Person".to_string()
}

/// `endpoints` block of an actor document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorEndpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `publicKey` block of an actor document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorPublicKey {
    pub id: String,
    pub owner: String,
    pub public_key_pem: String,
}

impl Actor {
    /// Shared inbox, from the top level or from `endpoints`
    pub fn shared_inbox_url(&self) -> Option<&str> {
        self.shared_inbox.as_deref().or_else(|| {
            self.endpoints
                .as_ref()
                .and_then(|endpoints| endpoints.shared_inbox.as_deref())
        })
    }

    /// Profile page URL, falling back to the actor id
    pub fn profile_url(&self) -> &str {
        let from_url = match &self.url {
            Some(Value::String(url)) => Some(url.as_str()),
            Some(Value::Object(link)) => link.get("href").and_then(Value::as_str),
            Some(Value::Array(links)) => links.iter().find_map(|link| match link {
                Value::String(url) => Some(url.as_str()),
                Value::Object(link) => link.get("href").and_then(Value::as_str),
                _ => None,
            }),
            _ => None,
        };
        from_url.unwrap_or(&self.id)
    }

    /// `preferredUsername@host[:port]` for bookkeeping
    ///
    /// Falls back to the last path segment of the id when the actor has no
    /// `preferredUsername`.
    pub fn handle(&self) -> Result<String, AppError> {
        handle_from_actor_url(&self.id, self.preferred_username.as_deref())
    }
}

/// `user@host[:port]` for an actor URL
///
/// `user` is `preferred_username` when given, else the last path segment.
pub fn handle_from_actor_url(
    actor_url: &str,
    preferred_username: Option<&str>,
) -> Result<String, AppError> {
    let url = url::Url::parse(actor_url)
        .map_err(|e| AppError::Resolution(format!("Invalid actor id {}: {}", actor_url, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Resolution(format!("Actor id has no host: {}", actor_url)))?;
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let user = match preferred_username {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => url
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| {
                AppError::Resolution(format!("Cannot derive a user name for {}", actor_url))
            })?,
    };

    Ok(format!("{}@{}", user, authority))
}

#[derive(Debug, Clone)]
struct CachedActor {
    actor: Arc<Actor>,
    cached_at: Instant,
}

/// Process-wide actor cache
///
/// Entries are replaced on refresh, never mutated. Without a TTL entries
/// live for the process lifetime.
pub struct ActorCache {
    entries: RwLock<HashMap<String, CachedActor>>,
    ttl: Option<Duration>,
}

impl ActorCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn is_valid(&self, entry: &CachedActor) -> bool {
        self.ttl
            .map(|ttl| entry.cached_at.elapsed() < ttl)
            .unwrap_or(true)
    }

    pub async fn get(&self, url: &str) -> Option<Arc<Actor>> {
        let entries = self.entries.read().await;
        let hit = entries
            .get(url)
            .filter(|entry| self.is_valid(entry))
            .map(|entry| entry.actor.clone());

        let result = if hit.is_some() { "hit" } else { "miss" };
        CACHE_LOOKUPS_TOTAL
            .with_label_values(&["actor", result])
            .inc();
        hit
    }

    pub async fn insert(&self, url: &str, actor: Arc<Actor>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            url.to_string(),
            CachedActor {
                actor,
                cached_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, url: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(url);
        tracing::debug!(actor = %url, "Invalidated actor cache entry");
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let total = entries.len();
        let valid = entries.values().filter(|e| self.is_valid(e)).count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }

    /// Prune expired entries
    pub async fn prune_expired(&self) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| self.is_valid(entry));
        let removed = before - entries.len();

        if removed > 0 {
            tracing::info!("Pruned {} expired actor cache entries", removed);
        }
    }
}

impl Default for ActorCache {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of entries
    pub total_entries: usize,
    /// Number of valid (non-expired) entries
    pub valid_entries: usize,
    /// Number of expired entries
    pub expired_entries: usize,
}

/// Remote actor lookup backed by an [`ActorCache`]
#[derive(Clone)]
pub struct ActorDirectory {
    http_client: reqwest::Client,
    cache: Arc<ActorCache>,
}

impl ActorDirectory {
    pub fn new(http_client: reqwest::Client, cache: Arc<ActorCache>) -> Self {
        Self { http_client, cache }
    }

    pub fn cache(&self) -> &Arc<ActorCache> {
        &self.cache
    }

    /// Fetch an actor document over HTTP and (re)populate the cache.
    ///
    /// # Errors
    /// `AppError::Resolution` on network failure, non-2xx, unparsable body
    /// or when the document's `id` is not `url`.
    pub async fn fetch_actor(&self, url: &str) -> Result<Arc<Actor>, AppError> {
        tracing::debug!(actor = %url, "Fetching actor document");

        let response = self
            .http_client
            .get(url)
            .header("Accept", ACTOR_ACCEPT)
            .send()
            .await
            .map_err(|e| AppError::Resolution(format!("Failed to fetch actor {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Resolution(format!(
                "Failed to fetch actor {}: HTTP {}",
                url,
                response.status()
            )));
        }

        let actor: Actor = response
            .json()
            .await
            .map_err(|e| AppError::Resolution(format!("Failed to parse actor {}: {}", url, e)))?;

        if actor.id != url {
            return Err(AppError::Resolution(format!(
                "Actor document id {} does not match requested {}",
                actor.id, url
            )));
        }

        let actor = Arc::new(actor);
        self.cache.insert(url, actor.clone()).await;
        Ok(actor)
    }

    /// Cached actor, fetching it on a miss
    pub async fn get_actor(&self, url: &str) -> Result<Arc<Actor>, AppError> {
        if let Some(actor) = self.cache.get(url).await {
            tracing::debug!(actor = %url, "Actor cache hit");
            return Ok(actor);
        }
        self.fetch_actor(url).await
    }

    /// Cached actor only; never touches the network
    pub async fn cached_actor(&self, url: &str) -> Option<Arc<Actor>> {
        self.cache.get(url).await
    }

    pub async fn invalidate(&self, url: &str) {
        self.cache.invalidate(url).await;
    }

    /// Parse the actor's advertised public key.
    ///
    /// # Errors
    /// `AppError::Authentication` when the key is missing or unparsable.
    pub fn public_key_for(actor: &Actor) -> Result<RsaPublicKey, AppError> {
        let public_key = actor.public_key.as_ref().ok_or_else(|| {
            AppError::Authentication(format!("Actor {} has no publicKey", actor.id))
        })?;
        parse_public_key_pem(&public_key.public_key_pem)
    }
}

/// Response header check for places that serve actors
pub fn is_activity_json(content_type: &str) -> bool {
    let mime = content_type.split(';').next().unwrap_or_default().trim();
    mime.eq_ignore_ascii_case(ACTIVITY_JSON) || mime.eq_ignore_ascii_case("application/ld+json")
}
