//! Collection paging
//!
//! Serves local outbox/followers/following as OrderedCollection summaries
//! and pages, and walks remote collections page by page.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;

use super::activity::{ApObject, ObjectRef, OrderedCollection, OrderedCollectionPage, one_or_many};
use super::actor::{ACTOR_ACCEPT, Actor, ActorDirectory};
use super::factory::ActivityFactory;
use super::local::LocalActors;
use crate::error::AppError;
use crate::store::{FriendStore, PostStore};

/// Local collections served per user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Outbox,
    Followers,
    Following,
}

impl CollectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Outbox => "outbox",
            CollectionKind::Followers => "followers",
            CollectionKind::Following => "following",
        }
    }

    pub fn url(&self, local: &LocalActors, user: &str) -> String {
        match self {
            CollectionKind::Outbox => local.outbox_url(user),
            CollectionKind::Followers => local.followers_url(user),
            CollectionKind::Following => local.following_url(user),
        }
    }
}

/// Visitor decision while walking a remote collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    Stop,
}

/// Actor URLs read from a remote actor's followers or following collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteActorList {
    /// Visited item ids, at most `federation.max_collection_items`
    pub actors: Vec<String>,
    /// `totalItems` as reported by the remote server
    pub total_items: Option<u64>,
}

/// Any collection or collection page, as sent by peers
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionView {
    #[serde(default, deserialize_with = "one_or_many")]
    ordered_items: Vec<ObjectRef>,
    #[serde(default, deserialize_with = "one_or_many")]
    items: Vec<ObjectRef>,
    #[serde(default)]
    first: Option<ObjectRef>,
    #[serde(default)]
    next: Option<ObjectRef>,
    #[serde(default)]
    total_items: Option<u64>,
}

impl CollectionView {
    fn take_items(&mut self) -> Vec<ObjectRef> {
        let mut items = std::mem::take(&mut self.ordered_items);
        items.append(&mut self.items);
        items
    }
}

/// Builds local collection documents and consumes remote ones
#[derive(Clone)]
pub struct CollectionPaginator {
    local: LocalActors,
    friends: Arc<dyn FriendStore>,
    posts: Arc<dyn PostStore>,
    factory: ActivityFactory,
    directory: ActorDirectory,
    http_client: reqwest::Client,
    page_size: usize,
    max_collection_items: usize,
}

impl CollectionPaginator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: LocalActors,
        friends: Arc<dyn FriendStore>,
        posts: Arc<dyn PostStore>,
        factory: ActivityFactory,
        directory: ActorDirectory,
        http_client: reqwest::Client,
        page_size: usize,
        max_collection_items: usize,
    ) -> Self {
        Self {
            local,
            friends,
            posts,
            factory,
            directory,
            http_client,
            page_size: page_size.max(1),
            max_collection_items,
        }
    }

    async fn total_items(&self, kind: CollectionKind, user: &str) -> Result<u64, AppError> {
        match kind {
            CollectionKind::Outbox => self.posts.count_posts(user).await,
            CollectionKind::Followers => self.friends.count_followers(user).await,
            CollectionKind::Following => self.friends.count_following(user).await,
        }
    }

    /// Collection summary with `first` and `last` page links
    pub async fn generate_collection(
        &self,
        kind: CollectionKind,
        user: &str,
    ) -> Result<ApObject, AppError> {
        let url = kind.url(&self.local, user);
        let total = self.total_items(kind, user).await?;

        Ok(ApObject::OrderedCollection(OrderedCollection {
            id: Some(url.clone()),
            total_items: Some(total),
            first: Some(ObjectRef::Link(format!("{}?page=true", url))),
            last: Some(ObjectRef::Link(format!("{}?min_id=0&page=true", url))),
            ..Default::default()
        })
        .with_context())
    }

    /// One page of items with `seq > min_id`
    ///
    /// `next` is set when the page is full. Repeated calls with the same
    /// cursor return the same page while the underlying data is unchanged.
    pub async fn generate_page(
        &self,
        kind: CollectionKind,
        user: &str,
        min_id: Option<u64>,
    ) -> Result<ApObject, AppError> {
        let url = kind.url(&self.local, user);
        let total = self.total_items(kind, user).await?;

        let (items, last_seq): (Vec<ObjectRef>, Option<u64>) = match kind {
            CollectionKind::Followers => {
                let page = self.friends.followers_of(user, min_id, self.page_size).await?;
                let last = page.last().map(|r| r.seq);
                (
                    page.into_iter()
                        .map(|r| ObjectRef::Link(r.follower_actor_url))
                        .collect(),
                    last,
                )
            }
            CollectionKind::Following => {
                let page = self.friends.following_of(user, min_id, self.page_size).await?;
                let last = page.last().map(|r| r.seq);
                (
                    page.into_iter()
                        .map(|r| ObjectRef::Link(r.followed_actor_url))
                        .collect(),
                    last,
                )
            }
            CollectionKind::Outbox => {
                let page = self.posts.posts_of(user, min_id, self.page_size).await?;
                let last = page.last().map(|p| p.seq);
                (
                    page.iter()
                        .map(|post| self.factory.create_for_post(post).into())
                        .collect(),
                    last,
                )
            }
        };

        let id = match min_id {
            Some(min_id) => format!("{}?page=true&min_id={}", url, min_id),
            None => format!("{}?page=true", url),
        };
        let next = match last_seq {
            Some(seq) if items.len() >= self.page_size => Some(ObjectRef::Link(format!(
                "{}?page=true&min_id={}",
                url, seq
            ))),
            _ => None,
        };

        Ok(ApObject::OrderedCollectionPage(OrderedCollectionPage {
            id: Some(id),
            part_of: Some(url),
            total_items: Some(total),
            ordered_items: items,
            next,
            ..Default::default()
        })
        .with_context())
    }

    async fn fetch_view(&self, url: &str) -> Result<CollectionView, AppError> {
        let response = self
            .http_client
            .get(url)
            .header("Accept", ACTOR_ACCEPT)
            .send()
            .await
            .map_err(|e| AppError::Resolution(format!("Failed to fetch collection {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Resolution(format!(
                "Failed to fetch collection {}: HTTP {}",
                url,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::Resolution(format!("Malformed collection {}: {}", url, e)))
    }

    /// Walk a remote collection, calling `visit` for each item.
    ///
    /// Embedded items are visited first, then `first` and the `next` chain
    /// (links are fetched, embedded pages used as-is). Visitor errors are
    /// logged and the walk continues. A page URL seen twice ends the walk.
    ///
    /// # Returns
    /// Number of items visited
    pub async fn iterate_collection<F>(
        &self,
        url: &str,
        max_items: usize,
        visit: F,
    ) -> Result<usize, AppError>
    where
        F: FnMut(&ObjectRef) -> Result<Visit, AppError>,
    {
        let root = self.fetch_view(url).await?;
        self.walk(url, root, max_items, visit).await
    }

    async fn walk<F>(
        &self,
        url: &str,
        mut page: CollectionView,
        max_items: usize,
        mut visit: F,
    ) -> Result<usize, AppError>
    where
        F: FnMut(&ObjectRef) -> Result<Visit, AppError>,
    {
        let mut seen_pages = HashSet::from([url.to_string()]);
        let mut visited = 0;
        let mut is_root = true;

        loop {
            for item in page.take_items() {
                if visited >= max_items {
                    return Ok(visited);
                }
                visited += 1;
                match visit(&item) {
                    Ok(Visit::Continue) => {}
                    Ok(Visit::Stop) => return Ok(visited),
                    Err(error) => {
                        tracing::warn!(collection = %url, item = ?item.id(), %error, "Collection item failed");
                    }
                }
            }

            let link = if is_root {
                page.first.take().or_else(|| page.next.take())
            } else {
                page.next.take()
            };
            is_root = false;

            page = match link {
                None => return Ok(visited),
                Some(ObjectRef::Link(next_url)) => {
                    if !seen_pages.insert(next_url.clone()) {
                        tracing::warn!(collection = %url, page = %next_url, "Collection page loop detected");
                        return Ok(visited);
                    }
                    self.fetch_view(&next_url).await?
                }
                Some(embedded) => {
                    let value = serde_json::to_value(&embedded).map_err(|e| {
                        AppError::Internal(anyhow::anyhow!("Failed to re-encode page: {}", e))
                    })?;
                    serde_json::from_value(value).map_err(|e| {
                        AppError::Resolution(format!("Malformed embedded page in {}: {}", url, e))
                    })?
                }
            };
        }
    }

    /// `totalItems` of a remote actor's followers or following collection.
    pub async fn remote_total_items(
        &self,
        actor_url: &str,
        kind: CollectionKind,
    ) -> Result<Option<u64>, AppError> {
        let actor = self.directory.get_actor(actor_url).await?;
        let Some(collection_url) = remote_collection_url(&actor, kind) else {
            return Ok(None);
        };
        Ok(self.fetch_view(collection_url).await?.total_items)
    }

    /// Actors a remote user follows, read from their `following` collection
    pub async fn load_remote_following(&self, actor_url: &str) -> Result<RemoteActorList, AppError> {
        self.load_remote_actors(actor_url, CollectionKind::Following).await
    }

    /// Actors following a remote user, read from their `followers` collection
    pub async fn load_remote_followers(&self, actor_url: &str) -> Result<RemoteActorList, AppError> {
        self.load_remote_actors(actor_url, CollectionKind::Followers).await
    }

    /// Walk one of a remote actor's collections, up to
    /// `max_collection_items` entries. Items without an id are logged and
    /// skipped.
    async fn load_remote_actors(
        &self,
        actor_url: &str,
        kind: CollectionKind,
    ) -> Result<RemoteActorList, AppError> {
        let actor = self.directory.get_actor(actor_url).await?;
        let Some(collection_url) = remote_collection_url(&actor, kind) else {
            tracing::debug!(actor = %actor_url, collection = kind.as_str(), "Actor publishes no such collection");
            return Ok(RemoteActorList::default());
        };

        let root = self.fetch_view(collection_url).await?;
        let total_items = root.total_items;
        let mut actors = Vec::new();
        let visited = self
            .walk(collection_url, root, self.max_collection_items, |item| match item.id() {
                Some(id) => {
                    actors.push(id.to_string());
                    Ok(Visit::Continue)
                }
                None => Err(AppError::MalformedActivity(
                    "Collection item has no id".to_string(),
                )),
            })
            .await?;

        tracing::debug!(
            actor = %actor_url,
            collection = kind.as_str(),
            visited,
            loaded = actors.len(),
            total_items = ?total_items,
            "Loaded remote collection"
        );
        Ok(RemoteActorList { actors, total_items })
    }
}

fn remote_collection_url(actor: &Actor, kind: CollectionKind) -> Option<&str> {
    match kind {
        CollectionKind::Followers => actor.followers.as_deref(),
        CollectionKind::Following => actor.following.as_deref(),
        CollectionKind::Outbox => actor.outbox.as_deref(),
    }
}
