//! Fake remote peer and engine wiring for unit tests.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use super::actor::{ActorCache, ActorDirectory};
use super::delivery::SecureDelivery;
use super::keys::PrivateKeyCache;
use super::local::LocalActors;
use super::signature::tests::test_keypair;
use super::webfinger::WebFingerResolver;
use crate::store::{MemoryFriendStore, MemoryUserStore};
use crate::tasks::TaskQueue;

#[derive(Clone)]
struct PeerState {
    base: String,
    authority: String,
    users: Arc<Vec<String>>,
    inbox: Arc<Mutex<Vec<(String, Value)>>>,
}

/// A remote server with a fixed set of users
pub(crate) struct FakePeer {
    pub authority: String,
    pub base: String,
    inbox: Arc<Mutex<Vec<(String, Value)>>>,
}

impl FakePeer {
    pub async fn spawn(users: &[&str]) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let authority = listener.local_addr().unwrap().to_string();
        let base = format!("http://{authority}");
        let inbox = Arc::new(Mutex::new(Vec::new()));

        let state = PeerState {
            base: base.clone(),
            authority: authority.clone(),
            users: Arc::new(users.iter().map(|u| u.to_string()).collect()),
            inbox: inbox.clone(),
        };

        let app = Router::new()
            .route("/.well-known/webfinger", get(webfinger))
            .route("/actor/:user", get(actor))
            .route("/inbox/:user", post(receive))
            .route("/followers/:user", get(collection))
            .route("/following/:user", get(collection))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            authority,
            base,
            inbox,
        }
    }

    pub fn actor_url(&self, user: &str) -> String {
        format!("{}/actor/{}", self.base, user)
    }

    pub fn handle(&self, user: &str) -> String {
        format!("{}@{}", user, self.authority)
    }

    /// Bodies POSTed to `user`'s inbox
    pub async fn received(&self, user: &str) -> Vec<Value> {
        self.inbox
            .lock()
            .await
            .iter()
            .filter(|(to, _)| to == user)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

async fn webfinger(
    State(state): State<PeerState>,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> Response {
    let resource = params.get("resource").cloned().unwrap_or_default();
    let expected_suffix = format!("@{}", state.authority);
    let user = resource
        .strip_prefix("acct:")
        .and_then(|r| r.strip_suffix(&expected_suffix))
        .unwrap_or_default();

    if !state.users.iter().any(|u| u == user) {
        return StatusCode::NOT_FOUND.into_response();
    }

    Json(json!({
        "subject": resource,
        "links": [{
            "rel": "self",
            "type": "application/activity+json",
            "href": format!("{}/actor/{}", state.base, user)
        }]
    }))
    .into_response()
}

async fn actor(State(state): State<PeerState>, Path(user): Path<String>) -> Response {
    if !state.users.contains(&user) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let id = format!("{}/actor/{}", state.base, user);
    Json(json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": id,
        "type": "Person",
        "preferredUsername": user,
        "inbox": format!("{}/inbox/{}", state.base, user),
        "followers": format!("{}/followers/{}", state.base, user),
        "following": format!("{}/following/{}", state.base, user),
        "url": format!("{}/@{}", state.base, user),
        "publicKey": {
            "id": format!("{id}#main-key"),
            "owner": id,
            "publicKeyPem": test_keypair().1
        }
    }))
    .into_response()
}

/// Followers and following both list every other peer user: one item on
/// `?page=1`, the rest on `?page=2`.
async fn collection(
    State(state): State<PeerState>,
    Path(user): Path<String>,
    uri: Uri,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> Response {
    if !state.users.contains(&user) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let url = format!("{}{}", state.base, uri.path());
    let others: Vec<String> = state
        .users
        .iter()
        .filter(|u| **u != user)
        .map(|u| format!("{}/actor/{}", state.base, u))
        .collect();
    let (head, tail) = others.split_at(others.len().min(1));

    let body = match params.get("page").map(String::as_str) {
        None => json!({
            "id": url,
            "type": "OrderedCollection",
            "totalItems": others.len(),
            "first": format!("{url}?page=1")
        }),
        Some("1") => json!({
            "type": "OrderedCollectionPage",
            "partOf": url,
            "orderedItems": head,
            "next": format!("{url}?page=2")
        }),
        Some(_) => json!({
            "type": "OrderedCollectionPage",
            "partOf": url,
            "orderedItems": tail
        }),
    };
    Json(body).into_response()
}

async fn receive(
    State(state): State<PeerState>,
    Path(user): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    state.inbox.lock().await.push((user, body));
    StatusCode::ACCEPTED
}

/// Engine collaborators over in-memory stores, local base `https://local.example`
pub(crate) struct TestEngine {
    pub local: LocalActors,
    pub users: Arc<MemoryUserStore>,
    pub friends: Arc<MemoryFriendStore>,
    pub directory: ActorDirectory,
    pub resolver: WebFingerResolver,
    pub delivery: SecureDelivery,
    pub tasks: TaskQueue,
}

impl TestEngine {
    /// Local users each get the shared test key pair.
    pub async fn new(local_users: &[&str]) -> Self {
        let users = Arc::new(MemoryUserStore::new());
        let (private_pem, public_pem) = test_keypair();
        for user in local_users {
            users.insert(user, private_pem.as_str(), public_pem.as_str()).await;
        }

        let client = reqwest::Client::new();
        let directory = ActorDirectory::new(client.clone(), Arc::new(ActorCache::default()));
        let resolver = WebFingerResolver::new(client.clone(), "http", directory.clone());
        let keys = Arc::new(PrivateKeyCache::new(users.clone()));

        Self {
            local: LocalActors::new("https://local.example", "local.example"),
            users,
            friends: Arc::new(MemoryFriendStore::new()),
            directory,
            resolver,
            delivery: SecureDelivery::new(client, keys),
            tasks: TaskQueue::new(4),
        }
    }
}
