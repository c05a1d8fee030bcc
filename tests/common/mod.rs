//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use fedlink::config::{AppConfig, FederationConfig, LoggingConfig, ServerConfig, UsersConfig};
use fedlink::federation::{key_id_for, sign_request};
use fedlink::store::{MemoryFriendStore, MemoryPostStore, MemoryUserStore, generate_key_pair};
use fedlink::{AppState, build_router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Smallest key size that keeps test key generation fast
pub const TEST_KEY_BITS: usize = 1024;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub friends: Arc<MemoryFriendStore>,
    pub posts: Arc<MemoryPostStore>,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Start the real router with in-memory stores and the given local users.
    ///
    /// The handshake delay is zero and WebFinger uses plain http so fake
    /// peers on loopback can be resolved.
    pub async fn new(users: &[&str]) -> Self {
        // Bind first: the public domain must carry the assigned port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: addr.to_string(),
                protocol: "http".to_string(),
            },
            federation: FederationConfig {
                handshake_delay_ms: 0,
                page_size: 20,
                webfinger_scheme: "http".to_string(),
                http_timeout_secs: 5,
                ..FederationConfig::default()
            },
            users: UsersConfig {
                names: users.iter().map(|u| u.to_string()).collect(),
                key_bits: TEST_KEY_BITS,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let user_store = MemoryUserStore::generate(&config.users.names, TEST_KEY_BITS)
            .await
            .unwrap();
        let friends = Arc::new(MemoryFriendStore::new());
        let posts = Arc::new(MemoryPostStore::new());
        let state = AppState::new(
            config,
            Arc::new(user_store),
            friends.clone(),
            posts.clone(),
        )
        .unwrap();

        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr: format!("http://{}", addr),
            state,
            friends,
            posts,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn actor_url(&self, user: &str) -> String {
        self.url(&format!("/actor/{}", user))
    }

    /// Wait until background handshake work has finished
    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.state.tasks.wait_idle())
            .await
            .expect("background tasks did not finish");
    }
}

#[derive(Clone)]
struct PeerState {
    base: String,
    authority: String,
    users: Arc<Vec<String>>,
    public_key_pem: Arc<String>,
    inbox: Arc<Mutex<Vec<(String, Value)>>>,
}

/// A remote ActivityPub server with a fixed set of users sharing one key
pub struct RemotePeer {
    pub base: String,
    pub authority: String,
    private_key_pem: String,
    inbox: Arc<Mutex<Vec<(String, Value)>>>,
}

impl RemotePeer {
    pub async fn spawn(users: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let authority = listener.local_addr().unwrap().to_string();
        let base = format!("http://{}", authority);
        let (private_key_pem, public_key_pem) = generate_key_pair(TEST_KEY_BITS).unwrap();
        let inbox = Arc::new(Mutex::new(Vec::new()));

        let state = PeerState {
            base: base.clone(),
            authority: authority.clone(),
            users: Arc::new(users.iter().map(|u| u.to_string()).collect()),
            public_key_pem: Arc::new(public_key_pem),
            inbox: inbox.clone(),
        };

        let app = Router::new()
            .route("/.well-known/webfinger", get(peer_webfinger))
            .route("/actor/:user", get(peer_actor))
            .route("/inbox/:user", post(peer_inbox))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base,
            authority,
            private_key_pem,
            inbox,
        }
    }

    pub fn actor_url(&self, user: &str) -> String {
        format!("{}/actor/{}", self.base, user)
    }

    /// `user@host:port`
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

    /// Headers for POSTing `body` to `url`, signed as `user`
    pub fn sign(&self, user: &str, url: &str, body: &[u8]) -> Vec<(&'static str, String)> {
        let signed = sign_request(
            "POST",
            url,
            Some(body),
            &self.private_key_pem,
            &key_id_for(&self.actor_url(user)),
        )
        .unwrap();

        let mut headers = vec![
            ("content-type", "application/activity+json".to_string()),
            ("date", signed.date),
            ("signature", signed.signature),
        ];
        if let Some(digest) = signed.digest {
            headers.push(("digest", digest));
        }
        headers
    }

    /// POST `activity` to `url`, signed as `user`
    pub async fn post_signed(
        &self,
        client: &reqwest::Client,
        user: &str,
        url: &str,
        activity: &Value,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        let mut request = client.post(url);
        for (name, value) in self.sign(user, url, &body) {
            request = request.header(name, value);
        }
        request.body(body).send().await.unwrap()
    }

    /// A Follow from `user` of `target_actor`
    pub fn follow(&self, user: &str, target_actor: &str) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/follows/{}", self.base, ulid::Ulid::new()),
            "type": "Follow",
            "actor": self.actor_url(user),
            "object": target_actor
        })
    }
}

async fn peer_webfinger(
    State(state): State<PeerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let resource = params.get("resource").cloned().unwrap_or_default();
    let suffix = format!("@{}", state.authority);
    let user = resource
        .strip_prefix("acct:")
        .and_then(|r| r.strip_suffix(&suffix))
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

async fn peer_actor(State(state): State<PeerState>, Path(user): Path<String>) -> Response {
    if !state.users.contains(&user) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let id = format!("{}/actor/{}", state.base, user);
    Json(json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": id,
        "type": "Person",
        "preferredUsername": user,
        "inbox": format!("{}/inbox/{}", state.base, user),
        "outbox": format!("{}/outbox/{}", state.base, user),
        "followers": format!("{}/followers/{}", state.base, user),
        "following": format!("{}/following/{}", state.base, user),
        "url": format!("{}/@{}", state.base, user),
        "publicKey": {
            "id": format!("{}#main-key", id),
            "owner": id,
            "publicKeyPem": state.public_key_pem.as_str()
        }
    }))
    .into_response()
}

async fn peer_inbox(
    State(state): State<PeerState>,
    Path(user): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    state.inbox.lock().await.push((user, body));
    StatusCode::ACCEPTED
}
