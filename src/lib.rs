//! fedlink - an ActivityPub federation engine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - WebFinger                                                │
//! │  - Actor, inbox, outbox, followers, following               │
//! │  - Health and metrics                                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - HTTP Signatures, actor directory, WebFinger resolver     │
//! │  - Follow handshake, activity factory, collection paging    │
//! │  - Signed delivery through the background task queue        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Collaborators                             │
//! │  - UserStore / FriendStore / PostStore                      │
//! │  - TaskExecutor                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub protocol handling
//! - `store`: collaborator traits and in-memory implementations
//! - `tasks`: background task execution
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod store;
pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use federation::{
    ActivityFactory, ActorCache, ActorDirectory, CollectionPaginator, FollowCoordinator,
    LocalActors, PrivateKeyCache, SecureDelivery, WebFingerResolver,
};
use store::{FriendStore, MemoryFriendStore, MemoryPostStore, MemoryUserStore, PostStore, UserStore};
use tasks::TaskQueue;

/// Application state shared across all handlers
///
/// Every field is cheap to clone; the collaborators behind it are shared.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Local URL scheme
    pub local: LocalActors,

    /// Local users and their key pairs
    pub users: Arc<dyn UserStore>,

    /// Follow relationships
    pub friends: Arc<dyn FriendStore>,

    /// Local users' own posts
    pub posts: Arc<dyn PostStore>,

    /// Remote actor documents (cached)
    pub directory: ActorDirectory,

    /// Handle to actor URL resolution
    pub resolver: WebFingerResolver,

    /// Signed outbound POSTs
    pub delivery: SecureDelivery,

    /// Local users' private keys (cached)
    pub keys: Arc<PrivateKeyCache>,

    /// Follow/Undo/Accept handshake
    pub coordinator: FollowCoordinator,

    /// Outbound activity construction
    pub factory: ActivityFactory,

    /// Collection documents
    pub paginator: CollectionPaginator,

    /// Background work
    pub tasks: TaskQueue,

    /// HTTP client for federation
    pub http_client: reqwest::Client,
}

impl AppState {
    /// Wire the engine around the given collaborators.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built
    pub fn new(
        config: config::AppConfig,
        users: Arc<dyn UserStore>,
        friends: Arc<dyn FriendStore>,
        posts: Arc<dyn PostStore>,
    ) -> Result<Self, error::AppError> {
        let federation = &config.federation;

        let http_client = reqwest::Client::builder()
            .user_agent(federation.user_agent.clone())
            .timeout(Duration::from_secs(federation.http_timeout_secs))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let local = LocalActors::new(config.server.base_url(), config.server.domain.clone());
        let directory = ActorDirectory::new(
            http_client.clone(),
            Arc::new(ActorCache::new(federation.actor_cache_ttl())),
        );
        let resolver = WebFingerResolver::new(
            http_client.clone(),
            federation.webfinger_scheme.clone(),
            directory.clone(),
        );
        let keys = Arc::new(PrivateKeyCache::new(users.clone()));
        let delivery = SecureDelivery::new(http_client.clone(), keys.clone());
        let tasks = TaskQueue::new(federation.max_concurrent_tasks);

        let coordinator = FollowCoordinator::new(
            local.clone(),
            resolver.clone(),
            directory.clone(),
            delivery.clone(),
            friends.clone(),
            users.clone(),
            Arc::new(tasks.clone()),
            federation.handshake_delay(),
        );
        let factory = ActivityFactory::new(local.clone(), resolver.clone(), directory.clone());
        let paginator = CollectionPaginator::new(
            local.clone(),
            friends.clone(),
            posts.clone(),
            factory.clone(),
            directory.clone(),
            http_client.clone(),
            federation.page_size,
            federation.max_collection_items,
        );

        tracing::info!(
            base_url = %local.base_url(),
            page_size = federation.page_size,
            handshake_delay_ms = federation.handshake_delay_ms,
            "Federation engine initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            local,
            users,
            friends,
            posts,
            directory,
            resolver,
            delivery,
            keys,
            coordinator,
            factory,
            paginator,
            tasks,
            http_client,
        })
    }

    /// State over in-memory stores, with a generated key pair for each
    /// configured user.
    pub async fn in_memory(config: config::AppConfig) -> Result<Self, error::AppError> {
        let users = MemoryUserStore::generate(&config.users.names, config.users.key_bits).await?;
        Self::new(
            config,
            Arc::new(users),
            Arc::new(MemoryFriendStore::new()),
            Arc::new(MemoryPostStore::new()),
        )
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(axum::middleware::from_fn(api::metrics::track_http_requests))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
