//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving)
//! - Outbox
//! - Followers/Following collections

use std::time::Duration;

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, Query, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use futures::FutureExt;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::AppState;
use crate::error::AppError;
use crate::federation::signature::signature_from_headers;
use crate::federation::{
    ACTIVITY_JSON, Activity, ActivityType, ActorDirectory, ApObject, CollectionKind, DatePolicy,
    ObjectRef, ParsedSignature, key_id_matches_actor, verify_signature,
};
use crate::metrics::{ACTIVITIES_RECEIVED, INBOX_REQUESTS_TOTAL, SIGNATURE_VERIFICATIONS};
use crate::tasks::TaskExecutor;

/// Create ActivityPub router
///
/// Routes:
/// - GET /actor/:user - Actor profile
/// - POST /inbox/:user - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /outbox/:user - Outbox
/// - GET /followers/:user - Followers collection
/// - GET /following/:user - Following collection
/// - GET /profile/:user - Profile link, redirects to the actor
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/actor/:user", get(actor))
        .route("/inbox/:user", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/outbox/:user", get(outbox))
        .route("/followers/:user", get(followers))
        .route("/following/:user", get(following))
        .route("/profile/:user", get(profile))
}

/// Serialize as `application/activity+json`
fn activity_json<T: Serialize>(body: &T) -> Result<Response, AppError> {
    let body = serde_json::to_vec(body)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode response: {}", e)))?;
    Ok(([(header::CONTENT_TYPE, ACTIVITY_JSON)], body).into_response())
}

async fn ensure_local_user(state: &AppState, user: &str) -> Result<(), AppError> {
    if state.users.user_exists(user).await? {
        Ok(())
    } else {
        Err(AppError::NotFound)
    }
}

/// GET /profile/:user
///
/// The profile link advertised in actor documents and WebFinger. There is no
/// HTML page here, so it points back at the actor document.
async fn profile(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Redirect, AppError> {
    ensure_local_user(&state, &user).await?;
    Ok(Redirect::to(&state.local.actor_url(&user)))
}

/// GET /actor/:user
///
/// Returns ActivityPub Actor document.
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Response, AppError> {
    let public_key_pem = state
        .users
        .get_public_key_for_user(&user)
        .await?
        .ok_or(AppError::NotFound)?;

    activity_json(&state.local.actor_document(&user, &public_key_pem))
}

/// POST /inbox/:user
///
/// Receives incoming ActivityPub activities for one local user.
async fn inbox(
    State(state): State<AppState>,
    Path(user): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    ensure_local_user(&state, &user).await?;
    receive(&state, &uri, &headers, &body).await
}

/// POST /inbox
///
/// Shared inbox for all users on this instance. Follows name their target
/// in `object`, so routing needs nothing beyond the activity itself.
async fn shared_inbox(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, &uri, &headers, &body).await
}

/// What the inbox did with a verified activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboxOutcome {
    Dispatched,
    Ignored,
}

impl InboxOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            InboxOutcome::Dispatched => "dispatched",
            InboxOutcome::Ignored => "ignored",
        }
    }
}

async fn receive(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, AppError> {
    match receive_activity(state, uri, headers, body).await {
        Ok(outcome) => {
            INBOX_REQUESTS_TOTAL
                .with_label_values(&[outcome.as_str()])
                .inc();
            Ok(StatusCode::OK)
        }
        Err(error) => {
            INBOX_REQUESTS_TOTAL.with_label_values(&["rejected"]).inc();
            tracing::warn!(path = %uri.path(), kind = error.kind(), %error, "Inbox request rejected");
            Err(error)
        }
    }
}

/// Parse, authenticate and dispatch one inbox POST.
///
/// # Steps
/// 1. Parse the body
/// 2. Verify the HTTP Signature against the signer's published key
/// 3. Check the activity actor is the signer
/// 4. Dispatch by type; handshake work runs in the background
async fn receive_activity(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<InboxOutcome, AppError> {
    // 1. Parse
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::MalformedActivity(format!("Invalid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(AppError::MalformedActivity(
            "Activity must be a JSON object".to_string(),
        ));
    }

    // 2. Authenticate
    let signature = authenticate(state, uri, headers, body).await?;

    let type_name = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let kind = ActivityType::from_str(&type_name);
    ACTIVITIES_RECEIVED
        .with_label_values(&[kind.map_or("unknown", |k| k.as_str())])
        .inc();

    if !matches!(
        kind,
        Some(ActivityType::Follow | ActivityType::Undo | ActivityType::Accept | ActivityType::Create)
    ) {
        tracing::debug!(activity_type = %type_name, "Ignoring unsupported activity");
        return Ok(InboxOutcome::Ignored);
    }

    let object: ApObject = serde_json::from_value(value)
        .map_err(|e| AppError::MalformedActivity(format!("Invalid {}: {}", type_name, e)))?;
    let Some(activity) = object.as_activity() else {
        return Ok(InboxOutcome::Ignored);
    };

    // 3. The signer must be the actor
    let actor = activity
        .actor_id()
        .ok_or_else(|| AppError::MalformedActivity("Activity has no actor".to_string()))?;
    if !key_id_matches_actor(&signature.key_id, actor) {
        return Err(AppError::Authentication(
            "Signature keyId actor mismatch".to_string(),
        ));
    }

    tracing::info!(
        activity_type = %type_name,
        id = ?activity.id,
        actor = %actor,
        "Activity received"
    );

    // 4. Dispatch
    match &object {
        ApObject::Follow(follow) => {
            state.coordinator.process_follow_action(follow.clone(), false);
            Ok(InboxOutcome::Dispatched)
        }
        ApObject::Undo(undo) => dispatch_undo(state, undo),
        ApObject::Accept(accept) => {
            let coordinator = state.coordinator.clone();
            let accept = accept.clone();
            state.tasks.execute(
                "accept",
                Duration::ZERO,
                async move { coordinator.process_accept(&accept).await.map(|_| ()) }.boxed(),
            );
            Ok(InboxOutcome::Dispatched)
        }
        ApObject::Create(create) => {
            tracing::info!(
                actor = %actor,
                object = ?create.object_id(),
                "Create received; content storage belongs to the host platform"
            );
            Ok(InboxOutcome::Ignored)
        }
        _ => Ok(InboxOutcome::Ignored),
    }
}

fn dispatch_undo(state: &AppState, undo: &Activity) -> Result<InboxOutcome, AppError> {
    let Some(ApObject::Follow(follow)) = undo.object.as_ref().and_then(ObjectRef::as_object) else {
        tracing::debug!(id = ?undo.id, "Ignoring Undo of something other than an embedded Follow");
        return Ok(InboxOutcome::Ignored);
    };

    if follow.actor_id() != undo.actor_id() {
        return Err(AppError::MalformedActivity(
            "Undo actor does not match the undone Follow".to_string(),
        ));
    }

    state.coordinator.process_follow_action(undo.clone(), true);
    Ok(InboxOutcome::Dispatched)
}

/// Verify the request signature with the key published by the signer.
async fn authenticate(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<ParsedSignature, AppError> {
    let result = verify_request(state, uri, headers, body).await;
    SIGNATURE_VERIFICATIONS
        .with_label_values(&[if result.is_ok() { "success" } else { "failure" }])
        .inc();
    result
}

async fn verify_request(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<ParsedSignature, AppError> {
    let parsed = signature_from_headers(headers)?;

    let signer = state
        .directory
        .get_actor(parsed.actor_url())
        .await
        .map_err(|e| AppError::Authentication(format!("Cannot fetch signing key: {}", e)))?;
    let public_key = ActorDirectory::public_key_for(&signer)?;

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let policy = DatePolicy {
        max_skew_secs: state.config.federation.max_clock_skew_secs,
    };

    verify_signature("POST", path, headers, Some(body), &parsed, &public_key, policy)?;
    Ok(parsed)
}

/// Collection query parameters
#[derive(Debug, Default, Deserialize)]
struct CollectionQuery {
    page: Option<String>,
    min_id: Option<u64>,
}

impl CollectionQuery {
    fn wants_page(&self) -> bool {
        self.page
            .as_deref()
            .is_some_and(|page| page.eq_ignore_ascii_case("true"))
    }
}

async fn collection(
    state: &AppState,
    kind: CollectionKind,
    user: &str,
    query: &CollectionQuery,
) -> Result<Response, AppError> {
    ensure_local_user(state, user).await?;

    let document = if query.wants_page() {
        state.paginator.generate_page(kind, user, query.min_id).await?
    } else {
        state.paginator.generate_collection(kind, user).await?
    };
    activity_json(&document)
}

/// GET /outbox/:user
///
/// Returns the Outbox summary, or one page of Create activities with
/// `page=true`. Only public posts are included.
async fn outbox(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(query): Query<CollectionQuery>,
) -> Result<Response, AppError> {
    collection(&state, CollectionKind::Outbox, &user, &query).await
}

/// GET /followers/:user
async fn followers(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(query): Query<CollectionQuery>,
) -> Result<Response, AppError> {
    collection(&state, CollectionKind::Followers, &user, &query).await
}

/// GET /following/:user
async fn following(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(query): Query<CollectionQuery>,
) -> Result<Response, AppError> {
    collection(&state, CollectionKind::Following, &user, &query).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_flag_is_case_insensitive() {
        let query = CollectionQuery {
            page: Some("TRUE".to_string()),
            min_id: None,
        };
        assert!(query.wants_page());
        assert!(!CollectionQuery::default().wants_page());
        assert!(
            !CollectionQuery {
                page: Some("false".to_string()),
                min_id: Some(3),
            }
            .wants_page()
        );
    }
}
