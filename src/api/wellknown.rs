//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{Handle, generate_webfinger_response};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for local accounts.
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    if !query.resource.starts_with("acct:") {
        return Err(AppError::Validation(
            "Resource must start with 'acct:'".to_string(),
        ));
    }
    let handle = Handle::parse(&query.resource)
        .map_err(|_| AppError::Validation("Invalid acct format".to_string()))?;

    // Domain comparison is case-insensitive; the handle is already lowercased
    if handle.domain != state.local.domain().to_ascii_lowercase() {
        return Err(AppError::NotFound);
    }
    if !state.users.user_exists(&handle.user).await? {
        return Err(AppError::NotFound);
    }

    let jrd = generate_webfinger_response(
        &handle.user,
        state.local.domain(),
        &state.local.actor_url(&handle.user),
        &state.local.profile_url(&handle.user),
    );

    Ok(([(header::CONTENT_TYPE, "application/jrd+json")], Json(jrd)).into_response())
}
