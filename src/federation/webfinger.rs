//! WebFinger protocol implementation
//!
//! Used to discover ActivityPub actor URIs from addresses, and to answer
//! discovery requests for local users.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::activity::ACTIVITY_JSON;
use super::actor::{Actor, ActorDirectory, is_activity_json};
use crate::error::AppError;

/// Account handle split into user and domain (`domain` may carry a port)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub user: String,
    pub domain: String,
}

impl Handle {
    /// Parse `user@domain`, `@user@domain` or `acct:user@domain`.
    pub fn parse(handle: &str) -> Result<Self, AppError> {
        let trimmed = handle.trim();
        let bare = trimmed.strip_prefix("acct:").unwrap_or(trimmed);
        let bare = bare.strip_prefix('@').unwrap_or(bare);

        let (user, domain) = bare
            .split_once('@')
            .ok_or_else(|| AppError::Resolution(format!("Malformed handle: {}", handle)))?;

        let valid_domain = !domain.is_empty()
            && !domain.contains(['@', '/', '?', '#'])
            && !domain.chars().any(char::is_whitespace);
        if user.is_empty() || !valid_domain {
            return Err(AppError::Resolution(format!("Malformed handle: {}", handle)));
        }

        Ok(Self {
            user: user.to_string(),
            domain: domain.to_ascii_lowercase(),
        })
    }

    pub fn acct(&self) -> String {
        format!("acct:{}@{}", self.user, self.domain)
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.domain)
    }
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Actor URL advertised by a JRD: the `self` link with an ActivityPub type
pub fn actor_url_from_jrd(jrd: &WebFingerResponse) -> Option<&str> {
    jrd.links
        .iter()
        .filter(|link| link.rel == "self")
        .filter(|link| link.link_type.as_deref().is_some_and(is_activity_json))
        .find_map(|link| link.href.as_deref())
}

/// Generate WebFinger response for a local account.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `actor_url` - The user's actor document URL
/// * `profile_url` - The user's human-facing page
pub fn generate_webfinger_response(
    username: &str,
    domain: &str,
    actor_url: &str,
    profile_url: &str,
) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_url.to_string()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some(ACTIVITY_JSON.to_string()),
                href: Some(actor_url.to_string()),
                template: None,
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(profile_url.to_string()),
                template: None,
            },
        ],
    }
}

/// Resolves account handles to actor URLs
#[derive(Clone)]
pub struct WebFingerResolver {
    http_client: reqwest::Client,
    /// "https" in production
    scheme: String,
    directory: ActorDirectory,
}

impl WebFingerResolver {
    pub fn new(http_client: reqwest::Client, scheme: impl Into<String>, directory: ActorDirectory) -> Self {
        Self {
            http_client,
            scheme: scheme.into(),
            directory,
        }
    }

    /// Resolve an address to its ActivityPub actor URL
    ///
    /// # Errors
    /// `AppError::Resolution` for malformed handles, network errors,
    /// malformed JRD documents and JRDs without an actor link.
    ///
    /// # Example
    /// ```ignore
    /// let actor_url = resolver.resolve("user@mastodon.social").await?;
    /// ```
    pub async fn resolve(&self, handle: &str) -> Result<String, AppError> {
        let handle = Handle::parse(handle)?;
        let url = format!(
            "{}://{}/.well-known/webfinger?resource={}",
            self.scheme,
            handle.domain,
            urlencoding::encode(&handle.acct())
        );

        tracing::debug!(%handle, %url, "WebFinger lookup");

        let response = self
            .http_client
            .get(&url)
            .header("Accept", "application/jrd+json, application/json")
            .send()
            .await
            .map_err(|e| AppError::Resolution(format!("WebFinger request for {} failed: {}", handle, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Resolution(format!(
                "WebFinger lookup for {} failed: HTTP {}",
                handle,
                response.status()
            )));
        }

        let jrd: WebFingerResponse = response
            .json()
            .await
            .map_err(|e| AppError::Resolution(format!("Malformed JRD for {}: {}", handle, e)))?;

        actor_url_from_jrd(&jrd).map(str::to_string).ok_or_else(|| {
            AppError::Resolution(format!("No ActivityPub self link for {}", handle))
        })
    }

    /// Resolve a handle and load its actor document.
    pub async fn resolve_actor(&self, handle: &str) -> Result<Arc<Actor>, AppError> {
        let actor_url = self.resolve(handle).await?;
        self.directory.get_actor(&actor_url).await
    }

    /// Resolve many handles, skipping those that fail.
    pub async fn resolve_all(&self, handles: &[String]) -> Vec<(String, String)> {
        let mut resolved = Vec::with_capacity(handles.len());
        for handle in handles {
            match self.resolve(handle).await {
                Ok(actor_url) => resolved.push((handle.clone(), actor_url)),
                Err(error) => {
                    tracing::warn!(%handle, %error, "Skipping unresolvable handle");
                }
            }
        }
        resolved
    }
}
