//! Local URL scheme
//!
//! Every URL this server hands out for a local user is built here, and
//! inbound URLs are mapped back to user names here.

use serde_json::{Map, Value, json};

use super::activity::ACTIVITY_STREAMS_CONTEXT;
use super::actor::{Actor, ActorEndpoints, ActorPublicKey};
use super::delivery::key_id_for;

/// URL builder for local actors
#[derive(Debug, Clone)]
pub struct LocalActors {
    /// `protocol://domain`, no trailing slash
    base_url: String,
    /// Public domain, with port when non-default
    domain: String,
}

impl LocalActors {
    pub fn new(base_url: impl Into<String>, domain: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            domain: domain.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn actor_url(&self, user: &str) -> String {
        format!("{}/actor/{}", self.base_url, user)
    }

    pub fn inbox_url(&self, user: &str) -> String {
        format!("{}/inbox/{}", self.base_url, user)
    }

    pub fn shared_inbox_url(&self) -> String {
        format!("{}/inbox", self.base_url)
    }

    pub fn outbox_url(&self, user: &str) -> String {
        format!("{}/outbox/{}", self.base_url, user)
    }

    pub fn followers_url(&self, user: &str) -> String {
        format!("{}/followers/{}", self.base_url, user)
    }

    pub fn following_url(&self, user: &str) -> String {
        format!("{}/following/{}", self.base_url, user)
    }

    /// Profile link; the server answers it with a redirect to the actor
    pub fn profile_url(&self, user: &str) -> String {
        format!("{}/profile/{}", self.base_url, user)
    }

    /// `user@domain`
    pub fn handle(&self, user: &str) -> String {
        format!("{}@{}", user, self.domain)
    }

    /// Map a local actor URL back to its user name.
    ///
    /// A trailing slash and a `#fragment` are tolerated.
    pub fn user_from_actor_url(&self, url: &str) -> Option<String> {
        let url = url.split('#').next().unwrap_or(url);
        let rest = url
            .strip_prefix(&self.base_url)?
            .strip_prefix("/actor/")?
            .trim_end_matches('/');

        if rest.is_empty() || rest.contains(['/', '?']) {
            return None;
        }
        Some(rest.to_string())
    }

    pub fn is_local_actor(&self, url: &str) -> bool {
        self.user_from_actor_url(url).is_some()
    }

    /// Actor document for a local user
    pub fn actor_document(&self, user: &str, public_key_pem: &str) -> Actor {
        let actor_url = self.actor_url(user);

        let mut extra = Map::new();
        extra.insert("manuallyApprovesFollowers".to_string(), Value::Bool(false));

        Actor {
            context: Some(json!([
                ACTIVITY_STREAMS_CONTEXT,
                "https://w3id.org/security/v1"
            ])),
            id: actor_url.clone(),
            actor_type: "Person".to_string(),
            inbox: self.inbox_url(user),
            outbox: Some(self.outbox_url(user)),
            followers: Some(self.followers_url(user)),
            following: Some(self.following_url(user)),
            shared_inbox: None,
            endpoints: Some(ActorEndpoints {
                shared_inbox: Some(self.shared_inbox_url()),
                extra: Map::new(),
            }),
            preferred_username: Some(user.to_string()),
            name: Some(user.to_string()),
            url: Some(Value::String(self.profile_url(user))),
            public_key: Some(ActorPublicKey {
                id: key_id_for(&actor_url),
                owner: actor_url,
                public_key_pem: public_key_pem.to_string(),
            }),
            extra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> LocalActors {
        LocalActors::new("https://local.example/", "local.example")
    }

    #[test]
    fn urls_share_the_base() {
        let local = local();
        assert_eq!(local.actor_url("alice"), "https://local.example/actor/alice");
        assert_eq!(local.inbox_url("alice"), "https://local.example/inbox/alice");
        assert_eq!(local.shared_inbox_url(), "https://local.example/inbox");
        assert_eq!(
            local.followers_url("alice"),
            "https://local.example/followers/alice"
        );
        assert_eq!(local.handle("alice"), "alice@local.example");
        assert_eq!(local.profile_url("alice"), "https://local.example/profile/alice");
    }

    #[test]
    fn user_from_actor_url_accepts_only_local_actor_urls() {
        let local = local();
        assert_eq!(
            local.user_from_actor_url("https://local.example/actor/alice"),
            Some("alice".to_string())
        );
        assert_eq!(
            local.user_from_actor_url("https://local.example/actor/alice/#main-key"),
            Some("alice".to_string())
        );
        assert_eq!(local.user_from_actor_url("https://remote.example/actor/alice"), None);
        assert_eq!(local.user_from_actor_url("https://local.example/outbox/alice"), None);
        assert_eq!(local.user_from_actor_url("https://local.example/actor/"), None);
        assert_eq!(local.user_from_actor_url("https://local.example/actor/a/b"), None);
        assert!(!local.is_local_actor("https://local.example.evil/actor/alice"));
    }

    #[test]
    fn actor_document_publishes_key_and_collections() {
        let actor = local().actor_document("alice", "PEM");
        let value = serde_json::to_value(&actor).unwrap();

        assert_eq!(value["type"], "Person");
        assert_eq!(value["preferredUsername"], "alice");
        assert_eq!(value["publicKey"]["id"], "https://local.example/actor/alice#main-key");
        assert_eq!(value["publicKey"]["publicKeyPem"], "PEM");
        assert_eq!(value["endpoints"]["sharedInbox"], "https://local.example/inbox");
        assert_eq!(value["manuallyApprovesFollowers"], false);
        assert_eq!(value["url"], "https://local.example/profile/alice");
    }
}
