//! Follow handshake
//!
//! Outbound: resolve the remote handle, send Follow (or Undo(Follow)),
//! record Following once the peer Accepts. Inbound: record or remove the
//! follower and answer with an Accept after the handshake delay.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use super::activity::{Activity, ApObject, ObjectRef};
use super::actor::ActorDirectory;
use super::delivery::SecureDelivery;
use super::local::LocalActors;
use super::webfinger::WebFingerResolver;
use crate::error::AppError;
use crate::store::{FollowRelationship, FriendStore, NewRelationship, UserStore};
use crate::tasks::TaskExecutor;

/// Outcome of an inbound Follow or Undo(Follow)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowReply {
    /// Follower recorded (`created` is false when it already existed)
    Accepted {
        follower: String,
        followed: String,
        created: bool,
    },
    /// Follower removed (`removed` is false when there was nothing to remove)
    Unfollowed {
        follower: String,
        followed: String,
        removed: bool,
    },
}

/// Follow/Undo/Accept state machine
#[derive(Clone)]
pub struct FollowCoordinator {
    local: LocalActors,
    resolver: WebFingerResolver,
    directory: ActorDirectory,
    delivery: SecureDelivery,
    friends: Arc<dyn FriendStore>,
    users: Arc<dyn UserStore>,
    executor: Arc<dyn TaskExecutor>,
    handshake_delay: Duration,
}

impl FollowCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: LocalActors,
        resolver: WebFingerResolver,
        directory: ActorDirectory,
        delivery: SecureDelivery,
        friends: Arc<dyn FriendStore>,
        users: Arc<dyn UserStore>,
        executor: Arc<dyn TaskExecutor>,
        handshake_delay: Duration,
    ) -> Self {
        Self {
            local,
            resolver,
            directory,
            delivery,
            friends,
            users,
            executor,
            handshake_delay,
        }
    }

    /// Send Follow (or Undo(Follow) when `want_follow` is false) from a
    /// local user to a remote handle.
    ///
    /// No relationship is recorded here; Following is recorded when the
    /// peer's Accept arrives. Unfollowing removes any existing record.
    ///
    /// # Returns
    /// The activity that was delivered
    pub async fn set_following(
        &self,
        local_user: &str,
        remote_handle: &str,
        want_follow: bool,
    ) -> Result<ApObject, AppError> {
        if !self.users.user_exists(local_user).await? {
            return Err(AppError::LocalLookup(format!("No such user: {}", local_user)));
        }

        // 1. Resolve handle
        let remote_actor_url = self.resolver.resolve(remote_handle).await?;
        let local_actor_url = self.local.actor_url(local_user);

        // 2. Build Follow, wrapped in Undo when unfollowing
        let follow = ApObject::Follow(Activity::new(
            format!("{}/follow/{}", self.local.base_url(), ulid::Ulid::new()),
            local_actor_url.clone(),
            remote_actor_url.clone(),
        ));
        let activity = if want_follow {
            follow
        } else {
            ApObject::Undo(Activity::new(
                format!("{}/unfollow/{}", self.local.base_url(), ulid::Ulid::new()),
                local_actor_url.clone(),
                follow,
            ))
        }
        .with_context();

        // 3. Target inbox
        let target = self.directory.get_actor(&remote_actor_url).await?;

        // 4. Deliver signed by the local user
        self.delivery
            .deliver_as(local_user, &target.inbox, &local_actor_url, &activity)
            .await?;

        if !want_follow {
            let removed = self.friends.delete(local_user, &target.handle()?).await?;
            tracing::info!(user = %local_user, remote = %remote_actor_url, removed, "Sent Undo(Follow)");
        } else {
            tracing::info!(user = %local_user, remote = %remote_actor_url, "Sent Follow");
        }

        Ok(activity)
    }

    /// Fire-and-forget [`FollowCoordinator::set_following`]; failures are logged.
    pub fn set_following_logged(&self, local_user: &str, remote_handle: &str, want_follow: bool) {
        let coordinator = self.clone();
        let local_user = local_user.to_string();
        let remote_handle = remote_handle.to_string();

        self.executor.execute(
            "set_following",
            Duration::ZERO,
            async move {
                coordinator
                    .set_following(&local_user, &remote_handle, want_follow)
                    .await
                    .map(|_| ())
            }
            .boxed(),
        );
    }

    /// Queue the reply to an inbound Follow, or Undo when `is_undo`.
    ///
    /// The task starts after the handshake delay; its outcome is logged by
    /// the executor.
    pub fn process_follow_action(&self, activity: Activity, is_undo: bool) {
        let coordinator = self.clone();
        self.executor.execute(
            if is_undo { "undo_follow" } else { "follow" },
            self.handshake_delay,
            async move {
                let reply = coordinator.handle_follow_action(&activity, is_undo).await?;
                tracing::info!(?reply, "Follow handshake completed");
                Ok(())
            }
            .boxed(),
        );
    }

    /// Record or remove the follower, then deliver the Accept.
    ///
    /// `activity` is the inbound Follow, or the inbound Undo whose `object`
    /// embeds the Follow being undone.
    pub async fn handle_follow_action(
        &self,
        activity: &Activity,
        is_undo: bool,
    ) -> Result<FollowReply, AppError> {
        // 1. Actor and object
        let follow = if is_undo {
            match activity.object.as_ref().and_then(ObjectRef::as_object) {
                Some(ApObject::Follow(follow)) => follow,
                _ => {
                    return Err(AppError::MalformedActivity(
                        "Undo does not embed a Follow".to_string(),
                    ));
                }
            }
        } else {
            activity
        };

        let follower_url = follow
            .actor_id()
            .or_else(|| activity.actor_id())
            .ok_or_else(|| AppError::MalformedActivity("Follow has no actor".to_string()))?;
        let followed_url = follow
            .object_id()
            .ok_or_else(|| AppError::MalformedActivity("Follow has no object".to_string()))?;

        // 2. Follower's actor document
        let follower = self.directory.get_actor(follower_url).await?;
        let follower_name = follower.handle()?;

        // 3. Followed local user
        let followed_user = self.local.user_from_actor_url(followed_url).ok_or_else(|| {
            AppError::LocalLookup(format!("Not a local actor: {}", followed_url))
        })?;
        if !self.users.user_exists(&followed_user).await? {
            return Err(AppError::LocalLookup(format!("No such user: {}", followed_user)));
        }
        let followed_actor_url = self.local.actor_url(&followed_user);

        // 4. Relationship
        let reply = if is_undo {
            let removed = self.friends.delete(&follower_name, &followed_user).await?;
            FollowReply::Unfollowed {
                follower: follower_name,
                followed: followed_user.clone(),
                removed,
            }
        } else {
            let (_, created) = self
                .friends
                .find_or_create(NewRelationship {
                    follower: follower_name.clone(),
                    followed: followed_user.clone(),
                    follower_actor_url: follower.id.clone(),
                    followed_actor_url: followed_actor_url.clone(),
                    profile_url: follower.profile_url().to_string(),
                })
                .await?;
            FollowReply::Accepted {
                follower: follower_name,
                followed: followed_user.clone(),
                created,
            }
        };

        // 5-7. Accept, signed by the followed user
        let accepted = Activity {
            id: if is_undo {
                activity.id.clone()
            } else {
                follow.id.clone()
            },
            actor: Some(ObjectRef::Link(follower.id.clone())),
            object: Some(ObjectRef::Link(followed_actor_url.clone())),
            ..Default::default()
        };
        let accept = ApObject::Accept(Activity {
            id: Some(format!("{}/accept/{}", self.local.base_url(), ulid::Ulid::new())),
            actor: Some(ObjectRef::Link(followed_actor_url.clone())),
            summary: Some(format!(
                "Accepted {} request",
                if is_undo { "unfollow" } else { "follow" }
            )),
            object: Some(if is_undo {
                ApObject::Undo(accepted).into()
            } else {
                ApObject::Follow(accepted).into()
            }),
            ..Default::default()
        })
        .with_context();

        self.delivery
            .deliver_as(&followed_user, &follower.inbox, &followed_actor_url, &accept)
            .await?;

        Ok(reply)
    }

    /// Record Following when a peer accepts one of our Follows.
    ///
    /// # Returns
    /// The relationship, or `None` when the Accept is not for a Follow this
    /// server can attribute to a local user.
    pub async fn process_accept(
        &self,
        accept: &Activity,
    ) -> Result<Option<FollowRelationship>, AppError> {
        let accepting_actor = accept
            .actor_id()
            .ok_or_else(|| AppError::MalformedActivity("Accept has no actor".to_string()))?;

        let Some(ApObject::Follow(follow)) = accept.object.as_ref().and_then(ObjectRef::as_object)
        else {
            tracing::debug!(actor = %accepting_actor, "Ignoring Accept without embedded Follow");
            return Ok(None);
        };

        let Some(local_user) = follow
            .actor_id()
            .and_then(|actor| self.local.user_from_actor_url(actor))
        else {
            tracing::debug!(actor = %accepting_actor, "Ignoring Accept for a non-local follower");
            return Ok(None);
        };

        let followed_url = follow
            .object_id()
            .ok_or_else(|| AppError::MalformedActivity("Accepted Follow has no object".to_string()))?;
        if followed_url != accepting_actor {
            return Err(AppError::MalformedActivity(format!(
                "{} accepted a Follow of {}",
                accepting_actor, followed_url
            )));
        }

        if !self.users.user_exists(&local_user).await? {
            return Err(AppError::LocalLookup(format!("No such user: {}", local_user)));
        }

        let followed = self.directory.get_actor(followed_url).await?;
        let (relationship, created) = self
            .friends
            .find_or_create(NewRelationship {
                follower: local_user.clone(),
                followed: followed.handle()?,
                follower_actor_url: self.local.actor_url(&local_user),
                followed_actor_url: followed.id.clone(),
                profile_url: followed.profile_url().to_string(),
            })
            .await?;

        tracing::info!(user = %local_user, followed = %followed.id, created, "Follow accepted");
        Ok(Some(relationship))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::test_support::{FakePeer, TestEngine};
    use serde_json::json;

    fn coordinator(engine: &TestEngine) -> FollowCoordinator {
        FollowCoordinator::new(
            engine.local.clone(),
            engine.resolver.clone(),
            engine.directory.clone(),
            engine.delivery.clone(),
            engine.friends.clone(),
            engine.users.clone(),
            Arc::new(engine.tasks.clone()),
            Duration::ZERO,
        )
    }

    fn inbound_follow(peer: &FakePeer) -> Activity {
        serde_json::from_value(json!({
            "id": format!("{}/follows/1", peer.base),
            "actor": peer.actor_url("bob"),
            "object": "https://local.example/actor/alice"
        }))
        .unwrap()
    }

    fn inbound_undo(peer: &FakePeer) -> Activity {
        serde_json::from_value(json!({
            "id": format!("{}/undo/1", peer.base),
            "actor": peer.actor_url("bob"),
            "object": {
                "type": "Follow",
                "id": format!("{}/follows/1", peer.base),
                "actor": peer.actor_url("bob"),
                "object": "https://local.example/actor/alice"
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn inbound_follow_records_follower_and_sends_accept() {
        let peer = FakePeer::spawn(&["bob"]).await;
        let engine = TestEngine::new(&["alice"]).await;
        let coordinator = coordinator(&engine);

        let reply = coordinator
            .handle_follow_action(&inbound_follow(&peer), false)
            .await
            .unwrap();

        let bob = peer.handle("bob");
        assert_eq!(
            reply,
            FollowReply::Accepted {
                follower: bob.clone(),
                followed: "alice".to_string(),
                created: true
            }
        );

        let relationship = engine.friends.find(&bob, "alice").await.unwrap().unwrap();
        assert_eq!(relationship.follower_actor_url, peer.actor_url("bob"));
        assert_eq!(relationship.profile_url, format!("{}/@bob", peer.base));

        let received = peer.received("bob").await;
        assert_eq!(received.len(), 1);
        let accept = &received[0];
        assert_eq!(accept["type"], "Accept");
        assert_eq!(accept["summary"], "Accepted follow request");
        assert_eq!(accept["actor"], "https://local.example/actor/alice");
        assert_eq!(accept["object"]["type"], "Follow");
        assert_eq!(accept["object"]["id"], format!("{}/follows/1", peer.base));
        assert_eq!(accept["object"]["actor"], peer.actor_url("bob"));
        assert_eq!(accept["object"]["object"], "https://local.example/actor/alice");
    }

    #[tokio::test]
    async fn follow_then_undo_converges_and_second_undo_is_noop() {
        let peer = FakePeer::spawn(&["bob"]).await;
        let engine = TestEngine::new(&["alice"]).await;
        let coordinator = coordinator(&engine);
        let bob = peer.handle("bob");

        for _ in 0..2 {
            coordinator
                .handle_follow_action(&inbound_follow(&peer), false)
                .await
                .unwrap();
        }
        assert_eq!(engine.friends.count_followers("alice").await.unwrap(), 1);

        let first_undo = coordinator
            .handle_follow_action(&inbound_undo(&peer), true)
            .await
            .unwrap();
        assert!(matches!(first_undo, FollowReply::Unfollowed { removed: true, .. }));
        assert!(engine.friends.find(&bob, "alice").await.unwrap().is_none());

        let second_undo = coordinator
            .handle_follow_action(&inbound_undo(&peer), true)
            .await
            .unwrap();
        assert!(matches!(second_undo, FollowReply::Unfollowed { removed: false, .. }));
        assert!(engine.friends.find(&bob, "alice").await.unwrap().is_none());

        let received = peer.received("bob").await;
        assert_eq!(received.len(), 4);
        assert_eq!(received[3]["summary"], "Accepted unfollow request");
        assert_eq!(received[3]["object"]["type"], "Undo");
    }

    #[tokio::test]
    async fn follow_without_object_is_malformed() {
        let peer = FakePeer::spawn(&["bob"]).await;
        let engine = TestEngine::new(&["alice"]).await;
        let mut follow = inbound_follow(&peer);
        follow.object = None;

        let result = coordinator(&engine).handle_follow_action(&follow, false).await;
        assert!(matches!(result, Err(AppError::MalformedActivity(_))));
        assert!(peer.received("bob").await.is_empty());
    }

    #[tokio::test]
    async fn follow_of_non_local_actor_is_local_lookup_failure() {
        let peer = FakePeer::spawn(&["bob"]).await;
        let engine = TestEngine::new(&["alice"]).await;
        let mut follow = inbound_follow(&peer);
        follow.object = Some(ObjectRef::Link("https://elsewhere.example/actor/alice".to_string()));

        let result = coordinator(&engine).handle_follow_action(&follow, false).await;
        assert!(matches!(result, Err(AppError::LocalLookup(_))));
        assert_eq!(engine.friends.count_followers("alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unresolvable_follower_creates_nothing() {
        let peer = FakePeer::spawn(&["bob"]).await;
        let engine = TestEngine::new(&["alice"]).await;
        let mut follow = inbound_follow(&peer);
        follow.actor = Some(ObjectRef::Link(peer.actor_url("ghost")));

        let result = coordinator(&engine).handle_follow_action(&follow, false).await;
        assert!(matches!(result, Err(AppError::Resolution(_))));
        assert_eq!(engine.friends.count_followers("alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn process_follow_action_runs_on_the_executor() {
        let peer = FakePeer::spawn(&["bob"]).await;
        let engine = TestEngine::new(&["alice"]).await;

        coordinator(&engine).process_follow_action(inbound_follow(&peer), false);
        engine.tasks.wait_idle().await;

        assert_eq!(engine.friends.count_followers("alice").await.unwrap(), 1);
        assert_eq!(peer.received("bob").await.len(), 1);
    }

    #[tokio::test]
    async fn set_following_sends_follow_then_accept_records_following() {
        let peer = FakePeer::spawn(&["bob"]).await;
        let engine = TestEngine::new(&["alice"]).await;
        let coordinator = coordinator(&engine);

        let sent = coordinator
            .set_following("alice", &peer.handle("bob"), true)
            .await
            .unwrap();
        assert_eq!(engine.friends.count_following("alice").await.unwrap(), 0);

        let received = peer.received("bob").await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["type"], "Follow");
        assert_eq!(received[0]["actor"], "https://local.example/actor/alice");
        assert_eq!(received[0]["object"], peer.actor_url("bob"));
        assert!(
            received[0]["id"]
                .as_str()
                .unwrap()
                .starts_with("https://local.example/follow/")
        );

        let accept = Activity {
            actor: Some(ObjectRef::Link(peer.actor_url("bob"))),
            object: Some(sent.into()),
            ..Default::default()
        };
        let relationship = coordinator.process_accept(&accept).await.unwrap().unwrap();
        assert_eq!(relationship.follower, "alice");
        assert_eq!(relationship.followed, peer.handle("bob"));
        assert_eq!(engine.friends.count_following("alice").await.unwrap(), 1);

        // Unfollow removes the record and wraps the Follow in Undo.
        let undo = coordinator
            .set_following("alice", &peer.handle("bob"), false)
            .await
            .unwrap();
        assert!(matches!(
            undo.as_activity().and_then(|a| a.object.as_ref()).and_then(ObjectRef::as_object),
            Some(ApObject::Follow(_))
        ));
        assert_eq!(engine.friends.count_following("alice").await.unwrap(), 0);
        let received = peer.received("bob").await;
        assert_eq!(received[1]["type"], "Undo");
        assert!(
            received[1]["id"]
                .as_str()
                .unwrap()
                .starts_with("https://local.example/unfollow/")
        );
    }

    #[tokio::test]
    async fn set_following_unknown_handle_fails_with_resolution() {
        let peer = FakePeer::spawn(&["bob"]).await;
        let engine = TestEngine::new(&["alice"]).await;

        let result = coordinator(&engine)
            .set_following("alice", &peer.handle("nobody"), true)
            .await;
        assert!(matches!(result, Err(AppError::Resolution(_))));
        assert!(peer.received("nobody").await.is_empty());
    }

    #[tokio::test]
    async fn set_following_logged_delivers_in_the_background() {
        let peer = FakePeer::spawn(&["bob"]).await;
        let engine = TestEngine::new(&["alice"]).await;
        let coordinator = coordinator(&engine);

        coordinator.set_following_logged("alice", &peer.handle("bob"), true);
        coordinator.set_following_logged("alice", &peer.handle("nobody"), true);
        engine.tasks.wait_idle().await;

        let received = peer.received("bob").await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["type"], "Follow");
        assert_eq!(received[0]["object"], peer.actor_url("bob"));
        assert!(peer.received("nobody").await.is_empty());
        assert_eq!(engine.tasks.pending(), 0);
    }

    #[tokio::test]
    async fn accept_from_a_different_actor_is_rejected() {
        let peer = FakePeer::spawn(&["bob", "eve"]).await;
        let engine = TestEngine::new(&["alice"]).await;

        let follow = ApObject::Follow(Activity::new(
            "https://local.example/follow/1",
            "https://local.example/actor/alice",
            peer.actor_url("bob"),
        ));
        let accept = Activity {
            actor: Some(ObjectRef::Link(peer.actor_url("eve"))),
            object: Some(follow.into()),
            ..Default::default()
        };

        let result = coordinator(&engine).process_accept(&accept).await;
        assert!(matches!(result, Err(AppError::MalformedActivity(_))));
        assert_eq!(engine.friends.count_following("alice").await.unwrap(), 0);
    }
}
