//! Outbound activity construction
//!
//! Builds Create(Note) activities and computes their audience.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use super::activity::{Activity, ApObject, Mention, Note, ObjectRef, PUBLIC_COLLECTION};
use super::actor::{ActorDirectory, handle_from_actor_url};
use super::local::LocalActors;
use super::webfinger::WebFingerResolver;
use crate::store::LocalPost;

/// `to`/`cc` lists of a post
///
/// `to`/`cc` are the Note's addressing. The Create envelope shares `cc` but
/// addresses `envelope_to`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Audience {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub envelope_to: Vec<String>,
}

impl Audience {
    /// Public notes address the public marker and copy recipients and the
    /// author's followers; the envelope addresses the recipients plus the
    /// public marker. Private posts address only the recipients, in both.
    pub fn compute(recipients: Vec<String>, followers_url: Option<String>, is_private: bool) -> Self {
        if is_private {
            return Self {
                to: recipients.clone(),
                cc: Vec::new(),
                envelope_to: recipients,
            };
        }

        let mut envelope_to = recipients.clone();
        envelope_to.push(PUBLIC_COLLECTION.to_string());

        let mut cc = recipients;
        if let Some(followers_url) = followers_url {
            cc.push(followers_url);
        }
        Self {
            to: vec![PUBLIC_COLLECTION.to_string()],
            cc,
            envelope_to,
        }
    }
}

/// Create activity id: the note URL with an `apCreateTime` query parameter
pub fn create_activity_id(note_url: &str, created_at: DateTime<Utc>) -> String {
    let separator = if note_url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}apCreateTime={}",
        note_url,
        separator,
        created_at.timestamp_millis()
    )
}

/// Builds outbound activities
#[derive(Clone)]
pub struct ActivityFactory {
    local: LocalActors,
    resolver: WebFingerResolver,
    directory: ActorDirectory,
}

impl ActivityFactory {
    pub fn new(local: LocalActors, resolver: WebFingerResolver, directory: ActorDirectory) -> Self {
        Self {
            local,
            resolver,
            directory,
        }
    }

    /// Build a Create(Note) addressed to `recipients` (account handles).
    ///
    /// Handles that fail to resolve are logged and left out; they never
    /// fail the whole post.
    #[allow(clippy::too_many_arguments)]
    pub async fn new_note_create_activity(
        &self,
        recipients: &[String],
        from_actor: &str,
        in_reply_to: Option<&str>,
        content: &str,
        note_url: &str,
        is_private: bool,
        attachments: Vec<Value>,
    ) -> ApObject {
        let mut actor_urls = Vec::with_capacity(recipients.len());
        let mut mentions = Vec::with_capacity(recipients.len());

        for handle in recipients {
            let handle = handle.trim().trim_start_matches('@');
            match self.resolver.resolve(handle).await {
                Ok(actor_url) => {
                    mentions.push(ObjectRef::from(ApObject::Mention(Mention::new(
                        actor_url.clone(),
                        format!("@{}", handle),
                    ))));
                    actor_urls.push(actor_url);
                }
                Err(error) => {
                    tracing::warn!(recipient = %handle, %error, "Skipping unresolvable recipient");
                }
            }
        }

        let followers_url = if is_private {
            None
        } else {
            self.followers_url_of(from_actor).await
        };
        let audience = Audience::compute(actor_urls, followers_url, is_private);

        build_create(
            NoteParts {
                from_actor,
                note_url,
                content,
                in_reply_to,
                tag: mentions,
                attachment: attachments.into_iter().map(ObjectRef::Unknown).collect(),
            },
            audience,
            Utc::now(),
        )
    }

    /// Create(Note) for a stored local post, as served from the outbox.
    ///
    /// Recipients of stored posts are actor URLs already; no lookups are made.
    pub fn create_for_post(&self, post: &LocalPost) -> ApObject {
        let from_actor = self.local.actor_url(&post.author);
        let followers_url = (!post.is_private).then(|| self.local.followers_url(&post.author));
        let audience = Audience::compute(post.recipients.clone(), followers_url, post.is_private);
        let tag = post
            .recipients
            .iter()
            .map(|href| {
                let name = match handle_from_actor_url(href, None) {
                    Ok(handle) => format!("@{}", handle),
                    Err(_) => href.clone(),
                };
                ObjectRef::from(ApObject::Mention(Mention::new(href.clone(), name)))
            })
            .collect();

        build_create(
            NoteParts {
                from_actor: &from_actor,
                note_url: &post.url,
                content: &post.content,
                in_reply_to: post.in_reply_to.as_deref(),
                tag,
                attachment: post.attachments.iter().cloned().map(ObjectRef::Unknown).collect(),
            },
            audience,
            post.published,
        )
    }

    /// Author's followers collection: the cached actor document first, then
    /// the local URL scheme for local authors.
    async fn followers_url_of(&self, from_actor: &str) -> Option<String> {
        if let Some(actor) = self.directory.cached_actor(from_actor).await {
            if let Some(followers) = &actor.followers {
                return Some(followers.clone());
            }
        }
        self.local
            .user_from_actor_url(from_actor)
            .map(|user| self.local.followers_url(&user))
    }
}

struct NoteParts<'a> {
    from_actor: &'a str,
    note_url: &'a str,
    content: &'a str,
    in_reply_to: Option<&'a str>,
    tag: Vec<ObjectRef>,
    attachment: Vec<ObjectRef>,
}

fn build_create(parts: NoteParts<'_>, audience: Audience, published: DateTime<Utc>) -> ApObject {
    let published_str = published.to_rfc3339_opts(SecondsFormat::Secs, true);

    let note = Note {
        id: Some(parts.note_url.to_string()),
        url: Some(parts.note_url.to_string()),
        published: Some(published_str.clone()),
        attributed_to: Some(parts.from_actor.to_string()),
        sensitive: Some(false),
        content: Some(parts.content.to_string()),
        in_reply_to: parts.in_reply_to.map(str::to_string),
        to: audience.to,
        cc: audience.cc.clone(),
        tag: parts.tag,
        attachment: parts.attachment,
        ..Default::default()
    };

    ApObject::Create(Activity {
        id: Some(create_activity_id(parts.note_url, published)),
        actor: Some(ObjectRef::Link(parts.from_actor.to_string())),
        object: Some(ApObject::Note(note).into()),
        published: Some(published_str),
        to: audience.envelope_to,
        cc: audience.cc,
        ..Default::default()
    })
    .with_context()
}
