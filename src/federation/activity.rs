//! Activity envelopes
//!
//! A closed set of ActivityStreams object types. Every variant keeps the
//! properties it does not model in an `extra` map so peers' nonstandard
//! fields survive a parse/serialize cycle.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// JSON-LD context sent on every top-level envelope
pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Audience marker for public addressing
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Content type for ActivityPub requests and responses
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// ActivityPub object types handled by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityType {
    Follow,
    Undo,
    Accept,
    Create,
    Note,
    OrderedCollection,
    OrderedCollectionPage,
    Mention,
}

impl ActivityType {
    /// Parse activity type from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Follow" => Some(Self::Follow),
            "Undo" => Some(Self::Undo),
            "Accept" => Some(Self::Accept),
            "Create" => Some(Self::Create),
            "Note" => Some(Self::Note),
            "OrderedCollection" => Some(Self::OrderedCollection),
            "OrderedCollectionPage" => Some(Self::OrderedCollectionPage),
            "Mention" => Some(Self::Mention),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "Follow",
            Self::Undo => "Undo",
            Self::Accept => "Accept",
            Self::Create => "Create",
            Self::Note => "Note",
            Self::OrderedCollection => "OrderedCollection",
            Self::OrderedCollectionPage => "OrderedCollectionPage",
            Self::Mention => "Mention",
        }
    }
}

/// A typed ActivityStreams object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ApObject {
    Follow(Activity),
    Undo(Activity),
    Accept(Activity),
    Create(Activity),
    Note(Note),
    OrderedCollection(OrderedCollection),
    OrderedCollectionPage(OrderedCollectionPage),
    Mention(Mention),
}

impl ApObject {
    pub fn kind(&self) -> ActivityType {
        match self {
            ApObject::Follow(_) => ActivityType::Follow,
            ApObject::Undo(_) => ActivityType::Undo,
            ApObject::Accept(_) => ActivityType::Accept,
            ApObject::Create(_) => ActivityType::Create,
            ApObject::Note(_) => ActivityType::Note,
            ApObject::OrderedCollection(_) => ActivityType::OrderedCollection,
            ApObject::OrderedCollectionPage(_) => ActivityType::OrderedCollectionPage,
            ApObject::Mention(_) => ActivityType::Mention,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            ApObject::Follow(a) | ApObject::Undo(a) | ApObject::Accept(a) | ApObject::Create(a) => {
                a.id.as_deref()
            }
            ApObject::Note(note) => note.id.as_deref(),
            ApObject::OrderedCollection(c) => c.id.as_deref(),
            ApObject::OrderedCollectionPage(p) => p.id.as_deref(),
            ApObject::Mention(m) => Some(&m.href),
        }
    }

    /// The activity body for Follow, Undo, Accept and Create.
    pub fn as_activity(&self) -> Option<&Activity> {
        match self {
            ApObject::Follow(a) | ApObject::Undo(a) | ApObject::Accept(a) | ApObject::Create(a) => {
                Some(a)
            }
            _ => None,
        }
    }

    /// Set `@context` on the top-level envelope.
    pub fn with_context(mut self) -> Self {
        let context = Some(Value::String(ACTIVITY_STREAMS_CONTEXT.to_string()));
        match &mut self {
            ApObject::Follow(a) | ApObject::Undo(a) | ApObject::Accept(a) | ApObject::Create(a) => {
                a.context = context
            }
            ApObject::Note(note) => note.context = context,
            ApObject::OrderedCollection(c) => c.context = context,
            ApObject::OrderedCollectionPage(p) => p.context = context,
            ApObject::Mention(_) => {}
        }
        self
    }
}

/// Reference to another object: a bare URL, an embedded known object, or
/// anything else a peer sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Link(String),
    Object(Box<ApObject>),
    Unknown(Value),
}

impl ObjectRef {
    /// URL of the referenced object, if it has one
    pub fn id(&self) -> Option<&str> {
        match self {
            ObjectRef::Link(url) => Some(url),
            ObjectRef::Object(object) => object.id(),
            ObjectRef::Unknown(value) => value.get("id").and_then(Value::as_str),
        }
    }

    pub fn as_object(&self) -> Option<&ApObject> {
        match self {
            ObjectRef::Object(object) => Some(object),
            _ => None,
        }
    }
}

impl From<String> for ObjectRef {
    fn from(url: String) -> Self {
        ObjectRef::Link(url)
    }
}

impl From<&str> for ObjectRef {
    fn from(url: &str) -> Self {
        ObjectRef::Link(url.to_string())
    }
}

impl From<ApObject> for ObjectRef {
    fn from(object: ApObject) -> Self {
        ObjectRef::Object(Box::new(object))
    }
}

/// Body shared by Follow, Undo, Accept and Create
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "@context", skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<ObjectRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub to: Vec<String>,
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub cc: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Activity {
    pub fn new(id: impl Into<String>, actor: impl Into<String>, object: impl Into<ObjectRef>) -> Self {
        Self {
            id: Some(id.into()),
            actor: Some(ObjectRef::Link(actor.into())),
            object: Some(object.into()),
            ..Default::default()
        }
    }

    /// URL of the `actor`, whether given as a string or an embedded `{id}`.
    pub fn actor_id(&self) -> Option<&str> {
        self.actor.as_ref().and_then(ObjectRef::id)
    }

    /// URL of the `object`, whether given as a string or an embedded `{id}`.
    pub fn object_id(&self) -> Option<&str> {
        self.object.as_ref().and_then(ObjectRef::id)
    }
}

/// A short text post
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(rename = "@context", skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributed_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Serialized as `null` when absent, as peers expect the key
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub to: Vec<String>,
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub cc: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub tag: Vec<ObjectRef>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub attachment: Vec<ObjectRef>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Tag naming an addressed actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub href: String,
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Mention {
    pub fn new(href: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            name: name.into(),
            extra: Map::new(),
        }
    }
}

/// Collection summary pointing at its first and last pages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedCollection {
    #[serde(rename = "@context", skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_items: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first: Option<ObjectRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<ObjectRef>,
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub ordered_items: Vec<ObjectRef>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One page of an ordered collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedCollectionPage {
    #[serde(rename = "@context", skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_items: Option<u64>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub ordered_items: Vec<ObjectRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<ObjectRef>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Accept a single value or an array; `null` and absence give an empty list.
pub(crate) fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::Many(items)) => items,
        Some(OneOrMany::One(item)) => vec![item],
    })
}
