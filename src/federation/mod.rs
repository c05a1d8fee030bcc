//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures
//! - Actor fetching and caching
//! - WebFinger
//! - Signed delivery
//! - Follow/Undo/Accept handshake
//! - Create(Note) construction
//! - Collection paging

pub mod activity;
pub mod actor;
pub mod collection;
pub mod delivery;
pub mod factory;
pub mod follow;
pub mod keys;
pub mod local;
pub mod signature;
pub mod webfinger;

#[cfg(test)]
pub(crate) mod test_support;

pub use activity::{
    ACTIVITY_JSON, ACTIVITY_STREAMS_CONTEXT, Activity, ActivityType, ApObject, Mention, Note,
    ObjectRef, OrderedCollection, OrderedCollectionPage, PUBLIC_COLLECTION,
};
pub use actor::{Actor, ActorCache, ActorDirectory, CacheStats};
pub use collection::{CollectionKind, CollectionPaginator, RemoteActorList, Visit};
pub use delivery::{SecureDelivery, key_id_for};
pub use factory::{ActivityFactory, Audience, create_activity_id};
pub use follow::{FollowCoordinator, FollowReply};
pub use keys::PrivateKeyCache;
pub use local::LocalActors;
pub use signature::{
    DatePolicy, ParsedSignature, SignatureHeaders, generate_digest, key_id_matches_actor,
    parse_signature_header, sign_request, verify_signature,
};
pub use webfinger::{
    Handle, WebFingerResolver, WebFingerResponse, actor_url_from_jrd, generate_webfinger_response,
};
