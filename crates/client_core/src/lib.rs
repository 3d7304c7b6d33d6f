//! Client-side room synchronization and interaction engine.
//!
//! A [`RoomSession`] owns one room's state: the message cache, the periodic
//! sync loop, the compose pipeline, and the presence/interaction layers on
//! top. Sessions are plain owned values wired together from injected
//! collaborators, so concurrent rooms and tests never share hidden state.

use std::sync::Arc;

use chrono::{DateTime, Duration as TimeDelta, Utc};
use room_crypto::{DecryptOutcome, RoomKey, SchemeVersion};
use shared::{
    domain::{DeliveryState, RoomId, UserId},
    protocol::MessageRecord,
};
use tokio::sync::broadcast;

pub mod api;
pub mod attachments;
pub mod auth;
pub mod compose;
pub mod directory;
pub mod error;
pub mod interactions;
pub mod presence;
pub mod reply;
pub mod scheduler;
pub mod store;

pub use api::RoomApi;
pub use attachments::AttachmentPipeline;
pub use auth::{Credential, CredentialProvider, SessionAuth};
pub use compose::{ComposeController, ComposeIntent};
pub use directory::RoomDirectory;
pub use error::{ApiFailure, AttachmentError, AuthError, ComposeError};
pub use interactions::InteractionAggregator;
pub use presence::PresenceSignal;
pub use reply::{ReplyPreview, ReplyResolver, ReplyTarget};
pub use scheduler::{CursorStore, HttpPageFetcher, MemoryCursorStore, PageFetcher, SyncScheduler};
pub use store::{CachedMessage, MessageStore};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Rendered in place of a body that no supported scheme could decrypt.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[message could not be decrypted]";

/// Change notifications for derived views. Dropped receivers are fine; every
/// send is fire-and-forget.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    MessagesChanged {
        room_id: RoomId,
    },
    DeliveryStateChanged {
        room_id: RoomId,
        client_nonce: String,
        state: DeliveryState,
    },
    TypingChanged {
        room_id: RoomId,
    },
    /// Repeated sync failures; the room view stays usable on cached state.
    SyncDegraded {
        room_id: RoomId,
        detail: String,
    },
}

/// Resolves a record body for display. Encrypted bodies are opened with the
/// room key, falling back across schemes; anything unreadable renders as the
/// explicit placeholder instead of failing the whole room.
pub fn display_body(record: &MessageRecord, key: Option<&RoomKey>) -> String {
    if !record.is_encrypted {
        return record.body.clone();
    }
    let Some(key) = key else {
        return UNDECRYPTABLE_PLACEHOLDER.to_string();
    };
    let tagged = record
        .encryption_scheme_version
        .and_then(SchemeVersion::from_u8);
    match room_crypto::open(&record.body, tagged, key) {
        DecryptOutcome::Plaintext(text) => text,
        DecryptOutcome::Undecryptable => UNDECRYPTABLE_PLACEHOLDER.to_string(),
    }
}

/// Self-service edits and deletes are limited to this window after send;
/// coordinators bypass it.
pub fn can_modify(
    record: &MessageRecord,
    user: UserId,
    is_coordinator: bool,
    now: DateTime<Utc>,
) -> bool {
    if record.deleted {
        return false;
    }
    if is_coordinator {
        return true;
    }
    record.author_id == user && now - record.created_at <= TimeDelta::hours(1)
}

/// Everything needed to run one room: identity, transport, and the optional
/// room key and cursor persistence.
pub struct RoomSessionConfig {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub display_name: String,
    pub room_key: Option<Arc<RoomKey>>,
    pub cursors: Arc<dyn CursorStore>,
}

pub struct RoomSession {
    pub room_id: RoomId,
    pub store: Arc<MessageStore>,
    pub scheduler: Arc<SyncScheduler>,
    pub compose: Arc<ComposeController>,
    pub interactions: InteractionAggregator,
    pub replies: ReplyResolver,
    pub presence: Arc<PresenceSignal>,
    events: broadcast::Sender<RoomEvent>,
}

impl RoomSession {
    pub fn new(api: Arc<RoomApi>, config: RoomSessionConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let room_id = config.room_id;

        let store = Arc::new(MessageStore::new(room_id, events.clone()));
        let presence = Arc::new(PresenceSignal::new(api.clone(), room_id, events.clone()));
        let scheduler = SyncScheduler::new(
            room_id,
            store.clone(),
            Arc::new(HttpPageFetcher::new(api.clone())),
            config.cursors,
            Some(presence.clone()),
            events.clone(),
        );
        let compose = Arc::new(ComposeController::new(
            api.clone(),
            store.clone(),
            AttachmentPipeline::new(api.clone()),
            config.user_id,
            config.display_name,
            config.room_key.clone(),
            Some(scheduler.clone()),
        ));
        let interactions = InteractionAggregator::new(api.clone(), store.clone());
        let replies = ReplyResolver::new(store.clone(), config.room_key);

        Arc::new(Self {
            room_id,
            store,
            scheduler,
            compose,
            interactions,
            replies,
            presence,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration as TimeDelta, Utc};

    use crate::{
        api::RoomApi,
        auth::{Credential, CredentialProvider, SessionAuth},
        error::AuthError,
    };

    struct StaticProvider;

    #[async_trait]
    impl CredentialProvider for StaticProvider {
        async fn issue(&self) -> Result<Credential, AuthError> {
            Ok(Credential {
                token: "test-token".to_string(),
                expires_at: Utc::now() + TimeDelta::hours(1),
            })
        }
    }

    pub(crate) fn api_for(base_url: &str) -> RoomApi {
        RoomApi::new(base_url, Arc::new(SessionAuth::new(Arc::new(StaticProvider))))
    }

    /// An api handle for components under test that never reach the network.
    pub(crate) fn loopback_api() -> RoomApi {
        api_for("http://127.0.0.1:9")
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
