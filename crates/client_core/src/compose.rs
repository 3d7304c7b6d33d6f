use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use room_crypto::{RoomKey, SchemeVersion, CURRENT_SCHEME};
use shared::{
    domain::{DeliveryState, MessageId, UserId},
    protocol::{AttachmentRecord, EditMessageRequest, MessageRecord, SendMessageRequest},
};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    api::RoomApi,
    attachments::{AttachmentPipeline, LocalFile},
    error::{ApiFailure, ComposeError},
    scheduler::SyncScheduler,
    store::MessageStore,
};

/// An outgoing message being assembled on the compose surface.
#[derive(Debug, Clone, Default)]
pub struct ComposeIntent {
    pub draft_text: String,
    pub reply_target: Option<MessageId>,
    /// When set, the intent edits this existing message instead of sending
    /// a new one; the nonce machinery is bypassed.
    pub edit_target: Option<MessageId>,
    pub local_attachments: Vec<LocalFile>,
    pub encryption_requested: bool,
}

/// Drives the outgoing-message lifecycle: draft, optimistic insert,
/// confirmation or failure, and the edit/delete variants against existing
/// messages. Each send is keyed by a client-generated nonce so retries and
/// fetch races collapse to a single visible message.
pub struct ComposeController {
    api: Arc<RoomApi>,
    store: Arc<MessageStore>,
    attachments: AttachmentPipeline,
    author: UserId,
    author_display_name: String,
    room_key: Option<Arc<RoomKey>>,
    scheduler: Option<Arc<SyncScheduler>>,
    outbox: Mutex<HashMap<String, SendMessageRequest>>,
}

impl ComposeController {
    pub fn new(
        api: Arc<RoomApi>,
        store: Arc<MessageStore>,
        attachments: AttachmentPipeline,
        author: UserId,
        author_display_name: String,
        room_key: Option<Arc<RoomKey>>,
        scheduler: Option<Arc<SyncScheduler>>,
    ) -> Self {
        Self {
            api,
            store,
            attachments,
            author,
            author_display_name,
            room_key,
            scheduler,
            outbox: Mutex::new(HashMap::new()),
        }
    }

    /// Submits a draft. Attachment references are resolved first, the
    /// optimistic entry is visible in the store by the time this returns,
    /// and the network send completes in the background. Returns the client
    /// nonce identifying the send.
    pub async fn submit(self: &Arc<Self>, intent: ComposeIntent) -> Result<String, ComposeError> {
        if intent.draft_text.trim().is_empty() && intent.local_attachments.is_empty() {
            return Err(ComposeError::EmptyDraft);
        }

        if let Some(target) = intent.edit_target {
            self.edit(target, intent.draft_text.trim()).await?;
            return Ok(target.to_string());
        }

        let mut attachment_records: Vec<AttachmentRecord> = Vec::new();
        for file in intent.local_attachments {
            let prepared = self.attachments.prepare(file)?;
            attachment_records.push(self.attachments.upload(prepared).await?);
        }

        let nonce = Uuid::new_v4().to_string();
        let (body, scheme) =
            self.sealed_body(&intent.draft_text, intent.encryption_requested, None)?;
        let request = SendMessageRequest {
            body: body.clone(),
            is_encrypted: scheme.is_some(),
            encryption_scheme_version: scheme,
            reply_to_id: intent.reply_target,
            attachments: attachment_records.iter().map(|a| a.id).collect(),
            client_nonce: nonce.clone(),
        };

        let optimistic = MessageRecord {
            id: MessageId(Uuid::new_v4()),
            room_id: self.store.room_id(),
            author_id: self.author,
            author_display_name: self.author_display_name.clone(),
            body,
            is_encrypted: scheme.is_some(),
            encryption_scheme_version: scheme,
            created_at: Utc::now(),
            updated_at: None,
            edited: false,
            deleted: false,
            reply_to_id: intent.reply_target,
            attachments: attachment_records,
            reactions: Default::default(),
            read_watermarks: Default::default(),
            client_nonce: Some(nonce.clone()),
        };

        // The compose surface clears immediately: the optimistic entry is in
        // the store before the send is dispatched.
        self.store.upsert_local(optimistic).await;
        self.outbox.lock().await.insert(nonce.clone(), request);

        let controller = Arc::clone(self);
        let dispatch_nonce = nonce.clone();
        tokio::spawn(async move {
            controller.dispatch(dispatch_nonce).await;
        });

        Ok(nonce)
    }

    async fn dispatch(&self, nonce: String) {
        let Some(request) = self.outbox.lock().await.get(&nonce).cloned() else {
            return;
        };

        match self.api.send_message(self.store.room_id(), &request).await {
            Ok(confirmed) => {
                info!(
                    room_id = %self.store.room_id(),
                    message_id = %confirmed.id,
                    "compose: send confirmed"
                );
                self.store.reconcile(&nonce, confirmed).await;
                self.outbox.lock().await.remove(&nonce);
                self.nudge_refresh();
            }
            Err(ApiFailure::SendConflict { .. }) => {
                // The server already holds this nonce from an earlier
                // attempt. Treat as sent; the next merge swaps in the
                // confirmed record.
                info!(room_id = %self.store.room_id(), "compose: duplicate nonce, already sent");
                self.store.mark_delivery(&nonce, DeliveryState::Sent).await;
                self.outbox.lock().await.remove(&nonce);
                self.nudge_refresh();
            }
            Err(err) => {
                warn!(room_id = %self.store.room_id(), "compose: send failed: {err}");
                self.store
                    .mark_delivery(&nonce, DeliveryState::Failed)
                    .await;
            }
        }
    }

    /// Re-sends a failed message under its original nonce.
    pub async fn retry(self: &Arc<Self>, nonce: &str) -> Result<(), ComposeError> {
        if !self.outbox.lock().await.contains_key(nonce) {
            return Err(ComposeError::UnknownNonce(nonce.to_string()));
        }
        self.store
            .mark_delivery(nonce, DeliveryState::Pending)
            .await;
        let controller = Arc::clone(self);
        let nonce = nonce.to_string();
        tokio::spawn(async move {
            controller.dispatch(nonce).await;
        });
        Ok(())
    }

    /// Drops a failed message instead of retrying it.
    pub async fn discard(&self, nonce: &str) -> bool {
        self.outbox.lock().await.remove(nonce);
        self.store.discard_pending(nonce).await
    }

    /// Edits an existing message. Encrypted targets are re-sealed under the
    /// scheme version they were created with.
    pub async fn edit(&self, message_id: MessageId, new_text: &str) -> Result<(), ComposeError> {
        let Some(existing) = self.store.get(message_id).await else {
            return Err(ComposeError::UnknownMessage(message_id));
        };
        let original_scheme = existing
            .record
            .encryption_scheme_version
            .and_then(SchemeVersion::from_u8);
        let (body, scheme) = self.sealed_body(
            new_text,
            existing.record.is_encrypted,
            original_scheme,
        )?;

        let confirmed = self
            .api
            .edit_message(
                message_id,
                &EditMessageRequest {
                    body,
                    encryption_scheme_version: scheme,
                },
            )
            .await?;
        self.store.merge(vec![confirmed]).await;
        Ok(())
    }

    /// Deletes an existing message; the local entry becomes a tombstone.
    pub async fn delete(&self, message_id: MessageId) -> Result<(), ComposeError> {
        self.api.delete_message(message_id).await?;
        self.store.tombstone(message_id, Utc::now()).await;
        self.nudge_refresh();
        Ok(())
    }

    fn sealed_body(
        &self,
        text: &str,
        encrypt: bool,
        scheme_override: Option<SchemeVersion>,
    ) -> Result<(String, Option<u8>), ComposeError> {
        if !encrypt {
            return Ok((text.to_string(), None));
        }
        let key = self.room_key.as_deref().ok_or(ComposeError::Seal)?;
        let scheme = scheme_override.unwrap_or(CURRENT_SCHEME);
        let sealed =
            room_crypto::seal_with_scheme(scheme, text, key).map_err(|_| ComposeError::Seal)?;
        Ok((sealed.ciphertext_b64, Some(sealed.scheme.as_u8())))
    }

    fn nudge_refresh(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.refresh_now();
        }
    }
}
