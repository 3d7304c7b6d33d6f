use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use shared::domain::{MessageId, UserId};
use tracing::warn;

use crate::{api::RoomApi, error::ApiFailure, store::MessageStore};

/// Reaction toggles and read-receipt watermarks, layered over the store.
pub struct InteractionAggregator {
    api: Arc<RoomApi>,
    store: Arc<MessageStore>,
}

impl InteractionAggregator {
    pub fn new(api: Arc<RoomApi>, store: Arc<MessageStore>) -> Self {
        Self { api, store }
    }

    /// Toggles `(message, user, emoji)` and returns the server's updated
    /// reaction map. The local map flips immediately so a double click lands
    /// back on the original state; the authoritative map is applied when the
    /// toggle call returns, and the local flip is undone if the call fails.
    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<BTreeMap<String, BTreeSet<UserId>>, ApiFailure> {
        if !self
            .store
            .toggle_reaction_local(message_id, user_id, emoji)
            .await
        {
            // Unknown message: nothing to toggle, nothing to send.
            return Ok(BTreeMap::new());
        }

        match self.api.toggle_reaction(message_id, emoji).await {
            Ok(update) => {
                self.store
                    .apply_reactions(update.message_id, update.reactions.clone(), update.updated_at)
                    .await;
                Ok(update.reactions)
            }
            Err(err) => {
                warn!(message_id = %message_id, "reaction toggle failed, rolling back: {err}");
                self.store
                    .toggle_reaction_local(message_id, user_id, emoji)
                    .await;
                Err(err)
            }
        }
    }

    /// Advances a user's read watermark and posts the receipt. Timestamps at
    /// or behind the stored watermark are silently dropped, not errors.
    pub async fn advance_watermark(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<bool, ApiFailure> {
        if !self.store.advance_watermark(user_id, at).await {
            return Ok(false);
        }
        self.api.mark_read(self.store.room_id(), at).await?;
        Ok(true)
    }
}
