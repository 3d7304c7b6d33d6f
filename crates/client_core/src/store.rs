use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use shared::{
    domain::{DeliveryState, MessageId, RoomId, UserId},
    protocol::MessageRecord,
};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::RoomEvent;

/// A message as held in the client cache: the wire record plus the
/// client-only delivery state.
#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub record: MessageRecord,
    pub delivery: DeliveryState,
}

/// The single authoritative client-side cache of a room's messages.
///
/// All mutation goes through the methods here, called only by the sync
/// scheduler, the compose controller, and the interaction aggregator; every
/// other component reads derived views. Merging is idempotent: applying the
/// same page twice leaves the state unchanged. Every effective mutation
/// emits [`RoomEvent::MessagesChanged`] so derived views recompute.
pub struct MessageStore {
    room_id: RoomId,
    inner: Mutex<StoreState>,
    events: broadcast::Sender<RoomEvent>,
}

#[derive(Default)]
struct StoreState {
    by_id: HashMap<MessageId, CachedMessage>,
    order: BTreeSet<(DateTime<Utc>, MessageId)>,
    pending_by_nonce: HashMap<String, MessageId>,
    watermarks: BTreeMap<UserId, DateTime<Utc>>,
}

impl MessageStore {
    pub fn new(room_id: RoomId, events: broadcast::Sender<RoomEvent>) -> Self {
        Self {
            room_id,
            inner: Mutex::new(StoreState::default()),
            events,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Merges a fetched page. Union by id; on collision the copy with the
    /// later update timestamp wins per mutable field, watermarks only ever
    /// move forward, and a record carrying the nonce of a pending optimistic
    /// entry replaces that entry instead of duplicating it.
    pub async fn merge(&self, page: Vec<MessageRecord>) {
        let mut changed = false;
        {
            let mut state = self.inner.lock().await;
            for record in page {
                if record.room_id != self.room_id {
                    debug!(
                        room_id = %self.room_id,
                        foreign_room = %record.room_id,
                        "store: dropping record for foreign room"
                    );
                    continue;
                }
                changed |= state.apply_record(record, DeliveryState::Sent);
            }
        }
        if changed {
            self.notify();
        }
    }

    /// Inserts an optimistic local message before its network send departs.
    pub async fn upsert_local(&self, record: MessageRecord) {
        {
            let mut state = self.inner.lock().await;
            if let Some(nonce) = record.client_nonce.clone() {
                state.pending_by_nonce.insert(nonce, record.id);
            }
            state.insert(CachedMessage {
                record,
                delivery: DeliveryState::Pending,
            });
        }
        self.notify();
    }

    /// Replaces the optimistic entry for `nonce` with the server-confirmed
    /// record. This is the single point preventing a duplicate visible
    /// message when the optimistic insert and a fetched page both describe
    /// the same send; it is idempotent against either arriving first.
    pub async fn reconcile(&self, nonce: &str, confirmed: MessageRecord) {
        {
            let mut state = self.inner.lock().await;
            state.drop_pending(nonce, confirmed.id);
            state.apply_record(confirmed, DeliveryState::Sent);
        }
        self.notify();
    }

    /// Updates the delivery state of the unconfirmed send for `nonce`.
    pub async fn mark_delivery(&self, nonce: &str, delivery: DeliveryState) -> bool {
        let changed = {
            let mut state = self.inner.lock().await;
            let id = state.pending_by_nonce.get(nonce).copied();
            match id.and_then(|id| state.by_id.get_mut(&id)) {
                Some(entry) if entry.delivery != delivery => {
                    entry.delivery = delivery;
                    true
                }
                _ => false,
            }
        };
        if changed {
            let _ = self.events.send(RoomEvent::DeliveryStateChanged {
                room_id: self.room_id,
                client_nonce: nonce.to_string(),
                state: delivery,
            });
            self.notify();
        }
        changed
    }

    /// Removes an unconfirmed send entirely (user chose discard over retry).
    pub async fn discard_pending(&self, nonce: &str) -> bool {
        let removed = {
            let mut state = self.inner.lock().await;
            match state.pending_by_nonce.remove(nonce) {
                Some(id) => state.remove(id).is_some(),
                None => false,
            }
        };
        if removed {
            self.notify();
        }
        removed
    }

    /// Messages in display order: `created_at` ascending, ties broken by id.
    pub async fn messages(&self) -> Vec<CachedMessage> {
        let state = self.inner.lock().await;
        state
            .order
            .iter()
            .filter_map(|(_, id)| state.by_id.get(id).cloned())
            .collect()
    }

    pub async fn get(&self, id: MessageId) -> Option<CachedMessage> {
        self.inner.lock().await.by_id.get(&id).cloned()
    }

    pub async fn find_pending(&self, nonce: &str) -> Option<CachedMessage> {
        let state = self.inner.lock().await;
        let id = state.pending_by_nonce.get(nonce)?;
        state.by_id.get(id).cloned()
    }

    /// Applies an authoritative reaction map under the same last-write-wins
    /// rule page merges use, so a stale toggle response cannot clobber a
    /// newer fetched state.
    pub async fn apply_reactions(
        &self,
        id: MessageId,
        reactions: BTreeMap<String, BTreeSet<UserId>>,
        at: DateTime<Utc>,
    ) -> bool {
        let changed = {
            let mut state = self.inner.lock().await;
            match state.by_id.get_mut(&id) {
                Some(entry) if at >= entry.record.last_touched() => {
                    let pruned = prune_empty_reactions(reactions);
                    let changed = entry.record.reactions != pruned;
                    entry.record.reactions = pruned;
                    entry.record.updated_at = Some(at.max(entry.record.last_touched()));
                    changed
                }
                _ => false,
            }
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Flips one (message, user, emoji) triple in place. Toggling the same
    /// triple twice restores the prior map.
    pub async fn toggle_reaction_local(&self, id: MessageId, user: UserId, emoji: &str) -> bool {
        let changed = {
            let mut state = self.inner.lock().await;
            match state.by_id.get_mut(&id) {
                Some(entry) => {
                    let users = entry.record.reactions.entry(emoji.to_string()).or_default();
                    if !users.insert(user) {
                        users.remove(&user);
                    }
                    if entry.record.reactions.get(emoji).is_some_and(BTreeSet::is_empty) {
                        entry.record.reactions.remove(emoji);
                    }
                    true
                }
                None => false,
            }
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Advances a user's read watermark. Older timestamps are silently
    /// dropped; the watermark never moves backwards.
    pub async fn advance_watermark(&self, user: UserId, at: DateTime<Utc>) -> bool {
        let advanced = {
            let mut state = self.inner.lock().await;
            state.advance_watermark(user, at)
        };
        if advanced {
            self.notify();
        }
        advanced
    }

    pub async fn watermark_for(&self, user: UserId) -> Option<DateTime<Utc>> {
        self.inner.lock().await.watermarks.get(&user).copied()
    }

    pub async fn watermarks(&self) -> BTreeMap<UserId, DateTime<Utc>> {
        self.inner.lock().await.watermarks.clone()
    }

    /// Marks a message deleted locally after a confirmed delete. The entry
    /// is retained as a tombstone so replies to it can still resolve.
    pub async fn tombstone(&self, id: MessageId, at: DateTime<Utc>) -> bool {
        let changed = {
            let mut state = self.inner.lock().await;
            match state.by_id.get_mut(&id) {
                Some(entry) if !entry.record.deleted => {
                    entry.record.deleted = true;
                    entry.record.body.clear();
                    entry.record.updated_at = Some(at.max(entry.record.last_touched()));
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.notify();
        }
        changed
    }

    fn notify(&self) {
        let _ = self.events.send(RoomEvent::MessagesChanged {
            room_id: self.room_id,
        });
    }
}

impl StoreState {
    fn apply_record(&mut self, incoming: MessageRecord, delivery: DeliveryState) -> bool {
        // A confirmed copy of an optimistic send, seen either via reconcile
        // or via a concurrent fetch, supersedes the temporary entry.
        if let Some(nonce) = incoming.client_nonce.clone() {
            self.drop_pending(&nonce, incoming.id);
        }

        let Some(existing) = self.by_id.get(&incoming.id).cloned() else {
            self.fold_watermarks(&incoming.read_watermarks);
            self.insert(CachedMessage {
                record: incoming,
                delivery,
            });
            return true;
        };

        let mut merged = existing.clone();
        merge_record(&mut merged, incoming, delivery);
        self.fold_watermarks(&merged.record.read_watermarks);
        if merged.record == existing.record && merged.delivery == existing.delivery {
            return false;
        }

        let stale_key = (existing.record.created_at, existing.record.id);
        self.order.remove(&stale_key);
        self.insert(merged);
        true
    }

    fn insert(&mut self, entry: CachedMessage) {
        self.order.insert((entry.record.created_at, entry.record.id));
        self.by_id.insert(entry.record.id, entry);
    }

    fn remove(&mut self, id: MessageId) -> Option<CachedMessage> {
        let entry = self.by_id.remove(&id)?;
        self.order.remove(&(entry.record.created_at, id));
        Some(entry)
    }

    /// Drops the optimistic entry registered under `nonce` unless it already
    /// carries the confirmed id.
    fn drop_pending(&mut self, nonce: &str, confirmed_id: MessageId) {
        if let Some(temp_id) = self.pending_by_nonce.remove(nonce) {
            if temp_id != confirmed_id {
                self.remove(temp_id);
            }
        }
    }

    fn advance_watermark(&mut self, user: UserId, at: DateTime<Utc>) -> bool {
        match self.watermarks.get(&user) {
            Some(existing) if *existing >= at => false,
            _ => {
                self.watermarks.insert(user, at);
                true
            }
        }
    }

    fn fold_watermarks(&mut self, per_message: &BTreeMap<UserId, DateTime<Utc>>) {
        for (user, at) in per_message {
            self.advance_watermark(*user, *at);
        }
    }
}

fn merge_record(entry: &mut CachedMessage, incoming: MessageRecord, delivery: DeliveryState) {
    // Watermarks merge forward-only no matter which copy is newer.
    let mut merged_watermarks = entry.record.read_watermarks.clone();
    for (user, at) in &incoming.read_watermarks {
        let slot = merged_watermarks.entry(*user).or_insert(*at);
        if *at > *slot {
            *slot = *at;
        }
    }

    let incoming_newer = incoming.last_touched() >= entry.record.last_touched();
    if incoming_newer {
        let preserved_updated_at = match (incoming.updated_at, entry.record.updated_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        entry.record = incoming;
        entry.record.updated_at = preserved_updated_at;
        entry.record.reactions = prune_empty_reactions(std::mem::take(&mut entry.record.reactions));
        entry.delivery = delivery;
    } else if entry.delivery == DeliveryState::Pending && delivery == DeliveryState::Sent {
        // A stale copy still proves the server accepted the send.
        entry.delivery = DeliveryState::Sent;
        entry.record.client_nonce = incoming.client_nonce;
    }
    entry.record.read_watermarks = merged_watermarks;
}

fn prune_empty_reactions(
    reactions: BTreeMap<String, BTreeSet<UserId>>,
) -> BTreeMap<String, BTreeSet<UserId>> {
    reactions
        .into_iter()
        .filter(|(_, users)| !users.is_empty())
        .collect()
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
