use super::*;
use chrono::TimeZone;
use uuid::Uuid;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_750_000_000 + secs, 0).single().expect("timestamp")
}

fn room() -> RoomId {
    RoomId(Uuid::from_u128(0xB0B0))
}

fn user(n: u128) -> UserId {
    UserId(Uuid::from_u128(n))
}

fn record(room_id: RoomId, id: u128, offset_secs: i64) -> MessageRecord {
    MessageRecord {
        id: MessageId(Uuid::from_u128(id)),
        room_id,
        author_id: user(1),
        author_display_name: "alice".to_string(),
        body: format!("message {id}"),
        is_encrypted: false,
        encryption_scheme_version: None,
        created_at: at(offset_secs),
        updated_at: None,
        edited: false,
        deleted: false,
        reply_to_id: None,
        attachments: Vec::new(),
        reactions: Default::default(),
        read_watermarks: Default::default(),
        client_nonce: None,
    }
}

fn store() -> MessageStore {
    let (events, _) = broadcast::channel(64);
    MessageStore::new(room(), events)
}

async fn ordered_ids(store: &MessageStore) -> Vec<MessageId> {
    store
        .messages()
        .await
        .into_iter()
        .map(|entry| entry.record.id)
        .collect()
}

#[tokio::test]
async fn merge_is_idempotent() {
    let store = store();
    let page: Vec<MessageRecord> = (0..5).map(|i| record(room(), i as u128 + 1, i)).collect();

    store.merge(page.clone()).await;
    let once = store.messages().await;

    store.merge(page).await;
    let twice = store.messages().await;

    assert_eq!(once.len(), twice.len());
    for (a, b) in once.iter().zip(twice.iter()) {
        assert_eq!(a.record, b.record);
        assert_eq!(a.delivery, b.delivery);
    }
}

#[tokio::test]
async fn overlapping_pages_merge_the_same_in_either_order() {
    let all: Vec<MessageRecord> = (0..50).map(|i| record(room(), i as u128 + 1, i)).collect();
    let first_page: Vec<MessageRecord> = all[..30].to_vec();
    let second_page: Vec<MessageRecord> = all[20..].to_vec();

    let forward = store();
    forward.merge(first_page.clone()).await;
    forward.merge(second_page.clone()).await;

    let backward = store();
    backward.merge(second_page).await;
    backward.merge(first_page).await;

    let forward_ids = ordered_ids(&forward).await;
    let backward_ids = ordered_ids(&backward).await;
    assert_eq!(forward_ids.len(), 50);
    assert_eq!(forward_ids, backward_ids);
}

#[tokio::test]
async fn ordering_is_by_created_at_with_id_tiebreak() {
    let store = store();
    let mut early = record(room(), 9, 10);
    let mut tied_high = record(room(), 7, 20);
    let mut tied_low = record(room(), 3, 20);
    early.body = "early".to_string();
    tied_high.body = "tied high id".to_string();
    tied_low.body = "tied low id".to_string();

    store.merge(vec![tied_high, early, tied_low]).await;

    let ids = ordered_ids(&store).await;
    assert_eq!(
        ids,
        vec![
            MessageId(Uuid::from_u128(9)),
            MessageId(Uuid::from_u128(3)),
            MessageId(Uuid::from_u128(7)),
        ]
    );
}

#[tokio::test]
async fn collisions_resolve_by_last_write_wins() {
    let store = store();
    let original = record(room(), 1, 0);
    store.merge(vec![original.clone()]).await;

    let mut edited = original.clone();
    edited.body = "edited body".to_string();
    edited.edited = true;
    edited.updated_at = Some(at(60));
    store.merge(vec![edited]).await;

    // A re-fetched stale copy must not roll the edit back.
    store.merge(vec![original]).await;

    let entry = store.get(MessageId(Uuid::from_u128(1))).await.expect("entry");
    assert_eq!(entry.record.body, "edited body");
    assert!(entry.record.edited);
    assert_eq!(entry.record.updated_at, Some(at(60)));
}

#[tokio::test]
async fn reactions_apply_last_write_wins_and_prune_empty_sets() {
    let store = store();
    let id = MessageId(Uuid::from_u128(1));
    let mut seeded = record(room(), 1, 0);
    seeded.updated_at = Some(at(30));
    store.merge(vec![seeded]).await;

    let mut newer: BTreeMap<String, BTreeSet<UserId>> = BTreeMap::new();
    newer.insert("👍".to_string(), BTreeSet::from([user(2)]));
    newer.insert("🎉".to_string(), BTreeSet::new());
    assert!(store.apply_reactions(id, newer, at(60)).await);

    let entry = store.get(id).await.expect("entry");
    assert_eq!(entry.record.reactions.len(), 1);
    assert!(entry.record.reactions["👍"].contains(&user(2)));

    // A response stamped before the stored update timestamp is stale.
    let stale: BTreeMap<String, BTreeSet<UserId>> = BTreeMap::new();
    assert!(!store.apply_reactions(id, stale, at(10)).await);
    let entry = store.get(id).await.expect("entry");
    assert!(entry.record.reactions.contains_key("👍"));
}

#[tokio::test]
async fn local_reaction_toggle_is_an_involution() {
    let store = store();
    let id = MessageId(Uuid::from_u128(1));
    store.merge(vec![record(room(), 1, 0)]).await;

    let before = store.get(id).await.expect("entry").record.reactions;
    store.toggle_reaction_local(id, user(2), "👍").await;
    let flipped = store.get(id).await.expect("entry").record.reactions;
    assert!(flipped["👍"].contains(&user(2)));

    store.toggle_reaction_local(id, user(2), "👍").await;
    let after = store.get(id).await.expect("entry").record.reactions;
    assert_eq!(before, after);
    assert!(!after.contains_key("👍"));
}

#[tokio::test]
async fn watermarks_never_move_backwards() {
    let store = store();
    let mut first = record(room(), 1, 0);
    first.read_watermarks.insert(user(2), at(100));
    store.merge(vec![first]).await;
    assert_eq!(store.watermark_for(user(2)).await, Some(at(100)));

    // An older per-message watermark from a stale page is absorbed.
    let mut second = record(room(), 3, 5);
    second.read_watermarks.insert(user(2), at(40));
    store.merge(vec![second]).await;
    assert_eq!(store.watermark_for(user(2)).await, Some(at(100)));

    assert!(!store.advance_watermark(user(2), at(100)).await);
    assert!(!store.advance_watermark(user(2), at(50)).await);
    assert!(store.advance_watermark(user(2), at(101)).await);
    assert_eq!(store.watermark_for(user(2)).await, Some(at(101)));
}

#[tokio::test]
async fn fetched_copy_of_an_optimistic_send_does_not_duplicate() {
    let store = store();
    let nonce = "n-7";

    let mut optimistic = record(room(), 100, 0);
    optimistic.client_nonce = Some(nonce.to_string());
    store.upsert_local(optimistic).await;
    assert_eq!(store.messages().await.len(), 1);
    assert_eq!(
        store.find_pending(nonce).await.expect("pending").delivery,
        DeliveryState::Pending
    );

    // A sync cycle returns the server-confirmed copy before the send call's
    // own response arrives.
    let mut confirmed = record(room(), 200, 1);
    confirmed.client_nonce = Some(nonce.to_string());
    store.merge(vec![confirmed.clone()]).await;

    let ids = ordered_ids(&store).await;
    assert_eq!(ids, vec![MessageId(Uuid::from_u128(200))]);

    // The send response lands afterwards; reconcile stays a no-op.
    store.reconcile(nonce, confirmed).await;
    assert_eq!(store.messages().await.len(), 1);
    assert_eq!(
        store.messages().await[0].delivery,
        DeliveryState::Sent
    );
}

#[tokio::test]
async fn reconcile_before_fetch_is_equally_stable() {
    let store = store();
    let nonce = "n-8";

    let mut optimistic = record(room(), 100, 0);
    optimistic.client_nonce = Some(nonce.to_string());
    store.upsert_local(optimistic).await;

    let mut confirmed = record(room(), 200, 1);
    confirmed.client_nonce = Some(nonce.to_string());
    store.reconcile(nonce, confirmed.clone()).await;
    store.merge(vec![confirmed]).await;

    let ids = ordered_ids(&store).await;
    assert_eq!(ids, vec![MessageId(Uuid::from_u128(200))]);
}

#[tokio::test]
async fn tombstones_are_retained_not_removed() {
    let store = store();
    let id = MessageId(Uuid::from_u128(1));
    store.merge(vec![record(room(), 1, 0)]).await;

    assert!(store.tombstone(id, at(30)).await);
    let entry = store.get(id).await.expect("tombstone stays");
    assert!(entry.record.deleted);
    assert!(entry.record.body.is_empty());
    assert_eq!(store.messages().await.len(), 1);

    // Deleting twice changes nothing.
    assert!(!store.tombstone(id, at(40)).await);
}

#[tokio::test]
async fn failed_sends_can_be_marked_and_discarded() {
    let store = store();
    let nonce = "n-9";
    let mut optimistic = record(room(), 100, 0);
    optimistic.client_nonce = Some(nonce.to_string());
    store.upsert_local(optimistic).await;

    assert!(store.mark_delivery(nonce, DeliveryState::Failed).await);
    assert_eq!(
        store.find_pending(nonce).await.expect("pending").delivery,
        DeliveryState::Failed
    );

    assert!(store.discard_pending(nonce).await);
    assert!(store.messages().await.is_empty());
    assert!(!store.discard_pending(nonce).await);
}

#[tokio::test]
async fn records_from_other_rooms_are_ignored() {
    let store = store();
    let foreign = record(RoomId(Uuid::from_u128(0xDEAD)), 1, 0);
    store.merge(vec![foreign]).await;
    assert!(store.messages().await.is_empty());
}

#[tokio::test]
async fn merges_notify_derived_views() {
    let (events, mut rx) = broadcast::channel(16);
    let store = MessageStore::new(room(), events);

    store.merge(vec![record(room(), 1, 0)]).await;
    match rx.recv().await.expect("event") {
        RoomEvent::MessagesChanged { room_id } => assert_eq!(room_id, room()),
        other => panic!("unexpected event: {other:?}"),
    }

    // Re-merging the identical page must not emit again.
    store.merge(vec![record(room(), 1, 0)]).await;
    assert!(rx.try_recv().is_err());
}
