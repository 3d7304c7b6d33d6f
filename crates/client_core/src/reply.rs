use std::{sync::Arc, time::Duration};

use room_crypto::RoomKey;
use shared::domain::MessageId;

use crate::{display_body, store::MessageStore};

const SNIPPET_MAX_CHARS: usize = 120;

/// How long a scrolled-to reply target stays highlighted.
pub const REPLY_HIGHLIGHT: Duration = Duration::from_secs(2);

/// What a reply reference renders as. Misses degrade to placeholders; this
/// never fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPreview {
    Resolved { author: String, snippet: String },
    /// The target was deleted; a tombstone is retained so the reference
    /// still renders instead of vanishing.
    Deleted,
    /// The target is not in the cache (not yet fetched, or pruned).
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTarget {
    pub message_id: MessageId,
    pub highlight_for: Duration,
}

/// Resolves reply references against the message cache.
pub struct ReplyResolver {
    store: Arc<MessageStore>,
    room_key: Option<Arc<RoomKey>>,
}

impl ReplyResolver {
    pub fn new(store: Arc<MessageStore>, room_key: Option<Arc<RoomKey>>) -> Self {
        Self { store, room_key }
    }

    pub async fn resolve(&self, reply_to_id: MessageId) -> ReplyPreview {
        let Some(entry) = self.store.get(reply_to_id).await else {
            return ReplyPreview::Unavailable;
        };
        if entry.record.deleted {
            return ReplyPreview::Deleted;
        }
        let body = display_body(&entry.record, self.room_key.as_deref());
        ReplyPreview::Resolved {
            author: entry.record.author_display_name,
            snippet: snippet_of(&body),
        }
    }

    /// Scroll-to-target for a tapped reply preview.
    pub async fn locate(&self, reply_to_id: MessageId) -> Option<ReplyTarget> {
        let entry = self.store.get(reply_to_id).await?;
        Some(ReplyTarget {
            message_id: entry.record.id,
            highlight_for: REPLY_HIGHLIGHT,
        })
    }
}

fn snippet_of(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= SNIPPET_MAX_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(SNIPPET_MAX_CHARS).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_bodies_pass_through() {
        assert_eq!(snippet_of("  hello there  "), "hello there");
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundaries() {
        let body = "ü".repeat(300);
        let snippet = snippet_of(&body);
        assert_eq!(snippet.chars().count(), SNIPPET_MAX_CHARS + 1);
        assert!(snippet.ends_with('…'));
    }
}
