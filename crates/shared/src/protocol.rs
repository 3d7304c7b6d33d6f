use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AttachmentId, MediaKind, MessageId, RoomId, RoomKind, UserId};

/// A room message as the server returns it.
///
/// `created_at` is the authoritative ordering key; `updated_at` drives
/// last-write-wins merging of the mutable fields. `client_nonce` is echoed
/// back on recently confirmed sends so a concurrently fetched copy can be
/// matched against the local optimistic entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub room_id: RoomId,
    pub author_id: UserId,
    pub author_display_name: String,
    pub body: String,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_scheme_version: Option<u8>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub read_watermarks: BTreeMap<UserId, DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<String>,
}

impl MessageRecord {
    /// Timestamp used for last-write-wins comparisons.
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: AttachmentId,
    pub filename: String,
    pub media_kind: MediaKind,
    pub byte_size: u64,
    pub storage_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_message_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub id: RoomId,
    pub display_name: String,
    pub kind: RoomKind,
    pub member_ids: Vec<UserId>,
    pub created_by: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    pub display_name: String,
    pub kind: RoomKind,
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
    pub is_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_scheme_version: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentId>,
    pub client_nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_scheme_version: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactRequest {
    pub emoji: String,
}

/// Authoritative reaction map after a toggle, stamped so the client can
/// apply it with the same last-write-wins rule used for page merges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionUpdate {
    pub message_id: MessageId,
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub id: AttachmentId,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingRoster {
    pub user_ids: Vec<UserId>,
}
