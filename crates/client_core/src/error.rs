use shared::domain::MessageId;
use thiserror::Error;

/// Failure taxonomy for calls against the room service.
#[derive(Debug, Error)]
pub enum ApiFailure {
    #[error("transient network failure: {0}")]
    Transient(String),
    #[error("credential renewal failed; re-authentication required")]
    AuthExpired,
    #[error("server already accepted a send for client nonce {nonce}")]
    SendConflict { nonce: String },
    #[error("request rejected by server ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl From<reqwest::Error> for ApiFailure {
    fn from(err: reqwest::Error) -> Self {
        ApiFailure::Transient(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential issuance failed: {0}")]
    Issue(String),
}

/// Attachment problems surfaced to the compose surface before any network
/// call is made.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttachmentError {
    #[error("unsupported attachment type: {filename:?}")]
    UnsupportedType { filename: String },
    #[error("attachment is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("attachment could not be decoded as an image")]
    InvalidImage,
}

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("draft has neither text nor attachments")]
    EmptyDraft,
    #[error("no unconfirmed send with client nonce {0}")]
    UnknownNonce(String),
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
    #[error("message body could not be encrypted for this room")]
    Seal,
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
    #[error(transparent)]
    Api(#[from] ApiFailure),
}
