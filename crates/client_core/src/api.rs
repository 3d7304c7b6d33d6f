use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use shared::{
    domain::{MessageId, RoomId, UserId},
    error::ApiError,
    protocol::{
        CreateRoomRequest, EditMessageRequest, MessageRecord, ReactRequest, ReactionUpdate,
        RoomSummary, SendMessageRequest, TypingRoster, UploadResponse,
    },
};
use tracing::debug;

use crate::{
    auth::SessionAuth,
    error::ApiFailure,
};

/// Typed client for the room service. Every call goes out with a bearer
/// credential from [`SessionAuth`]; a 401-equivalent rejection triggers one
/// renewal and one retry before surfacing [`ApiFailure::AuthExpired`].
pub struct RoomApi {
    http: Client,
    base_url: String,
    auth: Arc<SessionAuth>,
}

#[derive(Serialize)]
struct ListMessagesQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    since: Option<String>,
}

#[derive(Serialize)]
struct ReadReceiptRequest {
    at: DateTime<Utc>,
}

impl RoomApi {
    pub fn new(base_url: impl Into<String>, auth: Arc<SessionAuth>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http: Client::new(),
            base_url,
            auth,
        }
    }

    async fn execute(
        &self,
        build: impl Fn(&Client) -> RequestBuilder,
    ) -> Result<Response, ApiFailure> {
        let credential = self
            .auth
            .bearer()
            .await
            .map_err(|_| ApiFailure::AuthExpired)?;
        let response = build(&self.http)
            .bearer_auth(&credential.token)
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("api: credential rejected, renewing and retrying once");
        self.auth.invalidate().await;
        let credential = self
            .auth
            .bearer()
            .await
            .map_err(|_| ApiFailure::AuthExpired)?;
        let retried = build(&self.http)
            .bearer_auth(&credential.token)
            .send()
            .await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            return Err(ApiFailure::AuthExpired);
        }
        Ok(retried)
    }

    /// Maps a non-success response onto the failure taxonomy. `nonce` marks
    /// requests whose 409 means "this send was already accepted".
    async fn check(response: Response, nonce: Option<&str>) -> Result<Response, ApiFailure> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::CONFLICT {
            if let Some(nonce) = nonce {
                return Err(ApiFailure::SendConflict {
                    nonce: nonce.to_string(),
                });
            }
        }
        if status.is_server_error() {
            return Err(ApiFailure::Transient(format!("server error: {status}")));
        }
        let message = response
            .json::<ApiError>()
            .await
            .map(|err| err.message)
            .unwrap_or_else(|_| status.to_string());
        Err(ApiFailure::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>, ApiFailure> {
        let response = self
            .execute(|http| http.get(format!("{}/rooms", self.base_url)))
            .await?;
        Ok(Self::check(response, None).await?.json().await?)
    }

    pub async fn create_room(&self, request: &CreateRoomRequest) -> Result<RoomSummary, ApiFailure> {
        let response = self
            .execute(|http| http.post(format!("{}/rooms", self.base_url)).json(request))
            .await?;
        Ok(Self::check(response, None).await?.json().await?)
    }

    /// Messages with activity since the cursor, ascending by `created_at`.
    pub async fn fetch_messages(
        &self,
        room_id: RoomId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageRecord>, ApiFailure> {
        let query = ListMessagesQuery {
            since: since.map(|at| at.to_rfc3339_opts(SecondsFormat::Micros, true)),
        };
        let response = self
            .execute(|http| {
                http.get(format!("{}/rooms/{}/messages", self.base_url, room_id))
                    .query(&query)
            })
            .await?;
        Ok(Self::check(response, None).await?.json().await?)
    }

    pub async fn send_message(
        &self,
        room_id: RoomId,
        request: &SendMessageRequest,
    ) -> Result<MessageRecord, ApiFailure> {
        let response = self
            .execute(|http| {
                http.post(format!("{}/rooms/{}/messages", self.base_url, room_id))
                    .json(request)
            })
            .await?;
        Ok(Self::check(response, Some(&request.client_nonce))
            .await?
            .json()
            .await?)
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        request: &EditMessageRequest,
    ) -> Result<MessageRecord, ApiFailure> {
        let response = self
            .execute(|http| {
                http.patch(format!("{}/messages/{}", self.base_url, message_id))
                    .json(request)
            })
            .await?;
        Ok(Self::check(response, None).await?.json().await?)
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<(), ApiFailure> {
        let response = self
            .execute(|http| http.delete(format!("{}/messages/{}", self.base_url, message_id)))
            .await?;
        Self::check(response, None).await?;
        Ok(())
    }

    /// Toggle semantics: reacting twice with the same emoji removes it again.
    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<ReactionUpdate, ApiFailure> {
        let request = ReactRequest {
            emoji: emoji.to_string(),
        };
        let response = self
            .execute(|http| {
                http.post(format!("{}/messages/{}/react", self.base_url, message_id))
                    .json(&request)
            })
            .await?;
        Ok(Self::check(response, None).await?.json().await?)
    }

    pub async fn mark_read(&self, room_id: RoomId, at: DateTime<Utc>) -> Result<(), ApiFailure> {
        let response = self
            .execute(|http| {
                http.post(format!("{}/rooms/{}/read", self.base_url, room_id))
                    .json(&ReadReceiptRequest { at })
            })
            .await?;
        Self::check(response, None).await?;
        Ok(())
    }

    pub async fn notify_typing(&self, room_id: RoomId) -> Result<(), ApiFailure> {
        let response = self
            .execute(|http| http.post(format!("{}/rooms/{}/typing", self.base_url, room_id)))
            .await?;
        Self::check(response, None).await?;
        Ok(())
    }

    pub async fn typing_roster(&self, room_id: RoomId) -> Result<Vec<UserId>, ApiFailure> {
        let response = self
            .execute(|http| http.get(format!("{}/rooms/{}/typing", self.base_url, room_id)))
            .await?;
        let roster: TypingRoster = Self::check(response, None).await?.json().await?;
        Ok(roster.user_ids)
    }

    /// Uploads attachment bytes to storage and returns the stable reference.
    pub async fn upload_attachment(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResponse, ApiFailure> {
        let response = self
            .execute(|http| {
                http.post(format!("{}/attachments", self.base_url))
                    .query(&[("filename", filename)])
                    .body(bytes.clone())
            })
            .await?;
        Ok(Self::check(response, None).await?.json().await?)
    }
}
