use std::sync::Arc;

use shared::protocol::{CreateRoomRequest, RoomSummary};

use crate::{api::RoomApi, error::ApiFailure};

/// Thin typed client for the external room directory service.
pub struct RoomDirectory {
    api: Arc<RoomApi>,
}

impl RoomDirectory {
    pub fn new(api: Arc<RoomApi>) -> Self {
        Self { api }
    }

    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>, ApiFailure> {
        self.api.list_rooms().await
    }

    pub async fn create_room(&self, request: CreateRoomRequest) -> Result<RoomSummary, ApiFailure> {
        self.api.create_room(&request).await
    }
}
