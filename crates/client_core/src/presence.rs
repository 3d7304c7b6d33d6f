use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use shared::domain::{RoomId, UserId};
use tokio::sync::{broadcast, Mutex};

use crate::{api::RoomApi, error::ApiFailure, RoomEvent};

/// At most one outbound typing signal per window, regardless of keystroke
/// rate.
pub const TYPING_DEBOUNCE: Duration = Duration::from_secs(3);
/// A peer's signal expires after this long without renewal; there is no
/// explicit "stopped typing" event.
pub const TYPING_TTL: Duration = Duration::from_secs(6);

/// Debounced, self-expiring typing indicator for one room.
pub struct PresenceSignal {
    api: Arc<RoomApi>,
    room_id: RoomId,
    events: broadcast::Sender<RoomEvent>,
    inner: Mutex<PresenceState>,
}

#[derive(Default)]
struct PresenceState {
    last_sent: Option<Instant>,
    peers: HashMap<UserId, Instant>,
}

impl PresenceSignal {
    pub fn new(api: Arc<RoomApi>, room_id: RoomId, events: broadcast::Sender<RoomEvent>) -> Self {
        Self {
            api,
            room_id,
            events,
            inner: Mutex::new(PresenceState::default()),
        }
    }

    /// Signals that the local user is typing. Returns whether a signal
    /// actually went out or the call fell inside the debounce window.
    pub async fn notify_typing(&self) -> Result<bool, ApiFailure> {
        {
            let mut state = self.inner.lock().await;
            if let Some(last) = state.last_sent {
                if last.elapsed() < TYPING_DEBOUNCE {
                    return Ok(false);
                }
            }
            state.last_sent = Some(Instant::now());
        }
        self.api.notify_typing(self.room_id).await?;
        Ok(true)
    }

    /// Records a peer's typing signal, refreshing its expiry.
    pub async fn observe(&self, user_id: UserId) {
        self.observe_roster(vec![user_id]).await;
    }

    /// Folds in a polled typing roster.
    pub async fn observe_roster(&self, user_ids: Vec<UserId>) {
        if user_ids.is_empty() {
            return;
        }
        {
            let mut state = self.inner.lock().await;
            let now = Instant::now();
            for user_id in user_ids {
                state.peers.insert(user_id, now);
            }
        }
        let _ = self.events.send(RoomEvent::TypingChanged {
            room_id: self.room_id,
        });
    }

    /// Peers whose signal has not yet expired, sorted for stable rendering.
    pub async fn active_typists(&self) -> Vec<UserId> {
        let mut state = self.inner.lock().await;
        let now = Instant::now();
        state.peers.retain(|_, seen| now.duration_since(*seen) < TYPING_TTL);
        let mut users: Vec<UserId> = state.peers.keys().copied().collect();
        users.sort();
        users
    }
}
