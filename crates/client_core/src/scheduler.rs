use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{RoomId, UserId},
    protocol::MessageRecord,
};
use storage::ClientStateDb;
use tokio::{
    sync::{broadcast, Mutex, Notify},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    api::RoomApi, error::ApiFailure, presence::PresenceSignal, store::MessageStore, RoomEvent,
};

/// Cadence of the steady-state fetch loop.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Consecutive failures before a degraded-sync notice goes out.
const DEGRADED_AFTER_FAILURES: u32 = 3;

/// Transport seam for the fetch loop. The polling HTTP implementation can be
/// swapped for a push transport without touching the store's merge
/// semantics.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_since(
        &self,
        room_id: RoomId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageRecord>, ApiFailure>;

    async fn typing_roster(&self, _room_id: RoomId) -> Result<Vec<UserId>, ApiFailure> {
        Ok(Vec::new())
    }
}

pub struct HttpPageFetcher {
    api: Arc<RoomApi>,
}

impl HttpPageFetcher {
    pub fn new(api: Arc<RoomApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_since(
        &self,
        room_id: RoomId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageRecord>, ApiFailure> {
        self.api.fetch_messages(room_id, since).await
    }

    async fn typing_roster(&self, room_id: RoomId) -> Result<Vec<UserId>, ApiFailure> {
        self.api.typing_roster(room_id).await
    }
}

/// Last-seen cursor persistence. Forward-only by contract.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn cursor(&self, room_id: RoomId) -> Option<DateTime<Utc>>;
    async fn advance(&self, room_id: RoomId, at: DateTime<Utc>);
}

#[async_trait]
impl CursorStore for ClientStateDb {
    async fn cursor(&self, room_id: RoomId) -> Option<DateTime<Utc>> {
        match self.cursor_for_room(room_id).await {
            Ok(cursor) => cursor,
            Err(err) => {
                warn!(room_id = %room_id, "cursor read failed, refetching from scratch: {err}");
                None
            }
        }
    }

    async fn advance(&self, room_id: RoomId, at: DateTime<Utc>) {
        if let Err(err) = self.advance_cursor(room_id, at).await {
            warn!(room_id = %room_id, "cursor write failed: {err}");
        }
    }
}

/// In-memory cursor store for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryCursorStore {
    inner: Mutex<HashMap<RoomId, DateTime<Utc>>>,
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn cursor(&self, room_id: RoomId) -> Option<DateTime<Utc>> {
        self.inner.lock().await.get(&room_id).copied()
    }

    async fn advance(&self, room_id: RoomId, at: DateTime<Utc>) {
        let mut cursors = self.inner.lock().await;
        let slot = cursors.entry(room_id).or_insert(at);
        if at > *slot {
            *slot = at;
        }
    }
}

/// Periodic fetch-and-merge orchestrator for one room.
///
/// Every fetch belongs to a numbered cycle. `refresh_now` starts a newer
/// cycle immediately; if an older cycle's response is still in flight when
/// that happens, the older response is discarded on arrival rather than
/// merged over fresher state.
pub struct SyncScheduler {
    room_id: RoomId,
    store: Arc<MessageStore>,
    fetcher: Arc<dyn PageFetcher>,
    cursors: Arc<dyn CursorStore>,
    presence: Option<Arc<PresenceSignal>>,
    events: broadcast::Sender<RoomEvent>,
    cycle: AtomicU64,
    paused: AtomicBool,
    kick: Notify,
}

impl SyncScheduler {
    pub fn new(
        room_id: RoomId,
        store: Arc<MessageStore>,
        fetcher: Arc<dyn PageFetcher>,
        cursors: Arc<dyn CursorStore>,
        presence: Option<Arc<PresenceSignal>>,
        events: broadcast::Sender<RoomEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            room_id,
            store,
            fetcher,
            cursors,
            presence,
            events,
            cycle: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            kick: Notify::new(),
        })
    }

    /// Starts the periodic loop. State survives pause/resume; aborting the
    /// returned handle stops the room's polling entirely.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run().await;
        })
    }

    async fn run(self: Arc<Self>) {
        let mut failures: u32 = 0;
        loop {
            if self.paused.load(Ordering::SeqCst) {
                self.kick.notified().await;
                continue;
            }

            let delay = match self.sync_once().await {
                Ok(_) => {
                    failures = 0;
                    POLL_INTERVAL
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    if failures == DEGRADED_AFTER_FAILURES {
                        let _ = self.events.send(RoomEvent::SyncDegraded {
                            room_id: self.room_id,
                            detail: err.to_string(),
                        });
                    }
                    let delay = backoff_delay(failures);
                    warn!(
                        room_id = %self.room_id,
                        failures,
                        backoff_ms = delay.as_millis() as u64,
                        "sync: fetch failed: {err}"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.kick.notified() => {}
            }
        }
    }

    /// Runs one numbered fetch-and-merge cycle. Returns how many records
    /// were merged; zero when the cycle was superseded before its response
    /// arrived.
    pub async fn sync_once(&self) -> Result<usize, ApiFailure> {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let since = self.cursors.cursor(self.room_id).await;
        let page = self.fetcher.fetch_since(self.room_id, since).await?;

        if self.cycle.load(Ordering::SeqCst) != cycle {
            debug!(room_id = %self.room_id, cycle, "sync: discarding superseded cycle");
            return Ok(0);
        }

        let merged = page.len();
        let newest = page.iter().map(|record| record.created_at).max();
        self.store.merge(page).await;
        if let Some(at) = newest {
            self.cursors.advance(self.room_id, at).await;
        }

        if let Some(presence) = &self.presence {
            match self.fetcher.typing_roster(self.room_id).await {
                Ok(roster) => presence.observe_roster(roster).await,
                Err(err) => debug!(room_id = %self.room_id, "sync: typing poll failed: {err}"),
            }
        }

        debug!(room_id = %self.room_id, cycle, merged, "sync: cycle complete");
        Ok(merged)
    }

    /// Stops scheduling (room not visible) without discarding state.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.kick.notify_one();
    }

    /// Runs an immediate out-of-band cycle, superseding any in-flight one.
    pub fn refresh_now(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = scheduler.sync_once().await {
                warn!(room_id = %scheduler.room_id, "sync: immediate refresh failed: {err}");
            }
        });
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(6);
    let delay = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(exponent));
    delay.min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(2));
        assert_eq!(backoff_delay(7), Duration::from_secs(30));
        assert_eq!(backoff_delay(40), Duration::from_secs(30));
    }
}
