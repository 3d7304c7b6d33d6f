//! Persisted client state: the last-seen cursor per room.
//!
//! Typing timers and delivery states are deliberately not stored here; they
//! are ephemeral and die with the session.

use std::{fs, path::Path, str::FromStr};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use shared::domain::RoomId;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

#[derive(Clone)]
pub struct ClientStateDb {
    pool: Pool<Sqlite>,
}

impl ClientStateDb {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn cursor_for_room(&self, room_id: RoomId) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_seen_at FROM room_cursors WHERE room_id = ?")
            .bind(room_id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.try_get(0)?;
        let cursor = DateTime::parse_from_rfc3339(&raw)
            .with_context(|| format!("malformed cursor for room {room_id}: {raw}"))?
            .with_timezone(&Utc);
        Ok(Some(cursor))
    }

    /// Advances the room cursor, never moving it backwards. Returns whether
    /// the stored cursor changed.
    pub async fn advance_cursor(&self, room_id: RoomId, at: DateTime<Utc>) -> Result<bool> {
        // Fixed-width UTC timestamps so the SQL text comparison below orders
        // the same way the timestamps do.
        let encoded = at.to_rfc3339_opts(SecondsFormat::Micros, true);
        let result = sqlx::query(
            "INSERT INTO room_cursors (room_id, last_seen_at) VALUES (?, ?)
             ON CONFLICT(room_id) DO UPDATE SET
                 last_seen_at = excluded.last_seen_at,
                 updated_at = CURRENT_TIMESTAMP
             WHERE excluded.last_seen_at > room_cursors.last_seen_at",
        )
        .bind(room_id.0.to_string())
        .bind(encoded)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear_room(&self, room_id: RoomId) -> Result<()> {
        sqlx::query("DELETE FROM room_cursors WHERE room_id = ?")
            .bind(room_id.0.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or(path);
    if path == ":memory:" {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create sqlite parent dir {parent:?}"))?;
        }
    }
    Ok(())
}
