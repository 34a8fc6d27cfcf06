#![forbid(unsafe_code)]

//! Relay persistence layer for Skyward.
//!
//! All structs in this module mirror how relay state is serialized to disk
//! and exposed to the API: the approved-talent whitelist, the cached
//! approved-video ids, the secret-name lookup table and the persisted
//! now-playing row.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};

/// Row stored in the `talents` table: one approved YouTube channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TalentRecord {
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_at: Option<String>,
}

/// Row stored in the `videos` table: one approved video id plus the
/// metadata the player surfaces next to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedVideo {
    pub video_id: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
    #[serde(default)]
    pub live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<String>,
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS talents (
            channel_id TEXT PRIMARY KEY,
            display_name TEXT DEFAULT '',
            added_at TEXT
        );

        CREATE TABLE IF NOT EXISTS videos (
            video_id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL,
            title TEXT DEFAULT '',
            published_at TEXT,
            live INTEGER NOT NULL DEFAULT 0,
            approved_at TEXT
        );

        CREATE TABLE IF NOT EXISTS secret_refs (
            name TEXT PRIMARY KEY,
            locator TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS playback (
            slot INTEGER PRIMARY KEY CHECK (slot = 1),
            video_id TEXT NOT NULL,
            updated_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_videos_channel ON videos(channel_id);
        CREATE INDEX IF NOT EXISTS idx_videos_published ON videos(published_at);
        "#,
    )
    .await?;
    Ok(())
}

/// Wrapper around the SQLite-compatible connection that performs write
/// operations.
#[derive(Debug)]
pub struct RelayStore {
    conn: Connection,
}

impl RelayStore {
    /// Opens (and if necessary creates) the relay DB and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating relay directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening relay DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;

        let store = Self { conn };
        ensure_schema(&store.conn).await?;
        Ok(store)
    }

    /// Inserts or updates an approved talent. Stamps `added_at` on first
    /// write when the caller does not provide one.
    pub async fn upsert_talent(&self, record: &TalentRecord) -> Result<()> {
        let added_at = record
            .added_at
            .clone()
            .unwrap_or_else(|| Utc::now().to_rfc3339());

        self.conn
            .execute(
                r#"
                INSERT INTO talents (channel_id, display_name, added_at)
                VALUES (:channel_id, :display_name, :added_at)
                ON CONFLICT(channel_id) DO UPDATE SET
                    display_name = excluded.display_name
                "#,
                params![
                    record.channel_id.as_str(),
                    record.display_name.as_str(),
                    added_at,
                ],
            )
            .await?;

        Ok(())
    }

    /// Removes a talent from the whitelist. Cached videos stay behind so the
    /// player keeps working; they simply stop being refreshed.
    pub async fn remove_talent(&self, channel_id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM talents WHERE channel_id = ?1",
                params![channel_id],
            )
            .await?;
        Ok(affected > 0)
    }

    /// Inserts or updates a cached approved video.
    pub async fn upsert_video(&self, record: &CachedVideo) -> Result<()> {
        let approved_at = record
            .approved_at
            .clone()
            .unwrap_or_else(|| Utc::now().to_rfc3339());

        self.conn
            .execute(
                r#"
                INSERT INTO videos (
                    video_id, channel_id, title, published_at, live, approved_at
                ) VALUES (
                    :video_id, :channel_id, :title, :published_at, :live, :approved_at
                )
                ON CONFLICT(video_id) DO UPDATE SET
                    channel_id = excluded.channel_id,
                    title = excluded.title,
                    published_at = excluded.published_at,
                    live = excluded.live
                "#,
                params![
                    record.video_id.as_str(),
                    record.channel_id.as_str(),
                    record.title.as_str(),
                    record.published_at.as_deref(),
                    record.live as i64,
                    approved_at,
                ],
            )
            .await?;

        Ok(())
    }

    /// Registers (or repoints) the locator for a named secret.
    pub async fn upsert_secret_ref(&self, name: &str, locator: &str) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO secret_refs (name, locator)
                VALUES (:name, :locator)
                ON CONFLICT(name) DO UPDATE SET
                    locator = excluded.locator
                "#,
                params![name, locator],
            )
            .await?;
        Ok(())
    }

    /// Persists the operator-selected now-playing video id. Single-row table;
    /// the slot check keeps it that way.
    pub async fn set_now_playing(&self, video_id: &str) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO playback (slot, video_id, updated_at)
                VALUES (1, :video_id, :updated_at)
                ON CONFLICT(slot) DO UPDATE SET
                    video_id = excluded.video_id,
                    updated_at = excluded.updated_at
                "#,
                params![video_id, Utc::now().to_rfc3339()],
            )
            .await?;
        Ok(())
    }
}

/// Read-only companion to [`RelayStore`], mirroring the writer's schema
/// bootstrap so either side can be opened first.
#[derive(Clone)]
pub struct RelayReader {
    conn: Connection,
}

impl RelayReader {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let db = Builder::new_local(path.as_ref())
            .build()
            .await
            .with_context(|| format!("opening relay DB {}", path.as_ref().display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    pub async fn list_talents(&self) -> Result<Vec<TalentRecord>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT channel_id, display_name, added_at
                FROM talents
                ORDER BY added_at ASC, channel_id ASC
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let mut talents = Vec::new();
        while let Some(row) = rows.next().await? {
            talents.push(row_to_talent(&row)?);
        }
        Ok(talents)
    }

    pub async fn get_talent(&self, channel_id: &str) -> Result<Option<TalentRecord>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT channel_id, display_name, added_at
                FROM talents
                WHERE channel_id = ?1
                "#,
            )
            .await?;

        let mut rows = stmt.query([channel_id]).await?;
        if let Some(row) = rows.next().await? {
            Ok(Some(row_to_talent(&row)?))
        } else {
            Ok(None)
        }
    }

    /// Newest-first listing of the approved-video cache.
    pub async fn list_videos(&self) -> Result<Vec<CachedVideo>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT video_id, channel_id, title, published_at, live, approved_at
                FROM videos
                ORDER BY published_at DESC, rowid DESC
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next().await? {
            videos.push(row_to_video(&row)?);
        }
        Ok(videos)
    }

    pub async fn get_video(&self, video_id: &str) -> Result<Option<CachedVideo>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT video_id, channel_id, title, published_at, live, approved_at
                FROM videos
                WHERE video_id = ?1
                "#,
            )
            .await?;

        let mut rows = stmt.query([video_id]).await?;
        if let Some(row) = rows.next().await? {
            Ok(Some(row_to_video(&row)?))
        } else {
            Ok(None)
        }
    }

    /// Most recently published cached video, used as the player fallback when
    /// no now-playing row has been pushed yet.
    pub async fn latest_video(&self) -> Result<Option<CachedVideo>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT video_id, channel_id, title, published_at, live, approved_at
                FROM videos
                ORDER BY published_at DESC, rowid DESC
                LIMIT 1
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![]).await?;
        if let Some(row) = rows.next().await? {
            Ok(Some(row_to_video(&row)?))
        } else {
            Ok(None)
        }
    }

    /// Exact-match locator lookup for a named secret. Absent rows come back
    /// as `None`; the resolver turns that into its not-found error rather
    /// than treating an empty value as a secret.
    pub async fn secret_locator(&self, name: &str) -> Result<Option<String>> {
        let stmt = self
            .conn
            .prepare("SELECT locator FROM secret_refs WHERE name = ?1")
            .await?;

        let mut rows = stmt.query([name]).await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(row.get(0)?))
    }

    pub async fn now_playing(&self) -> Result<Option<String>> {
        let stmt = self
            .conn
            .prepare("SELECT video_id FROM playback WHERE slot = 1")
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(row.get(0)?))
    }
}

fn row_to_talent(row: &Row) -> Result<TalentRecord> {
    Ok(TalentRecord {
        channel_id: row.get(0)?,
        display_name: row.get(1)?,
        added_at: row.get(2)?,
    })
}

/// Converts a SQL row into a `CachedVideo` while normalizing the boolean
/// flag stored as an INTEGER in SQLite.
fn row_to_video(row: &Row) -> Result<CachedVideo> {
    Ok(CachedVideo {
        video_id: row.get(0)?,
        channel_id: row.get(1)?,
        title: row.get(2)?,
        published_at: row.get(3)?,
        live: row.get::<i64>(4).map(|value| value != 0)?,
        approved_at: row.get(5)?,
    })
}
