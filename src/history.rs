#![forbid(unsafe_code)]

//! Per-chat message history in a SQLite-compatible database.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, params};

use crate::chat::InboundMessage;

pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub chat_id: i64,
    pub recorded_at: DateTime<Utc>,
    pub text: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl HistoryEntry {
    /// `"{timestamp} - {text}"` as shown to users.
    pub fn display_line(&self) -> String {
        format!("{} - {}", self.recorded_at.format("%Y-%m-%d %H:%M:%S"), self.text)
    }
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS message_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id INTEGER NOT NULL,
            recorded_at TEXT NOT NULL,
            first_name TEXT,
            last_name TEXT,
            text TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_history_chat_time
            ON message_history(chat_id, recorded_at);
        "#,
    )
    .await?;
    Ok(())
}

#[derive(Debug)]
pub struct HistoryStore {
    conn: Connection,
}

impl HistoryStore {
    /// Opens (creating if needed) the database and its schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating history directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening history DB {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    pub async fn record(&self, message: &InboundMessage, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO message_history (chat_id, recorded_at, first_name, last_name, text)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    message.chat_id,
                    timestamp(at),
                    message.first_name.as_deref(),
                    message.last_name.as_deref(),
                    message.text.as_str(),
                ],
            )
            .await
            .context("recording message history")?;
        Ok(())
    }

    /// Most recent entries for `chat_id`, newest first.
    pub async fn recent(&self, chat_id: i64, limit: usize) -> Result<Vec<HistoryEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT chat_id, recorded_at, text, first_name, last_name
                FROM message_history
                WHERE chat_id = ?1
                ORDER BY recorded_at DESC, id DESC
                LIMIT ?2
                "#,
                params![chat_id, limit],
            )
            .await
            .context("reading message history")?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(row_to_entry(&row)?);
        }
        Ok(entries)
    }
}

/// Fixed-width UTC form so text ordering matches time ordering.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_entry(row: &Row) -> Result<HistoryEntry> {
    let recorded_at: String = row.get(1)?;
    Ok(HistoryEntry {
        chat_id: row.get(0)?,
        recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
            .with_context(|| format!("parsing history timestamp {recorded_at}"))?
            .with_timezone(&Utc),
        text: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
    })
}
