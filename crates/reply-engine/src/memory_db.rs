//! SQLite-backed message history
//!
//! Shares the engagement database so a restarted engine recounts segments
//! against the same transcript the checkpoint was built from.

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::{EngineError, EngineResult};
use crate::memory::{Message, MessageHistory};

const HISTORY_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    text TEXT NOT NULL,
    ts_micros INTEGER NOT NULL,
    interest_score REAL NOT NULL DEFAULT 0,
    mentions_agent INTEGER NOT NULL DEFAULT 0,
    is_vip INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts ON messages(conversation_id, ts_micros, seq);
";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, text, ts_micros, interest_score, mentions_agent, is_vip";

pub struct SqliteMessageHistory {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteMessageHistory {
    /// Uses an existing pool, creating the table if needed.
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> EngineResult<Self> {
        {
            let conn = pool.get()?;
            conn.execute_batch(HISTORY_SCHEMA_SQL)?;
        }
        info!("Message history table ready");
        Ok(Self { pool })
    }

    fn get_conn(&self) -> EngineResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(EngineError::from)
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
        let micros: i64 = row.get(4)?;
        let timestamp = DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Integer, "timestamp out of range".into())
        })?;
        Ok(Message {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            text: row.get(3)?,
            timestamp,
            interest_score: row.get(5)?,
            mentions_agent: row.get::<_, i64>(6)? != 0,
            is_vip: row.get::<_, i64>(7)? != 0,
        })
    }

    fn query_messages(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> EngineResult<Vec<Message>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, Self::row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    fn query_count(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> EngineResult<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(sql, params, |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    fn try_record(&self, message: &Message) -> EngineResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO messages
             (id, conversation_id, sender_id, text, ts_micros, interest_score, mentions_agent, is_vip)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id,
                message.conversation_id,
                message.sender_id,
                message.text,
                message.timestamp.timestamp_micros(),
                message.interest_score,
                message.mentions_agent as i64,
                message.is_vip as i64,
            ],
        )?;
        Ok(())
    }

    fn try_prune(&self, conversation_id: &str, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        let conn = self.get_conn()?;
        let removed = conn.execute(
            "DELETE FROM messages WHERE conversation_id = ?1 AND ts_micros < ?2",
            params![conversation_id, cutoff.timestamp_micros()],
        )?;
        Ok(removed)
    }
}

fn log_failure<T: Default>(what: &str, conversation_id: &str, result: EngineResult<T>) -> T {
    result.unwrap_or_else(|e| {
        error!("[{}] message history {} failed: {}", conversation_id, what, e);
        T::default()
    })
}

impl MessageHistory for SqliteMessageHistory {
    fn record(&self, message: &Message) {
        log_failure("insert", &message.conversation_id, self.try_record(message));
    }

    fn messages_before(&self, conversation_id: &str, before: DateTime<Utc>, limit: usize) -> Vec<Message> {
        let sql = format!(
            "SELECT {} FROM messages WHERE conversation_id = ?1 AND ts_micros < ?2
             ORDER BY ts_micros DESC, seq DESC LIMIT ?3",
            MESSAGE_COLUMNS
        );
        let mut messages = log_failure(
            "lookup",
            conversation_id,
            self.query_messages(&sql, params![conversation_id, before.timestamp_micros(), limit as i64]),
        );
        messages.reverse();
        messages
    }

    fn messages_after(&self, conversation_id: &str, after: DateTime<Utc>, limit: usize) -> Vec<Message> {
        let sql = format!(
            "SELECT {} FROM messages WHERE conversation_id = ?1 AND ts_micros > ?2
             ORDER BY ts_micros, seq LIMIT ?3",
            MESSAGE_COLUMNS
        );
        log_failure(
            "lookup",
            conversation_id,
            self.query_messages(&sql, params![conversation_id, after.timestamp_micros(), limit as i64]),
        )
    }

    fn messages_in_range(&self, conversation_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Message> {
        if end < start {
            return Vec::new();
        }
        let sql = format!(
            "SELECT {} FROM messages WHERE conversation_id = ?1 AND ts_micros >= ?2 AND ts_micros <= ?3
             ORDER BY ts_micros, seq",
            MESSAGE_COLUMNS
        );
        log_failure(
            "lookup",
            conversation_id,
            self.query_messages(
                &sql,
                params![conversation_id, start.timestamp_micros(), end.timestamp_micros()],
            ),
        )
    }

    fn count_between(&self, conversation_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        if end <= start {
            return 0;
        }
        log_failure(
            "count",
            conversation_id,
            self.query_count(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND ts_micros > ?2 AND ts_micros < ?3",
                params![conversation_id, start.timestamp_micros(), end.timestamp_micros()],
            ),
        )
    }

    fn count_in_range(&self, conversation_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        if end < start {
            return 0;
        }
        log_failure(
            "count",
            conversation_id,
            self.query_count(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND ts_micros >= ?2 AND ts_micros <= ?3",
                params![conversation_id, start.timestamp_micros(), end.timestamp_micros()],
            ),
        )
    }

    fn prune_before(&self, conversation_id: &str, cutoff: DateTime<Utc>) -> usize {
        let removed = log_failure("prune", conversation_id, self.try_prune(conversation_id, cutoff));
        if removed > 0 {
            debug!("[{}] pruned {} messages older than {}", conversation_id, removed, cutoff);
        }
        removed
    }
}
