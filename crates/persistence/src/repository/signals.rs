//! Signals repository: lifecycle rows with a store-enforced single open signal

use crate::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_WON: &str = "won";
pub const STATUS_LOST: &str = "lost";

const SIGNAL_COLUMNS: &str = "id, trigger_round_id, target, status, gale_depth, result_round_id, \
     result_multiplier, notification_ref, created_at, resolved_at";

/// A persisted signal row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SignalRecord {
    pub id: i64,
    pub trigger_round_id: i64,
    pub target: String,
    pub status: String,
    pub gale_depth: i64,
    pub result_round_id: Option<i64>,
    pub result_multiplier: Option<String>,
    pub notification_ref: Option<String>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

/// Terminal write for an open signal
#[derive(Debug, Clone)]
pub struct SignalResolution<'r> {
    pub status: &'r str,
    pub result_round_id: i64,
    pub result_multiplier: &'r str,
    pub resolved_at: i64,
}

/// Repository for signals
pub struct SignalRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SignalRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new active signal. Fails with `DbError::Conflict` when another
    /// signal is still open (UNIQUE on open_slot).
    pub async fn insert_open(
        &self,
        trigger_round_id: i64,
        target: &str,
        created_at: i64,
    ) -> DbResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO signals (trigger_round_id, target, status, gale_depth, open_slot, created_at)
               VALUES (?1, ?2, ?3, 0, 1, ?4)"#,
        )
        .bind(trigger_round_id)
        .bind(target)
        .bind(STATUS_ACTIVE)
        .bind(created_at)
        .execute(self.pool)
        .await
        .map_err(DbError::from_write)?;

        Ok(result.last_insert_rowid())
    }

    /// The single open (active or gale) signal, if any
    pub async fn find_open(&self) -> DbResult<Option<SignalRecord>> {
        let sql = format!("SELECT {SIGNAL_COLUMNS} FROM signals WHERE open_slot = 1");
        let record = sqlx::query_as::<_, SignalRecord>(&sql)
            .fetch_optional(self.pool)
            .await?;

        Ok(record)
    }

    /// Move an open signal one gale step deeper. Returns false if the signal is
    /// no longer open at `from_depth` (another caller got there first).
    pub async fn escalate(
        &self,
        id: i64,
        from_depth: i64,
        to_status: &str,
        to_depth: i64,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"UPDATE signals SET status = ?1, gale_depth = ?2
               WHERE id = ?3 AND open_slot = 1 AND gale_depth = ?4"#,
        )
        .bind(to_status)
        .bind(to_depth)
        .bind(id)
        .bind(from_depth)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Close an open signal as won or lost, releasing the open slot.
    /// Returns false if the signal was already moved past `expected_depth`.
    pub async fn resolve(
        &self,
        id: i64,
        expected_depth: i64,
        resolution: &SignalResolution<'_>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"UPDATE signals
               SET status = ?1, open_slot = NULL, result_round_id = ?2,
                   result_multiplier = ?3, resolved_at = ?4
               WHERE id = ?5 AND open_slot = 1 AND gale_depth = ?6"#,
        )
        .bind(resolution.status)
        .bind(resolution.result_round_id)
        .bind(resolution.result_multiplier)
        .bind(resolution.resolved_at)
        .bind(id)
        .bind(expected_depth)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Remember the notification the signal's follow-ups thread onto
    pub async fn set_notification_ref(&self, id: i64, reference: &str) -> DbResult<()> {
        sqlx::query("UPDATE signals SET notification_ref = ?1 WHERE id = ?2")
            .bind(reference)
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Resolved signals created in `[start, end)`, oldest first
    pub async fn resolved_created_between(
        &self,
        start: i64,
        end: i64,
    ) -> DbResult<Vec<SignalRecord>> {
        let sql = format!(
            r#"SELECT {SIGNAL_COLUMNS} FROM signals
               WHERE status IN (?1, ?2) AND created_at >= ?3 AND created_at < ?4
               ORDER BY created_at ASC, id ASC"#
        );
        let records = sqlx::query_as::<_, SignalRecord>(&sql)
            .bind(STATUS_WON)
            .bind(STATUS_LOST)
            .bind(start)
            .bind(end)
            .fetch_all(self.pool)
            .await?;

        Ok(records)
    }

    /// Resolved signals created at or after `since`, oldest first
    pub async fn resolved_created_since(&self, since: i64) -> DbResult<Vec<SignalRecord>> {
        let sql = format!(
            r#"SELECT {SIGNAL_COLUMNS} FROM signals
               WHERE status IN (?1, ?2) AND created_at >= ?3
               ORDER BY created_at ASC, id ASC"#
        );
        let records = sqlx::query_as::<_, SignalRecord>(&sql)
            .bind(STATUS_WON)
            .bind(STATUS_LOST)
            .bind(since)
            .fetch_all(self.pool)
            .await?;

        Ok(records)
    }

    /// Statuses of the most recently resolved signals, newest first
    pub async fn recent_resolved_statuses(&self, limit: i64) -> DbResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"SELECT status FROM signals
               WHERE status IN (?1, ?2)
               ORDER BY resolved_at DESC, id DESC
               LIMIT ?3"#,
        )
        .bind(STATUS_WON)
        .bind(STATUS_LOST)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().map(|(s,)| s).collect())
    }
}
