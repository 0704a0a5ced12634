//! Daily stats repository: per-day counters

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// One row per local calendar day (`YYYY-MM-DD`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DailyStatsRecord {
    pub date: String,
    pub wins: i64,
    pub losses: i64,
    pub signals_sent: i64,
    pub today_wins: i64,
    pub today_losses: i64,
}

/// Repository for daily counters.
///
/// Every write is a single statement so concurrent writers never lose an
/// increment; `today_wins` is re-derived in the same statement whenever
/// `signals_sent` or `today_losses` changes.
pub struct DailyStatsRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> DailyStatsRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the day's row if it does not exist yet
    pub async fn ensure(&self, date: &str) -> DbResult<()> {
        sqlx::query("INSERT OR IGNORE INTO daily_stats (date) VALUES (?1)")
            .bind(date)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, date: &str) -> DbResult<Option<DailyStatsRecord>> {
        let record = sqlx::query_as::<_, DailyStatsRecord>(
            r#"SELECT date, wins, losses, signals_sent, today_wins, today_losses
               FROM daily_stats WHERE date = ?1"#,
        )
        .bind(date)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// A signal was sent today
    pub async fn record_signal_sent(&self, date: &str) -> DbResult<()> {
        self.ensure(date).await?;
        sqlx::query(
            r#"UPDATE daily_stats
               SET signals_sent = signals_sent + 1,
                   today_wins = MAX(0, signals_sent + 1 - today_losses),
                   updated_at = strftime('%s', 'now')
               WHERE date = ?1"#,
        )
        .bind(date)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_win(&self, date: &str) -> DbResult<()> {
        self.ensure(date).await?;
        sqlx::query(
            r#"UPDATE daily_stats
               SET wins = wins + 1, updated_at = strftime('%s', 'now')
               WHERE date = ?1"#,
        )
        .bind(date)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_loss(&self, date: &str) -> DbResult<()> {
        self.ensure(date).await?;
        sqlx::query(
            r#"UPDATE daily_stats
               SET losses = losses + 1,
                   today_losses = today_losses + 1,
                   today_wins = MAX(0, signals_sent - (today_losses + 1)),
                   updated_at = strftime('%s', 'now')
               WHERE date = ?1"#,
        )
        .bind(date)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Display reset after the second loss: the next messages read one loss, no wins
    pub async fn reset_display_counters(&self, date: &str) -> DbResult<()> {
        sqlx::query(
            r#"UPDATE daily_stats
               SET wins = 0, losses = 1, updated_at = strftime('%s', 'now')
               WHERE date = ?1"#,
        )
        .bind(date)
        .execute(self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    const DAY: &str = "2026-03-14";

    #[tokio::test]
    async fn test_missing_day_is_none() {
        let db = Database::in_memory().await.unwrap();
        let repo = DailyStatsRepository::new(db.pool());
        assert!(repo.get(DAY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_today_wins_tracks_signals_minus_losses() {
        let db = Database::in_memory().await.unwrap();
        let repo = DailyStatsRepository::new(db.pool());

        repo.record_signal_sent(DAY).await.unwrap();
        repo.record_signal_sent(DAY).await.unwrap();
        repo.record_win(DAY).await.unwrap();
        repo.record_loss(DAY).await.unwrap();

        let stats = repo.get(DAY).await.unwrap().unwrap();
        assert_eq!(stats.signals_sent, 2);
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.today_losses, 1);
        assert_eq!(stats.today_wins, 1);
    }

    #[tokio::test]
    async fn test_today_wins_never_negative() {
        let db = Database::in_memory().await.unwrap();
        let repo = DailyStatsRepository::new(db.pool());

        repo.record_loss(DAY).await.unwrap();
        let stats = repo.get(DAY).await.unwrap().unwrap();
        assert_eq!(stats.today_wins, 0);
    }

    #[tokio::test]
    async fn test_reset_display_counters_keeps_totals() {
        let db = Database::in_memory().await.unwrap();
        let repo = DailyStatsRepository::new(db.pool());

        repo.record_signal_sent(DAY).await.unwrap();
        repo.record_win(DAY).await.unwrap();
        repo.record_loss(DAY).await.unwrap();
        repo.record_loss(DAY).await.unwrap();
        repo.reset_display_counters(DAY).await.unwrap();

        let stats = repo.get(DAY).await.unwrap().unwrap();
        assert_eq!((stats.wins, stats.losses), (0, 1));
        assert_eq!(stats.today_losses, 2);
        assert_eq!(stats.signals_sent, 1);
    }
}
