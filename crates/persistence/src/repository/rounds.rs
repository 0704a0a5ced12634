//! Rounds repository: the observed outcome stream

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A stored round. The multiplier is kept as its decimal text.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RoundRecord {
    pub id: i64,
    pub multiplier: String,
    pub observed_at: i64,
}

/// Repository for rounds. Every read ignores rows whose id is not an integer.
pub struct RoundRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> RoundRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a round (INSERT OR IGNORE by id). Returns false when the id was already recorded.
    pub async fn insert(&self, record: &RoundRecord) -> DbResult<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO rounds (id, multiplier, observed_at) VALUES (?1, ?2, ?3)",
        )
        .bind(record.id)
        .bind(&record.multiplier)
        .bind(record.observed_at)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// The newest `limit` rounds, newest first
    pub async fn recent(&self, limit: i64) -> DbResult<Vec<RoundRecord>> {
        let records = sqlx::query_as::<_, RoundRecord>(
            r#"SELECT id, multiplier, observed_at FROM rounds
               WHERE typeof(id) = 'integer'
               ORDER BY id DESC
               LIMIT ?1"#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Highest integer round id, if any round exists
    pub async fn latest_id(&self) -> DbResult<Option<i64>> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(id) FROM rounds WHERE typeof(id) = 'integer'")
                .fetch_one(self.pool)
                .await?;

        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn round(id: i64, multiplier: &str) -> RoundRecord {
        RoundRecord {
            id,
            multiplier: multiplier.to_string(),
            observed_at: id * 1000,
        }
    }

    #[tokio::test]
    async fn test_recent_is_newest_first_and_skips_legacy_ids() {
        let db = Database::in_memory().await.unwrap();
        let repo = RoundRepository::new(db.pool());
        for (id, m) in [(1, "2.50"), (2, "1.10"), (3, "1.30")] {
            assert!(repo.insert(&round(id, m)).await.unwrap());
        }
        sqlx::query("INSERT INTO rounds (id, multiplier, observed_at) VALUES ('legacy-a', '9.99', 0)")
            .execute(db.pool())
            .await
            .unwrap();

        let recent = repo.recent(10).await.unwrap();
        let ids: Vec<i64> = recent.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert_eq!(repo.latest_id().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_ignored() {
        let db = Database::in_memory().await.unwrap();
        let repo = RoundRepository::new(db.pool());
        assert!(repo.insert(&round(7, "1.50")).await.unwrap());
        assert!(!repo.insert(&round(7, "3.00")).await.unwrap());

        let recent = repo.recent(1).await.unwrap();
        assert_eq!(recent[0].multiplier, "1.50");
    }

    #[tokio::test]
    async fn test_latest_id_empty() {
        let db = Database::in_memory().await.unwrap();
        let repo = RoundRepository::new(db.pool());
        assert_eq!(repo.latest_id().await.unwrap(), None);
    }
}
