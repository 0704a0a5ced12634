//! Engine state repository: one versioned JSON document

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// Well-known key of the governance document
pub const STATE_KEY: &str = "state";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EngineStateRecord {
    pub document: String,
    pub version: i64,
}

/// Repository for the engine governance document.
///
/// Writers read the record, change the document and write it back with
/// `compare_and_swap`, which only succeeds if nobody else wrote in between.
pub struct EngineStateRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> EngineStateRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn load(&self) -> DbResult<Option<EngineStateRecord>> {
        let record = sqlx::query_as::<_, EngineStateRecord>(
            "SELECT document, version FROM engine_state WHERE id = ?1",
        )
        .bind(STATE_KEY)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Write `document` if the stored version still equals `expected_version`
    /// (`None` = the document does not exist yet). Returns false on a lost race.
    pub async fn compare_and_swap(
        &self,
        expected_version: Option<i64>,
        document: &str,
    ) -> DbResult<bool> {
        let result = match expected_version {
            None => {
                sqlx::query(
                    "INSERT OR IGNORE INTO engine_state (id, document, version) VALUES (?1, ?2, 1)",
                )
                .bind(STATE_KEY)
                .bind(document)
                .execute(self.pool)
                .await?
            }
            Some(version) => {
                sqlx::query(
                    r#"UPDATE engine_state
                       SET document = ?1, version = version + 1, updated_at = strftime('%s', 'now')
                       WHERE id = ?2 AND version = ?3"#,
                )
                .bind(document)
                .bind(STATE_KEY)
                .bind(version)
                .execute(self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn test_first_write_creates_version_one() {
        let db = Database::in_memory().await.unwrap();
        let repo = EngineStateRepository::new(db.pool());

        assert!(repo.load().await.unwrap().is_none());
        assert!(repo.compare_and_swap(None, "{}").await.unwrap());

        let record = repo.load().await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.document, "{}");
    }

    #[tokio::test]
    async fn test_stale_version_loses() {
        let db = Database::in_memory().await.unwrap();
        let repo = EngineStateRepository::new(db.pool());

        repo.compare_and_swap(None, r#"{"a":1}"#).await.unwrap();
        assert!(repo.compare_and_swap(Some(1), r#"{"a":2}"#).await.unwrap());
        assert!(!repo.compare_and_swap(Some(1), r#"{"a":3}"#).await.unwrap());
        assert!(!repo.compare_and_swap(None, r#"{"a":4}"#).await.unwrap());

        let record = repo.load().await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.document, r#"{"a":2}"#);
    }
}
