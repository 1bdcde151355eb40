//! SQLite-based experiment store

use crate::persistence::{ExperimentRecord, ExperimentStore, PersistenceError, StoreSession};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// SQLite experiment store
#[derive(Clone)]
pub struct SqliteExperimentStore {
    pool: SqlitePool,
}

impl SqliteExperimentStore {
    /// Create a new SQLite store
    pub async fn new(db_path: &str) -> Result<Self> {
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", db_path))
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("expipe");
        std::fs::create_dir_all(&db_dir)?;

        let db_path = db_dir.join("experiments.db");
        let db_path = db_path
            .to_str()
            .context("Database path is not valid UTF-8")?;
        Self::new(db_path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS experiments (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                begin_at TEXT,
                end_at TEXT,
                version INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_experiment_name ON experiments(name);
            CREATE INDEX IF NOT EXISTS idx_experiment_begin ON experiments(begin_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn from_row(row: &SqliteRow) -> Result<ExperimentRecord, PersistenceError> {
        let id = Uuid::parse_str(&row.get::<String, _>("id"))
            .map_err(|e| PersistenceError::Database(e.to_string()))?;

        Ok(ExperimentRecord {
            id,
            name: row.get("name"),
            begin: row.get::<Option<NaiveDateTime>, _>("begin_at").map(Self::from_naive),
            end: row.get::<Option<NaiveDateTime>, _>("end_at").map(Self::from_naive),
            version: row.get("version"),
        })
    }
}

fn db_error(e: sqlx::Error) -> PersistenceError {
    PersistenceError::Database(e.to_string())
}

#[async_trait::async_trait]
impl ExperimentStore for SqliteExperimentStore {
    async fn persist_experiment(
        &self,
        record: &ExperimentRecord,
    ) -> Result<(ExperimentRecord, Box<dyn StoreSession>), PersistenceError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO experiments (id, name, begin_at, end_at, version)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.name)
        .bind(record.begin.map(Self::to_naive))
        .bind(record.end.map(Self::to_naive))
        .bind(record.version)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        let stored = self
            .load_experiment(record.id)
            .await?
            .ok_or_else(|| PersistenceError::Database(format!("experiment {} vanished", record.id)))?;

        let session = SqliteSession {
            pool: self.pool.clone(),
            pending: None,
            closed: false,
        };

        Ok((stored, Box::new(session)))
    }

    async fn load_experiment(&self, id: Uuid) -> Result<Option<ExperimentRecord>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, begin_at, end_at, version
            FROM experiments
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_experiments(&self) -> Result<Vec<ExperimentRecord>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, begin_at, end_at, version
            FROM experiments
            ORDER BY begin_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::from_row).collect()
    }
}

/// Session over a [`SqliteExperimentStore`]
struct SqliteSession {
    pool: SqlitePool,
    pending: Option<ExperimentRecord>,
    closed: bool,
}

#[async_trait::async_trait]
impl StoreSession for SqliteSession {
    fn add(&mut self, record: &ExperimentRecord) -> Result<(), PersistenceError> {
        if self.closed {
            return Err(PersistenceError::InvalidRequest(
                "session is closed".to_string(),
            ));
        }
        self.pending = Some(record.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<Option<ExperimentRecord>, PersistenceError> {
        if self.closed {
            return Err(PersistenceError::InvalidRequest(
                "session is closed".to_string(),
            ));
        }

        let Some(mut pending) = self.pending.take() else {
            return Ok(None);
        };

        let result = sqlx::query(
            r#"
            UPDATE experiments
            SET name = ?1, begin_at = ?2, end_at = ?3, version = version + 1
            WHERE id = ?4 AND version = ?5
            "#,
        )
        .bind(&pending.name)
        .bind(pending.begin.map(SqliteExperimentStore::to_naive))
        .bind(pending.end.map(SqliteExperimentStore::to_naive))
        .bind(pending.id.to_string())
        .bind(pending.version)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::StaleData { id: pending.id });
        }

        pending.version += 1;
        Ok(Some(pending))
    }

    async fn refresh(&mut self, id: Uuid) -> Result<Option<ExperimentRecord>, PersistenceError> {
        if self.closed {
            return Err(PersistenceError::InvalidRequest(
                "session is closed".to_string(),
            ));
        }

        let row = sqlx::query(
            r#"
            SELECT id, name, begin_at, end_at, version
            FROM experiments
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(SqliteExperimentStore::from_row).transpose()
    }

    fn close(&mut self) {
        self.pending = None;
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteExperimentStore {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.into_path().join("experiments.db");
        SqliteExperimentStore::new(path.to_str().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let store = store().await;
        let (mut record, mut session) = store
            .persist_experiment(&ExperimentRecord::new("raw"))
            .await
            .unwrap();
        assert_eq!(record.version, 0);

        record.begin = Some(Utc::now());
        session.add(&record).unwrap();
        let committed = session.commit().await.unwrap().unwrap();
        assert_eq!(committed.version, 1);

        let loaded = store.load_experiment(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "raw");
        assert_eq!(loaded.version, 1);
        assert!(loaded.begin.is_some());
        assert!(loaded.end.is_none());
    }

    #[tokio::test]
    async fn test_sqlite_stale_data() {
        let store = store().await;
        let record = ExperimentRecord::new("raw");
        let (a, mut session_a) = store.persist_experiment(&record).await.unwrap();
        let (b, mut session_b) = store.persist_experiment(&record).await.unwrap();

        session_a.add(&a).unwrap();
        session_a.commit().await.unwrap();

        session_b.add(&b).unwrap();
        assert!(matches!(
            session_b.commit().await,
            Err(PersistenceError::StaleData { .. })
        ));

        let fresh = session_b.refresh(record.id).await.unwrap().unwrap();
        assert_eq!(fresh.version, 1);
        session_b.add(&fresh).unwrap();
        assert_eq!(session_b.commit().await.unwrap().unwrap().version, 2);
    }
}
