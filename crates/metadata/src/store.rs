//! Metadata store trait and implementations.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::FileRepo;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: FileRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    query_timeout: Duration,
}

impl SqliteStore {
    /// Create a new SQLite store.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout = Duration::from_secs(query_timeout_secs.unwrap_or(30));

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection avoids
            // persistent "database is locked" failures under axum concurrency.
            .max_connections(1)
            .acquire_timeout(query_timeout)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            query_timeout,
        };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            query_timeout_secs = query_timeout.as_secs(),
            "Opened SQLite metadata store"
        );

        Ok(store)
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        with_timeout(self.query_timeout, sqlx::query("SELECT 1").execute(&self.pool)).await?;
        Ok(())
    }
}

async fn with_timeout<F, T>(limit: Duration, fut: F) -> MetadataResult<T>
where
    F: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(MetadataError::Internal(format!(
            "query exceeded {}s timeout",
            limit.as_secs()
        ))),
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::{FileRecordRow, NewFileRecord};
    use filevault_core::FileId;

    #[async_trait]
    impl FileRepo for SqliteStore {
        async fn record_version(&self, record: &NewFileRecord) -> MetadataResult<FileRecordRow> {
            let size = i64::try_from(record.size).map_err(|_| {
                MetadataError::Internal(format!("size {} does not fit the schema", record.size))
            })?;

            let result = sqlx::query_as::<_, FileRecordRow>(
                r#"
                INSERT INTO file_records (
                    file_id, owner_id, parent_file_id, version_id,
                    file_name, size, content_type, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING *
                "#,
            )
            .bind(record.file_id.as_uuid())
            .bind(&record.owner_id)
            .bind(record.parent_file_id.map(|p| *p.as_uuid()))
            .bind(record.version_id.as_str())
            .bind(&record.file_name)
            .bind(size)
            .bind(&record.content_type)
            .bind(record.created_at)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(row) => Ok(row),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    Err(MetadataError::AlreadyExists(format!(
                        "file {} version {}",
                        record.file_id, record.version_id
                    )))
                }
                Err(e) => Err(e.into()),
            }
        }

        async fn list_by_owner(&self, owner_id: &str) -> MetadataResult<Vec<FileRecordRow>> {
            let rows = sqlx::query_as::<_, FileRecordRow>(
                r#"
                SELECT r.* FROM file_records r
                WHERE r.owner_id = ?
                  AND r.record_id = (
                    SELECT MAX(l.record_id) FROM file_records l
                    WHERE l.file_id = r.file_id AND l.owner_id = r.owner_id
                  )
                ORDER BY r.record_id DESC
                "#,
            )
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn get_latest(
            &self,
            owner_id: &str,
            file_id: &FileId,
        ) -> MetadataResult<Option<FileRecordRow>> {
            let row = sqlx::query_as::<_, FileRecordRow>(
                r#"
                SELECT * FROM file_records
                WHERE owner_id = ? AND file_id = ?
                ORDER BY record_id DESC
                LIMIT 1
                "#,
            )
            .bind(owner_id)
            .bind(file_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_history(
            &self,
            owner_id: &str,
            file_id: &FileId,
        ) -> MetadataResult<Vec<FileRecordRow>> {
            let rows = sqlx::query_as::<_, FileRecordRow>(
                "SELECT * FROM file_records WHERE owner_id = ? AND file_id = ? ORDER BY record_id ASC",
            )
            .bind(owner_id)
            .bind(file_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_latest(&self, owner_id: &str, file_id: &FileId) -> MetadataResult<bool> {
            // Single statement, so no other writer can slip a newer record in between
            let result = sqlx::query(
                r#"
                DELETE FROM file_records
                WHERE record_id = (
                    SELECT MAX(record_id) FROM file_records
                    WHERE owner_id = ? AND file_id = ?
                )
                "#,
            )
            .bind(owner_id)
            .bind(file_id.as_uuid())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS file_records (
    record_id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id BLOB NOT NULL,
    owner_id TEXT NOT NULL,
    parent_file_id BLOB,
    version_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    size INTEGER NOT NULL,
    content_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (file_id, version_id)
);

CREATE INDEX IF NOT EXISTS idx_file_records_owner_file
    ON file_records (owner_id, file_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewFileRecord;
    use filevault_core::{FileId, VersionId};
    use time::OffsetDateTime;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("metadata.db"), None)
            .await
            .unwrap();
        (dir, store)
    }

    fn record(owner: &str, file_id: FileId, version: &str, size: u64) -> NewFileRecord {
        NewFileRecord {
            file_id,
            owner_id: owner.to_string(),
            parent_file_id: None,
            version_id: VersionId::parse(version).unwrap(),
            file_name: format!("{version}.bin"),
            size,
            content_type: "application/octet-stream".to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_record_and_fetch_latest() {
        let (_dir, store) = store().await;
        let file_id = FileId::new();

        let first = store
            .record_version(&record("alice", file_id, "v1", 10))
            .await
            .unwrap();
        let second = store
            .record_version(&record("alice", file_id, "v2", 20))
            .await
            .unwrap();
        assert!(second.record_id > first.record_id);

        let latest = store.get_latest("alice", &file_id).await.unwrap().unwrap();
        assert_eq!(latest.version_id, "v2");
        let converted = latest.into_record().unwrap();
        assert_eq!(converted.file_id, file_id);
        assert_eq!(converted.size, 20);

        let history = store.list_history("alice", &file_id).await.unwrap();
        let versions: Vec<_> = history.iter().map(|r| r.version_id.as_str()).collect();
        assert_eq!(versions, vec!["v1", "v2"]);

        assert!(store.get_latest("bob", &file_id).await.unwrap().is_none());
        assert!(store.list_history("bob", &file_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_version_rejected() {
        let (_dir, store) = store().await;
        let file_id = FileId::new();
        store
            .record_version(&record("alice", file_id, "v1", 1))
            .await
            .unwrap();
        let err = store
            .record_version(&record("alice", file_id, "v1", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_list_by_owner_returns_latest_per_file() {
        let (_dir, store) = store().await;
        let a = FileId::new();
        let b = FileId::new();
        store.record_version(&record("alice", a, "a1", 1)).await.unwrap();
        store.record_version(&record("alice", b, "b1", 2)).await.unwrap();
        store.record_version(&record("alice", a, "a2", 3)).await.unwrap();
        store.record_version(&record("bob", FileId::new(), "c1", 4)).await.unwrap();

        let rows = store.list_by_owner("alice").await.unwrap();
        let versions: Vec<_> = rows.iter().map(|r| r.version_id.as_str()).collect();
        assert_eq!(versions, vec!["a2", "b1"]);
    }

    #[tokio::test]
    async fn test_delete_latest_reverts_and_is_idempotent() {
        let (_dir, store) = store().await;
        let file_id = FileId::new();
        store.record_version(&record("alice", file_id, "v1", 1)).await.unwrap();
        store.record_version(&record("alice", file_id, "v2", 2)).await.unwrap();

        // Another owner cannot remove it
        assert!(!store.delete_latest("bob", &file_id).await.unwrap());

        assert!(store.delete_latest("alice", &file_id).await.unwrap());
        let latest = store.get_latest("alice", &file_id).await.unwrap().unwrap();
        assert_eq!(latest.version_id, "v1");

        assert!(store.delete_latest("alice", &file_id).await.unwrap());
        assert!(!store.delete_latest("alice", &file_id).await.unwrap());
        assert!(!store.delete_latest("alice", &FileId::new()).await.unwrap());
        assert!(store.list_by_owner("alice").await.unwrap().is_empty());
    }
}
