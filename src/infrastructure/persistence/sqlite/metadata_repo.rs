//! SQLite Metadata Storage

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::FromRow;
use std::collections::HashMap;

use super::DbPool;
use crate::application::ports::{MetadataStoragePort, StorageError};
use crate::domain::cache::{CompressionState, EntryMetadata};

const SELECT_COLUMNS: &str = "SELECT key, size_bytes, created_at, last_accessed, access_count, book_id, chapter_index, segment_index, voice_id, engine_type, audio_duration_ms, compression_state, compression_started_at FROM cache_entries";

const UPSERT_SQL: &str = r#"
    INSERT INTO cache_entries (key, size_bytes, created_at, last_accessed, access_count, book_id, chapter_index, segment_index, voice_id, engine_type, audio_duration_ms, compression_state, compression_started_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(key) DO UPDATE SET
        size_bytes = excluded.size_bytes,
        created_at = excluded.created_at,
        last_accessed = excluded.last_accessed,
        access_count = excluded.access_count,
        book_id = excluded.book_id,
        chapter_index = excluded.chapter_index,
        segment_index = excluded.segment_index,
        voice_id = excluded.voice_id,
        engine_type = excluded.engine_type,
        audio_duration_ms = excluded.audio_duration_ms,
        compression_state = excluded.compression_state,
        compression_started_at = excluded.compression_started_at
"#;

/// SQLite Metadata Storage
pub struct SqliteMetadataStorage {
    pool: DbPool,
}

impl SqliteMetadataStorage {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct CacheEntryRow {
    key: String,
    size_bytes: i64,
    created_at: i64,
    last_accessed: i64,
    access_count: i64,
    book_id: Option<String>,
    chapter_index: Option<i64>,
    segment_index: Option<i64>,
    voice_id: String,
    engine_type: String,
    audio_duration_ms: i64,
    compression_state: String,
    compression_started_at: Option<i64>,
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StorageError::SerializationError(format!("invalid timestamp: {}", millis)))
}

impl TryFrom<CacheEntryRow> for EntryMetadata {
    type Error = StorageError;

    fn try_from(row: CacheEntryRow) -> Result<Self, Self::Error> {
        let compression_state = CompressionState::from_str(&row.compression_state).ok_or_else(
            || {
                StorageError::SerializationError(format!(
                    "unknown compression state: {}",
                    row.compression_state
                ))
            },
        )?;

        Ok(EntryMetadata {
            key: row.key,
            size_bytes: row.size_bytes.max(0) as u64,
            created_at: from_millis(row.created_at)?,
            last_accessed: from_millis(row.last_accessed)?,
            access_count: row.access_count.max(0) as u64,
            book_id: row.book_id,
            chapter_index: row.chapter_index.map(|i| i as u32),
            segment_index: row.segment_index.map(|i| i as u32),
            voice_id: row.voice_id,
            engine_type: row.engine_type,
            audio_duration_ms: row.audio_duration_ms.max(0) as u64,
            compression_state,
            compression_started_at: row.compression_started_at.map(from_millis).transpose()?,
        })
    }
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::DatabaseError(e.to_string())
}

/// 绑定 upsert 的全部参数
fn bind_entry<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    entry: &'q EntryMetadata,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&entry.key)
        .bind(entry.size_bytes as i64)
        .bind(entry.created_at.timestamp_millis())
        .bind(entry.last_accessed.timestamp_millis())
        .bind(entry.access_count as i64)
        .bind(&entry.book_id)
        .bind(entry.chapter_index.map(|i| i as i64))
        .bind(entry.segment_index.map(|i| i as i64))
        .bind(&entry.voice_id)
        .bind(&entry.engine_type)
        .bind(entry.audio_duration_ms as i64)
        .bind(entry.compression_state.as_str())
        .bind(entry.compression_started_at.map(|t| t.timestamp_millis()))
}

#[async_trait]
impl MetadataStoragePort for SqliteMetadataStorage {
    async fn get(&self, key: &str) -> Result<Option<EntryMetadata>, StorageError> {
        let row: Option<CacheEntryRow> =
            sqlx::query_as(&format!("{} WHERE key = ?", SELECT_COLUMNS))
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

        row.map(EntryMetadata::try_from).transpose()
    }

    async fn contains(&self, key: &str) -> Result<bool, StorageError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM cache_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(found.is_some())
    }

    async fn list_all(&self) -> Result<Vec<EntryMetadata>, StorageError> {
        let rows: Vec<CacheEntryRow> = sqlx::query_as(SELECT_COLUMNS)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(EntryMetadata::try_from).collect()
    }

    async fn find_by_key_prefix(&self, prefix: &str) -> Result<Vec<EntryMetadata>, StorageError> {
        // substr 比较区分大小写，LIKE 对 ASCII 不区分
        let rows: Vec<CacheEntryRow> = sqlx::query_as(&format!(
            "{} WHERE substr(key, 1, ?) = ? ORDER BY key",
            SELECT_COLUMNS
        ))
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(EntryMetadata::try_from).collect()
    }

    async fn count(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(count.max(0) as u64)
    }

    async fn upsert(&self, entry: &EntryMetadata) -> Result<(), StorageError> {
        bind_entry(sqlx::query(UPSERT_SQL), entry)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(())
    }

    async fn upsert_batch(&self, entries: &[EntryMetadata]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for entry in entries {
            bind_entry(sqlx::query(UPSERT_SQL), entry)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_batch(&self, keys: &[String]) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut removed = 0u64;
        for key in keys {
            let result = sqlx::query("DELETE FROM cache_entries WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            removed += result.rows_affected();
        }
        tx.commit().await.map_err(db_err)?;

        Ok(removed)
    }

    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE cache_entries SET access_count = access_count + 1, last_accessed = ? WHERE key = ?",
        )
        .bind(at.timestamp_millis())
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn total_size(&self) -> Result<u64, StorageError> {
        let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(size_bytes), 0) FROM cache_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(total.max(0) as u64)
    }

    async fn size_by_book(&self) -> Result<HashMap<String, u64>, StorageError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT book_id, SUM(size_bytes) FROM cache_entries WHERE book_id IS NOT NULL GROUP BY book_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|(book_id, size)| (book_id, size.max(0) as u64))
            .collect())
    }

    async fn size_by_voice(&self) -> Result<HashMap<String, u64>, StorageError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT voice_id, SUM(size_bytes) FROM cache_entries GROUP BY voice_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|(voice_id, size)| (voice_id, size.max(0) as u64))
            .collect())
    }

    async fn compressed_count(&self) -> Result<u64, StorageError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries WHERE compression_state = ?")
                .bind(CompressionState::Compressed.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;

        Ok(count.max(0) as u64)
    }

    async fn max_access_count(&self) -> Result<u64, StorageError> {
        let max: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(access_count), 0) FROM cache_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(max.max(0) as u64)
    }

    async fn find_by_state(
        &self,
        state: CompressionState,
        accessed_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<EntryMetadata>, StorageError> {
        let before = accessed_before.map(|t| t.timestamp_millis());
        let rows: Vec<CacheEntryRow> = sqlx::query_as(&format!(
            "{} WHERE compression_state = ? AND (? IS NULL OR last_accessed < ?) ORDER BY last_accessed ASC LIMIT ?",
            SELECT_COLUMNS
        ))
        .bind(state.as_str())
        .bind(before)
        .bind(before)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(EntryMetadata::try_from).collect()
    }

    async fn find_stale_compressing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<EntryMetadata>, StorageError> {
        // 没有开始时间的 Compressing 记录同样视为过期
        let rows: Vec<CacheEntryRow> = sqlx::query_as(&format!(
            "{} WHERE compression_state = ? AND (compression_started_at IS NULL OR compression_started_at < ?)",
            SELECT_COLUMNS
        ))
        .bind(CompressionState::Compressing.as_str())
        .bind(started_before.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(EntryMetadata::try_from).collect()
    }

    async fn update_compression_state(
        &self,
        key: &str,
        from: CompressionState,
        to: CompressionState,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE cache_entries SET compression_state = ?, compression_started_at = ? WHERE key = ? AND compression_state = ?",
        )
        .bind(to.as_str())
        .bind(started_at.map(|t| t.timestamp_millis()))
        .bind(key)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn replace_entry(
        &self,
        old_key: &str,
        expected: CompressionState,
        new_entry: &EntryMetadata,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let deleted =
            sqlx::query("DELETE FROM cache_entries WHERE key = ? AND compression_state = ?")
                .bind(old_key)
                .bind(expected.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

        if deleted.rows_affected() == 0 {
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT key FROM cache_entries WHERE key = ?")
                    .bind(old_key)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?;
            tx.rollback().await.map_err(db_err)?;
            return Err(match exists {
                Some(_) => StorageError::Conflict(format!(
                    "{} is no longer {}",
                    old_key,
                    expected.as_str()
                )),
                None => StorageError::NotFound(old_key.to_string()),
            });
        }

        bind_entry(sqlx::query(UPSERT_SQL), new_entry)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(())
    }
}
