//! Sled Metadata Storage
//!
//! 四棵树在同一事务中更新：
//! - `entries`: key -> bincode(StoredEntry)
//! - `aggregates`: 总大小、条目数、压缩计数、按书/音色分组大小
//! - `state_index`: `{state}\0{last_accessed_be}{key}`，按状态 + 访问时间有序
//! - `access_index`: `{access_count_be}{key}`，最大访问次数取最后一个 key

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{Db, Transactional, Tree};
use std::collections::HashMap;
use std::path::Path;

use crate::application::ports::{MetadataStoragePort, StorageError};
use crate::domain::cache::{CompressionState, EntryMetadata};

const TOTAL_SIZE: &[u8] = b"total_size";
const ENTRY_COUNT: &[u8] = b"entry_count";
const COMPRESSED_COUNT: &[u8] = b"compressed_count";
const BOOK_PREFIX: &str = "book:";
const VOICE_PREFIX: &str = "voice:";
const EMPTY: &[u8] = &[];

/// Sled 元数据存储配置
#[derive(Debug, Clone)]
pub struct SledStoreConfig {
    /// 数据库路径
    pub db_path: String,
}

/// 持久化格式
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    size_bytes: u64,
    created_at: i64,
    last_accessed: i64,
    access_count: u64,
    book_id: Option<String>,
    chapter_index: Option<u32>,
    segment_index: Option<u32>,
    voice_id: String,
    engine_type: String,
    audio_duration_ms: u64,
    compression_state: CompressionState,
    compression_started_at: Option<i64>,
}

impl From<&EntryMetadata> for StoredEntry {
    fn from(entry: &EntryMetadata) -> Self {
        Self {
            key: entry.key.clone(),
            size_bytes: entry.size_bytes,
            created_at: entry.created_at.timestamp_millis(),
            last_accessed: entry.last_accessed.timestamp_millis(),
            access_count: entry.access_count,
            book_id: entry.book_id.clone(),
            chapter_index: entry.chapter_index,
            segment_index: entry.segment_index,
            voice_id: entry.voice_id.clone(),
            engine_type: entry.engine_type.clone(),
            audio_duration_ms: entry.audio_duration_ms,
            compression_state: entry.compression_state,
            compression_started_at: entry.compression_started_at.map(|t| t.timestamp_millis()),
        }
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StorageError::SerializationError(format!("invalid timestamp: {}", millis)))
}

impl TryFrom<StoredEntry> for EntryMetadata {
    type Error = StorageError;

    fn try_from(stored: StoredEntry) -> Result<Self, Self::Error> {
        Ok(EntryMetadata {
            key: stored.key,
            size_bytes: stored.size_bytes,
            created_at: from_millis(stored.created_at)?,
            last_accessed: from_millis(stored.last_accessed)?,
            access_count: stored.access_count,
            book_id: stored.book_id,
            chapter_index: stored.chapter_index,
            segment_index: stored.segment_index,
            voice_id: stored.voice_id,
            engine_type: stored.engine_type,
            audio_duration_ms: stored.audio_duration_ms,
            compression_state: stored.compression_state,
            compression_started_at: stored.compression_started_at.map(from_millis).transpose()?,
        })
    }
}

fn state_prefix(state: CompressionState) -> Vec<u8> {
    let mut key = state.as_str().as_bytes().to_vec();
    key.push(0);
    key
}

fn state_key(entry: &StoredEntry) -> Vec<u8> {
    let mut key = state_prefix(entry.compression_state);
    key.extend_from_slice(&(entry.last_accessed.max(0) as u64).to_be_bytes());
    key.extend_from_slice(entry.key.as_bytes());
    key
}

fn access_key(entry: &StoredEntry) -> Vec<u8> {
    let mut key = entry.access_count.to_be_bytes().to_vec();
    key.extend_from_slice(entry.key.as_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> u64 {
    bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

fn db_err(e: sled::Error) -> StorageError {
    StorageError::DatabaseError(e.to_string())
}

fn tx_err(e: TransactionError<StorageError>) -> StorageError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StorageError::DatabaseError(e.to_string()),
    }
}

fn decode_entry(bytes: &[u8]) -> Result<StoredEntry, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::SerializationError(e.to_string()))
}

/// 事务内视图
struct TxTrees<'a> {
    entries: &'a TransactionalTree,
    aggregates: &'a TransactionalTree,
    states: &'a TransactionalTree,
    access: &'a TransactionalTree,
}

type TxResult<T> = ConflictableTransactionResult<T, StorageError>;

fn abort<T>(e: StorageError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(e))
}

impl TxTrees<'_> {
    fn read(&self, key: &str) -> TxResult<Option<StoredEntry>> {
        match self.entries.get(key.as_bytes())? {
            Some(bytes) => match decode_entry(&bytes) {
                Ok(entry) => Ok(Some(entry)),
                Err(e) => abort(e),
            },
            None => Ok(None),
        }
    }

    fn adjust(&self, counter: &[u8], amount: u64, increase: bool) -> TxResult<()> {
        let current = self
            .aggregates
            .get(counter)?
            .map(|v| decode_u64(&v))
            .unwrap_or(0);
        let next = if increase {
            current.saturating_add(amount)
        } else {
            current.saturating_sub(amount)
        };
        if next == 0 {
            self.aggregates.remove(counter)?;
        } else {
            self.aggregates.insert(counter, next.to_be_bytes().to_vec())?;
        }
        Ok(())
    }

    fn account(&self, entry: &StoredEntry, increase: bool) -> TxResult<()> {
        self.adjust(TOTAL_SIZE, entry.size_bytes, increase)?;
        self.adjust(ENTRY_COUNT, 1, increase)?;
        if entry.compression_state == CompressionState::Compressed {
            self.adjust(COMPRESSED_COUNT, 1, increase)?;
        }
        if let Some(book_id) = &entry.book_id {
            let counter = format!("{}{}", BOOK_PREFIX, book_id);
            self.adjust(counter.as_bytes(), entry.size_bytes, increase)?;
        }
        let counter = format!("{}{}", VOICE_PREFIX, entry.voice_id);
        self.adjust(counter.as_bytes(), entry.size_bytes, increase)?;

        if increase {
            self.states.insert(state_key(entry), EMPTY)?;
            self.access.insert(access_key(entry), EMPTY)?;
        } else {
            self.states.remove(state_key(entry))?;
            self.access.remove(access_key(entry))?;
        }
        Ok(())
    }

    fn put(&self, entry: &StoredEntry) -> TxResult<()> {
        if let Some(old) = self.read(&entry.key)? {
            self.account(&old, false)?;
        }
        let bytes = match bincode::serialize(entry) {
            Ok(bytes) => bytes,
            Err(e) => return abort(StorageError::SerializationError(e.to_string())),
        };
        self.entries.insert(entry.key.as_bytes(), bytes)?;
        self.account(entry, true)
    }

    fn delete(&self, key: &str) -> TxResult<Option<StoredEntry>> {
        let old = self.read(key)?;
        if let Some(old) = &old {
            self.account(old, false)?;
            self.entries.remove(key.as_bytes())?;
        }
        Ok(old)
    }
}

/// Sled 元数据存储
pub struct SledMetadataStorage {
    db: Db,
    entries: Tree,
    aggregates: Tree,
    states: Tree,
    access: Tree,
}

impl SledMetadataStorage {
    /// 创建新的存储实例
    pub fn new(config: &SledStoreConfig) -> Result<Self, StorageError> {
        let db = sled::open(&config.db_path).map_err(db_err)?;
        let storage = Self {
            entries: db.open_tree("entries").map_err(db_err)?,
            aggregates: db.open_tree("aggregates").map_err(db_err)?,
            states: db.open_tree("state_index").map_err(db_err)?,
            access: db.open_tree("access_index").map_err(db_err)?,
            db,
        };

        tracing::info!(
            db_path = %config.db_path,
            entries = storage.entries.len(),
            "SledMetadataStorage initialized"
        );

        Ok(storage)
    }

    /// 打开现有存储
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let config = SledStoreConfig {
            db_path: path.as_ref().to_string_lossy().to_string(),
        };
        Self::new(&config)
    }

    /// 刷新数据库
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(db_err)?;
        Ok(())
    }

    fn transaction<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: Fn(&TxTrees<'_>) -> TxResult<T>,
    {
        (&self.entries, &self.aggregates, &self.states, &self.access)
            .transaction(|(entries, aggregates, states, access)| {
                f(&TxTrees {
                    entries,
                    aggregates,
                    states,
                    access,
                })
            })
            .map_err(tx_err)
    }

    fn load(&self, key: &str) -> Result<Option<EntryMetadata>, StorageError> {
        match self.entries.get(key.as_bytes()).map_err(db_err)? {
            Some(bytes) => Ok(Some(EntryMetadata::try_from(decode_entry(&bytes)?)?)),
            None => Ok(None),
        }
    }

    fn counter(&self, name: &[u8]) -> Result<u64, StorageError> {
        Ok(self
            .aggregates
            .get(name)
            .map_err(db_err)?
            .map(|v| decode_u64(&v))
            .unwrap_or(0))
    }

    fn grouped(&self, prefix: &str) -> Result<HashMap<String, u64>, StorageError> {
        let mut groups = HashMap::new();
        for item in self.aggregates.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item.map_err(db_err)?;
            let name = String::from_utf8_lossy(&key[prefix.len()..]).to_string();
            groups.insert(name, decode_u64(&value));
        }
        Ok(groups)
    }

    fn collect<I>(&self, iter: I) -> Result<Vec<EntryMetadata>, StorageError>
    where
        I: Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
    {
        iter.map(|item| {
            let (_, value) = item.map_err(db_err)?;
            EntryMetadata::try_from(decode_entry(&value)?)
        })
        .collect()
    }
}

#[async_trait]
impl MetadataStoragePort for SledMetadataStorage {
    async fn get(&self, key: &str) -> Result<Option<EntryMetadata>, StorageError> {
        self.load(key)
    }

    async fn contains(&self, key: &str) -> Result<bool, StorageError> {
        self.entries.contains_key(key.as_bytes()).map_err(db_err)
    }

    async fn list_all(&self) -> Result<Vec<EntryMetadata>, StorageError> {
        self.collect(self.entries.iter())
    }

    async fn find_by_key_prefix(&self, prefix: &str) -> Result<Vec<EntryMetadata>, StorageError> {
        self.collect(self.entries.scan_prefix(prefix.as_bytes()))
    }

    async fn count(&self) -> Result<u64, StorageError> {
        self.counter(ENTRY_COUNT)
    }

    async fn upsert(&self, entry: &EntryMetadata) -> Result<(), StorageError> {
        let stored = StoredEntry::from(entry);
        self.transaction(|tx| tx.put(&stored))
    }

    async fn upsert_batch(&self, entries: &[EntryMetadata]) -> Result<(), StorageError> {
        let stored: Vec<StoredEntry> = entries.iter().map(StoredEntry::from).collect();
        self.transaction(|tx| {
            for entry in &stored {
                tx.put(entry)?;
            }
            Ok(())
        })
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        self.transaction(|tx| Ok(tx.delete(key)?.is_some()))
    }

    async fn remove_batch(&self, keys: &[String]) -> Result<u64, StorageError> {
        self.transaction(|tx| {
            let mut removed = 0u64;
            for key in keys {
                if tx.delete(key)?.is_some() {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let at = at.timestamp_millis();
        self.transaction(|tx| match tx.read(key)? {
            Some(mut entry) => {
                entry.access_count = entry.access_count.saturating_add(1);
                entry.last_accessed = at;
                tx.put(&entry)?;
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn total_size(&self) -> Result<u64, StorageError> {
        self.counter(TOTAL_SIZE)
    }

    async fn size_by_book(&self) -> Result<HashMap<String, u64>, StorageError> {
        self.grouped(BOOK_PREFIX)
    }

    async fn size_by_voice(&self) -> Result<HashMap<String, u64>, StorageError> {
        self.grouped(VOICE_PREFIX)
    }

    async fn compressed_count(&self) -> Result<u64, StorageError> {
        self.counter(COMPRESSED_COUNT)
    }

    async fn max_access_count(&self) -> Result<u64, StorageError> {
        Ok(self
            .access
            .last()
            .map_err(db_err)?
            .map(|(key, _)| decode_u64(&key))
            .unwrap_or(0))
    }

    async fn find_by_state(
        &self,
        state: CompressionState,
        accessed_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<EntryMetadata>, StorageError> {
        let prefix = state_prefix(state);
        let cutoff = accessed_before.map(|t| t.timestamp_millis().max(0) as u64);
        let mut found = Vec::new();

        for item in self.states.scan_prefix(&prefix) {
            if found.len() >= limit {
                break;
            }
            let (index_key, _) = item.map_err(db_err)?;
            let rest = &index_key[prefix.len()..];
            let accessed = decode_u64(rest);
            if cutoff.map_or(false, |cutoff| accessed >= cutoff) {
                // 索引按访问时间升序，后面不会再有满足条件的条目
                break;
            }
            let key = String::from_utf8_lossy(&rest[8..]).to_string();
            if let Some(entry) = self.load(&key)? {
                found.push(entry);
            }
        }

        Ok(found)
    }

    async fn find_stale_compressing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<EntryMetadata>, StorageError> {
        let prefix = state_prefix(CompressionState::Compressing);
        let mut stale = Vec::new();

        for item in self.states.scan_prefix(&prefix) {
            let (index_key, _) = item.map_err(db_err)?;
            let key = String::from_utf8_lossy(&index_key[prefix.len() + 8..]).to_string();
            if let Some(entry) = self.load(&key)? {
                let is_stale = entry
                    .compression_started_at
                    .map_or(true, |started| started < started_before);
                if is_stale {
                    stale.push(entry);
                }
            }
        }

        Ok(stale)
    }

    async fn update_compression_state(
        &self,
        key: &str,
        from: CompressionState,
        to: CompressionState,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError> {
        let started_at = started_at.map(|t| t.timestamp_millis());
        self.transaction(|tx| match tx.read(key)? {
            Some(mut entry) if entry.compression_state == from => {
                entry.compression_state = to;
                entry.compression_started_at = started_at;
                tx.put(&entry)?;
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    async fn replace_entry(
        &self,
        old_key: &str,
        expected: CompressionState,
        new_entry: &EntryMetadata,
    ) -> Result<(), StorageError> {
        let stored = StoredEntry::from(new_entry);
        self.transaction(|tx| {
            match tx.read(old_key)? {
                None => return abort(StorageError::NotFound(old_key.to_string())),
                Some(old) if old.compression_state != expected => {
                    return abort(StorageError::Conflict(format!(
                        "{} is no longer {}",
                        old_key,
                        expected.as_str()
                    )));
                }
                Some(_) => {}
            }
            tx.delete(old_key)?;
            tx.put(&stored)
        })
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let keys = self
            .entries
            .iter()
            .keys()
            .map(|key| {
                key.map(|key| String::from_utf8_lossy(&key).to_string())
                    .map_err(db_err)
            })
            .collect::<Result<Vec<_>, _>>()?;

        // 逐条删除并同步聚合与索引，期间并发写入的条目保持一致
        self.transaction(|tx| {
            for key in &keys {
                tx.delete(key)?;
            }
            Ok(())
        })
    }
}
