//! Metadata Storage Port - 缓存元数据持久化
//!
//! 缓存管理器只通过该接口访问元数据，具体实现为 SQLite 或 Sled。
//! 所有聚合查询（总大小、按书/音色分组、压缩计数）必须由后端直接回答，
//! 调用方不需要把整个元数据集加载到内存。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

use crate::domain::cache::{CompressionState, EntryMetadata};

/// 元数据存储错误
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("State conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Metadata Storage Port
#[async_trait]
pub trait MetadataStoragePort: Send + Sync {
    /// 按 key 查询
    async fn get(&self, key: &str) -> Result<Option<EntryMetadata>, StorageError>;

    /// 是否存在
    async fn contains(&self, key: &str) -> Result<bool, StorageError>;

    /// 全量列出（淘汰扫描、启动对账）
    async fn list_all(&self) -> Result<Vec<EntryMetadata>, StorageError>;

    /// key 以 prefix 开头的条目
    async fn find_by_key_prefix(&self, prefix: &str) -> Result<Vec<EntryMetadata>, StorageError>;

    async fn count(&self) -> Result<u64, StorageError>;

    /// 插入或覆盖
    async fn upsert(&self, entry: &EntryMetadata) -> Result<(), StorageError>;

    /// 批量插入或覆盖（单事务）
    async fn upsert_batch(&self, entries: &[EntryMetadata]) -> Result<(), StorageError>;

    /// 删除，返回是否存在
    async fn remove(&self, key: &str) -> Result<bool, StorageError>;

    /// 批量删除（单事务），返回删除数量
    async fn remove_batch(&self, keys: &[String]) -> Result<u64, StorageError>;

    /// 原子地增加访问计数并刷新 last_accessed，返回条目是否存在
    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StorageError>;

    async fn total_size(&self) -> Result<u64, StorageError>;

    async fn size_by_book(&self) -> Result<HashMap<String, u64>, StorageError>;

    async fn size_by_voice(&self) -> Result<HashMap<String, u64>, StorageError>;

    async fn compressed_count(&self) -> Result<u64, StorageError>;

    /// 当前所有条目中的最大访问次数
    async fn max_access_count(&self) -> Result<u64, StorageError>;

    /// 按压缩状态列出
    ///
    /// `accessed_before` 过滤掉最近访问过的条目，结果按 last_accessed 升序，
    /// 最多返回 `limit` 条
    async fn find_by_state(
        &self,
        state: CompressionState,
        accessed_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<EntryMetadata>, StorageError>;

    /// Compressing 且开始时间早于 `started_before` 的条目
    async fn find_stale_compressing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<EntryMetadata>, StorageError>;

    /// 原子地更新压缩状态（compare-and-set）
    ///
    /// 仅当当前状态为 `from` 时生效，同时写入 `started_at`
    /// （进入 Compressing 时设置，其余状态应传 None）。返回是否生效。
    async fn update_compression_state(
        &self,
        key: &str,
        from: CompressionState,
        to: CompressionState,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError>;

    /// 原子替换：在同一事务中删除 `old_key` 并插入 `new_entry`
    ///
    /// 仅当 `old_key` 当前处于 `expected` 状态时生效。
    /// `old_key` 不存在返回 `StorageError::NotFound`，状态不符返回
    /// `StorageError::Conflict`，两种情况都不插入新记录
    async fn replace_entry(
        &self,
        old_key: &str,
        expected: CompressionState,
        new_entry: &EntryMetadata,
    ) -> Result<(), StorageError>;

    /// 清空全部元数据
    async fn clear(&self) -> Result<(), StorageError>;
}
