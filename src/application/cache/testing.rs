//! 缓存管理器测试夹具

use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use super::{CacheManager, CacheManagerConfig};
use crate::domain::cache::EntryMetadata;
use crate::infrastructure::events::EventPublisher;
use crate::infrastructure::persistence::sqlite::{
    create_pool, run_migrations, DatabaseConfig, SqliteMetadataStorage,
};

pub async fn manager_with(config: CacheManagerConfig) -> CacheManager {
    let pool = create_pool(&DatabaseConfig::in_memory()).await.unwrap();
    run_migrations(&pool).await.unwrap();
    let storage = Arc::new(SqliteMetadataStorage::new(pool));
    CacheManager::new(config, storage, EventPublisher::new().arc())
        .await
        .unwrap()
}

pub async fn manager(max_size_bytes: u64) -> (TempDir, CacheManager) {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(CacheManagerConfig::new(dir.path(), max_size_bytes)).await;
    (dir, manager)
}

pub async fn write_file(path: &Path, size: usize) {
    tokio::fs::write(path, vec![0u8; size]).await.unwrap();
}

/// 直接写入文件与记录，绕过注册时的配额检查
pub async fn seed(
    manager: &CacheManager,
    key: &str,
    size: u64,
    last_accessed: DateTime<Utc>,
) -> EntryMetadata {
    write_file(&manager.raw_path(key), size as usize).await;
    let mut entry = EntryMetadata::new_raw(key, "kokoro-af", size);
    entry.created_at = last_accessed;
    entry.last_accessed = last_accessed;
    manager.storage().upsert(&entry).await.unwrap();
    entry
}
