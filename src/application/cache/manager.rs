//! Cache Manager - 音频缓存编排
//!
//! 查找、注册、pin 与批量维护。元数据存储是唯一事实来源，
//! 管理器不持有任何内存镜像。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::pins::{PinGuard, PinRegistry};
use crate::application::error::CacheError;
use crate::application::ports::{MetadataStoragePort, PlaybackStatePort};
use crate::domain::cache::{
    infer_engine_type, is_valid_stem, CacheKey, CompressionState, EntryMetadata, EvictionScorer,
    ScoringPolicy, COMPRESSED_EXTENSION, RAW_EXTENSION, TEMP_EXTENSION,
};
use crate::infrastructure::events::EventPublisher;

/// 缓存管理器配置
#[derive(Debug, Clone)]
pub struct CacheManagerConfig {
    /// 缓存目录
    pub cache_dir: PathBuf,
    /// 配额（字节）
    pub max_size_bytes: u64,
    /// 用量告警阈值（百分比）
    pub warning_threshold_percent: f64,
    /// 淘汰目标占配额的百分比
    pub headroom_percent: f64,
    /// 原始文件必须大于该值才视为写入完整
    pub min_valid_size_bytes: u64,
    /// 压缩文件扩展名
    pub compressed_extension: String,
    pub scoring: ScoringPolicy,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./data/cache/audio"),
            max_size_bytes: 500 * 1024 * 1024, // 500 MB
            warning_threshold_percent: 90.0,
            headroom_percent: 90.0,
            min_valid_size_bytes: 44, // WAV 头
            compressed_extension: COMPRESSED_EXTENSION.to_string(),
            scoring: ScoringPolicy::default(),
        }
    }
}

impl CacheManagerConfig {
    pub fn new(cache_dir: impl Into<PathBuf>, max_size_bytes: u64) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_size_bytes,
            ..Default::default()
        }
    }
}

/// 注册参数
///
/// voice/engine 缺省时从 key 推断
#[derive(Debug, Clone, Default)]
pub struct RegisterEntry {
    pub size_bytes: u64,
    pub voice_id: Option<String>,
    pub engine_type: Option<String>,
    pub book_id: Option<String>,
    pub chapter_index: Option<u32>,
    pub segment_index: Option<u32>,
    pub audio_duration_ms: u64,
}

/// 淘汰/清理结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvictionReport {
    pub size_before: u64,
    pub size_after: u64,
    pub evicted_keys: Vec<String>,
    pub freed_bytes: u64,
    /// 文件删除失败而保留的条目数
    pub failed: usize,
    pub skipped_pinned: usize,
}

/// 缓存统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_entries: u64,
    pub total_size_bytes: u64,
    pub max_size_bytes: u64,
    pub usage_percent: f64,
    pub compressed_entries: u64,
    pub pinned_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// 磁盘上的单个文件
#[derive(Debug, Clone)]
pub(crate) struct DiskFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl DiskFile {
    pub(crate) async fn stat(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).await.ok()?;
        if !meta.is_file() {
            return None;
        }
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Some(Self {
            path: path.to_path_buf(),
            size: meta.len(),
            modified,
        })
    }
}

/// 音频缓存管理器
pub struct CacheManager {
    pub(crate) config: CacheManagerConfig,
    max_size_bytes: AtomicU64,
    pub(crate) storage: Arc<dyn MetadataStoragePort>,
    pub(crate) scorer: EvictionScorer,
    pub(crate) pins: Arc<PinRegistry>,
    pub(crate) events: Arc<EventPublisher>,
    pub(crate) playback: Option<Arc<dyn PlaybackStatePort>>,
    /// 串行化淘汰、批量删除与对账
    pub(crate) maintenance: Mutex<()>,
    warning_active: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheManager {
    /// 创建缓存管理器，确保缓存目录存在
    pub async fn new(
        config: CacheManagerConfig,
        storage: Arc<dyn MetadataStoragePort>,
        events: Arc<EventPublisher>,
    ) -> Result<Self, CacheError> {
        fs::create_dir_all(&config.cache_dir).await?;

        tracing::info!(
            cache_dir = %config.cache_dir.display(),
            max_size_bytes = config.max_size_bytes,
            "Audio cache manager initialized"
        );

        Ok(Self {
            max_size_bytes: AtomicU64::new(config.max_size_bytes),
            scorer: EvictionScorer::new(config.scoring.clone()),
            config,
            storage,
            pins: Arc::new(PinRegistry::new()),
            events,
            playback: None,
            maintenance: Mutex::new(()),
            warning_active: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// 注入播放状态来源，用于构建淘汰上下文
    pub fn with_playback_state(mut self, playback: Arc<dyn PlaybackStatePort>) -> Self {
        self.playback = Some(playback);
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn config(&self) -> &CacheManagerConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn MetadataStoragePort> {
        &self.storage
    }

    pub fn events(&self) -> &Arc<EventPublisher> {
        &self.events
    }

    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes.load(Ordering::Relaxed)
    }

    /// 调整配额，下一次淘汰生效
    pub fn set_max_size_bytes(&self, bytes: u64) {
        self.max_size_bytes.store(bytes, Ordering::Relaxed);
        tracing::info!(max_size_bytes = bytes, "Audio cache quota updated");
    }

    pub fn raw_path(&self, key: &str) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("{}.{}", key, RAW_EXTENSION))
    }

    pub fn compressed_path(&self, key: &str) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("{}.{}", key, self.config.compressed_extension))
    }

    /// 压缩中间文件路径，每次调用唯一
    pub fn temp_path(&self, key: &str) -> PathBuf {
        self.config.cache_dir.join(format!(
            "{}.{}.{}",
            key,
            Uuid::new_v4().simple(),
            TEMP_EXTENSION
        ))
    }

    // ========================================================================
    // 查找
    // ========================================================================

    /// key 对应的原始文件路径（文件不一定存在）
    pub async fn file_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        ensure_valid_key(key)?;
        fs::create_dir_all(&self.config.cache_dir).await?;
        Ok(self.raw_path(key))
    }

    /// 可播放文件：优先压缩文件，其次完整的原始文件
    pub async fn playable_file_for(&self, key: &str) -> Option<PathBuf> {
        self.playable_file(key).await.map(|file| file.path)
    }

    pub async fn is_ready(&self, key: &str) -> bool {
        self.playable_file(key).await.is_some()
    }

    async fn playable_file(&self, key: &str) -> Option<DiskFile> {
        if !is_valid_stem(key) {
            return None;
        }

        if let Some(compressed) = DiskFile::stat(&self.compressed_path(key)).await {
            if compressed.size > 0 {
                return Some(compressed);
            }
        }

        DiskFile::stat(&self.raw_path(key))
            .await
            .filter(|raw| raw.size > self.config.min_valid_size_bytes)
    }

    /// 记录一次访问
    ///
    /// 返回是否命中。文件不完整时视为未命中；有文件无记录时自动收养。
    pub async fn mark_used(&self, key: &str) -> Result<bool, CacheError> {
        let Some(file) = self.playable_file(key).await else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key, "Cache miss");
            return Ok(false);
        };
        self.hits.fetch_add(1, Ordering::Relaxed);

        let now = Utc::now();
        if self.storage.touch(key, now).await? {
            return Ok(true);
        }

        let compressed = file.path != self.raw_path(key);
        let mut entry = self.orphan_entry(key, &file, compressed);
        entry.last_accessed = now;
        entry.access_count = 1;
        self.storage.upsert(&entry).await?;

        tracing::info!(
            key,
            size_bytes = entry.size_bytes,
            state = %entry.compression_state,
            "Adopted orphan cache file on access"
        );
        Ok(true)
    }

    /// 从孤儿文件推断元数据
    pub(crate) fn orphan_entry(&self, key: &str, file: &DiskFile, compressed: bool) -> EntryMetadata {
        let voice_id = CacheKey::parse(key)
            .map(|k| k.voice_id().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let mut entry = EntryMetadata::new_raw(key, voice_id.clone(), file.size);
        entry.engine_type = infer_engine_type(&voice_id);
        entry.created_at = file.modified;
        entry.last_accessed = file.modified;
        if compressed {
            entry.compression_state = CompressionState::Compressed;
        }
        entry
    }

    pub async fn entry(&self, key: &str) -> Result<Option<EntryMetadata>, CacheError> {
        Ok(self.storage.get(key).await?)
    }

    // ========================================================================
    // 注册
    // ========================================================================

    /// 注册一个已完整写入的原始文件，随后执行配额检查
    pub async fn register_entry(
        &self,
        key: &str,
        params: RegisterEntry,
    ) -> Result<EntryMetadata, CacheError> {
        ensure_valid_key(key)?;

        let voice_id = params
            .voice_id
            .or_else(|| CacheKey::parse(key).map(|k| k.voice_id().to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        let engine_type = params
            .engine_type
            .unwrap_or_else(|| infer_engine_type(&voice_id));

        let mut entry = EntryMetadata::new_raw(key, voice_id, params.size_bytes);
        entry.engine_type = engine_type;
        entry.book_id = params.book_id;
        entry.chapter_index = params.chapter_index;
        entry.segment_index = params.segment_index;
        entry.audio_duration_ms = params.audio_duration_ms;

        // 重新合成后旧的压缩文件不再代表当前记录
        remove_file_if_exists(&self.compressed_path(key)).await?;

        self.storage.upsert(&entry).await?;

        tracing::debug!(
            key,
            size_bytes = entry.size_bytes,
            book_id = ?entry.book_id,
            segment_index = ?entry.segment_index,
            "Registered cache entry"
        );

        if let Err(e) = self.evict_if_needed(None).await {
            tracing::warn!(key, error = %e, "Quota enforcement after registration failed");
        }

        Ok(entry)
    }

    // ========================================================================
    // Pin
    // ========================================================================

    /// 固定 key，使其免于淘汰；由未固定变为固定时返回 true
    pub fn pin(&self, key: &str) -> bool {
        let changed = self.pins.pin(key);
        if changed {
            tracing::trace!(key, "Pinned cache entry");
        }
        changed
    }

    /// 释放一个持有者；变为未固定时返回 true
    pub fn unpin(&self, key: &str) -> bool {
        let changed = self.pins.unpin(key);
        if changed {
            tracing::trace!(key, "Unpinned cache entry");
        }
        changed
    }

    pub fn is_pinned(&self, key: &str) -> bool {
        self.pins.is_pinned(key)
    }

    /// 作用域 pin，guard drop 时释放
    pub fn pin_guard(&self, key: &str) -> PinGuard {
        PinGuard::new(self.pins.clone(), key)
    }

    // ========================================================================
    // 批量维护
    // ========================================================================

    pub async fn total_size(&self) -> Result<u64, CacheError> {
        Ok(self.storage.total_size().await?)
    }

    pub async fn usage_by_book(&self) -> Result<HashMap<String, u64>, CacheError> {
        Ok(self.storage.size_by_book().await?)
    }

    pub async fn usage_by_voice(&self) -> Result<HashMap<String, u64>, CacheError> {
        Ok(self.storage.size_by_voice().await?)
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let total_size_bytes = self.storage.total_size().await?;
        let max_size_bytes = self.max_size_bytes();
        let usage_percent = if max_size_bytes > 0 {
            total_size_bytes as f64 * 100.0 / max_size_bytes as f64
        } else {
            0.0
        };

        Ok(CacheStats {
            total_entries: self.storage.count().await?,
            total_size_bytes,
            max_size_bytes,
            usage_percent,
            compressed_entries: self.storage.compressed_count().await?,
            pinned_entries: self.pins.pinned_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        })
    }

    /// 删除 key 以指定前缀开头的所有未固定条目，返回删除条目数
    pub async fn delete_by_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let _pass = self.maintenance.lock().await;
        self.delete_matching(prefix).await
    }

    /// 清空所有未固定条目，返回删除条目数
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let _pass = self.maintenance.lock().await;

        if !self.pins.is_empty() {
            return self.delete_matching("").await;
        }

        let count = self.storage.count().await? as usize;
        let mut failed = 0usize;
        for files in self.scan_dir().await?.into_values() {
            for path in files.paths() {
                if let Err(e) = remove_file_if_exists(&path).await {
                    failed += 1;
                    tracing::warn!(path = %path.display(), error = %e, "Failed to delete cache file");
                }
            }
        }

        if failed > 0 {
            // 逐条删除，保留文件仍在的记录
            return self.delete_matching("").await;
        }

        self.storage.clear().await?;
        tracing::info!(entries = count, "Audio cache cleared");
        Ok(count)
    }

    async fn delete_matching(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut deleted = 0usize;
        let mut known = HashSet::new();

        for entry in self.storage.find_by_key_prefix(prefix).await? {
            known.insert(entry.key.clone());
            if self.pins.is_pinned(&entry.key) {
                continue;
            }
            match self.delete_entry(&entry).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    tracing::warn!(key = %entry.key, error = %e, "Failed to delete cache entry");
                }
            }
        }

        // 没有记录的残留文件
        for (stem, files) in self.scan_dir().await? {
            if !stem.starts_with(prefix) || known.contains(&stem) || self.pins.is_pinned(&stem) {
                continue;
            }
            let mut removed = false;
            for path in files.paths() {
                match remove_file_if_exists(&path).await {
                    Ok(existed) => removed |= existed,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to delete cache file");
                    }
                }
            }
            if removed {
                deleted += 1;
            }
        }

        tracing::info!(prefix, deleted, "Deleted cache entries by prefix");
        Ok(deleted)
    }

    /// 删除条目的文件与记录；文件删除失败时保留记录
    pub(crate) async fn delete_entry(&self, entry: &EntryMetadata) -> Result<(), CacheError> {
        remove_file_if_exists(&self.raw_path(&entry.key)).await?;
        remove_file_if_exists(&self.compressed_path(&entry.key)).await?;
        self.storage.remove(&entry.key).await?;
        Ok(())
    }

    /// 用量越过告警阈值时发出一次告警，回落后重新计数
    pub(crate) fn check_usage(&self, total: u64, quota: u64) {
        if quota == 0 {
            return;
        }
        let percent = total as f64 * 100.0 / quota as f64;
        if percent >= self.config.warning_threshold_percent {
            if !self.warning_active.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    total_bytes = total,
                    max_bytes = quota,
                    percent,
                    "Audio cache usage crossed warning threshold"
                );
                self.events.publish_usage_warning(total, quota);
            }
        } else {
            self.warning_active.store(false, Ordering::Relaxed);
        }
    }
}

fn ensure_valid_key(key: &str) -> Result<(), CacheError> {
    if is_valid_stem(key) {
        Ok(())
    } else {
        Err(CacheError::invalid_key(key))
    }
}

/// 删除文件；文件本就不存在时返回 Ok(false)
pub(crate) async fn remove_file_if_exists(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::cache::testing::{manager, manager_with, write_file};
    use crate::infrastructure::events::CacheEvent;

    #[tokio::test]
    async fn test_file_for_is_deterministic_and_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("nested/audio");
        let manager = manager_with(CacheManagerConfig::new(&cache_dir, 10_000)).await;

        let key = CacheKey::new("kokoro-af", 1.0, "hello").stem();
        let a = manager.file_for(&key).await.unwrap();
        let b = manager.file_for(&key).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a, cache_dir.join(format!("{}.wav", key)));
        assert!(cache_dir.is_dir());

        assert!(matches!(
            manager.file_for("../escape").await,
            Err(CacheError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_playable_prefers_compressed_and_rejects_truncated() {
        let (_dir, manager) = manager(10_000).await;

        assert!(manager.playable_file_for("k").await.is_none());

        // 仅有 WAV 头的文件视为未写完
        write_file(&manager.raw_path("k"), 44).await;
        assert!(!manager.is_ready("k").await);

        write_file(&manager.raw_path("k"), 500).await;
        assert_eq!(manager.playable_file_for("k").await, Some(manager.raw_path("k")));

        // 空的压缩文件不会遮住原始文件
        write_file(&manager.compressed_path("k"), 0).await;
        assert_eq!(manager.playable_file_for("k").await, Some(manager.raw_path("k")));

        write_file(&manager.compressed_path("k"), 50).await;
        assert_eq!(
            manager.playable_file_for("k").await,
            Some(manager.compressed_path("k"))
        );
    }

    #[tokio::test]
    async fn test_register_and_mark_used() {
        let (_dir, manager) = manager(10_000).await;
        let key = CacheKey::new("piper-en", 1.0, "chapter one").stem();
        write_file(&manager.raw_path(&key), 1_000).await;

        let entry = manager
            .register_entry(
                &key,
                RegisterEntry {
                    size_bytes: 1_000,
                    book_id: Some("book-1".to_string()),
                    segment_index: Some(3),
                    audio_duration_ms: 2_500,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(entry.voice_id, "piper-en");
        assert_eq!(entry.engine_type, "piper");
        assert_eq!(entry.compression_state, CompressionState::Raw);

        assert!(manager.mark_used(&key).await.unwrap());
        assert!(manager.mark_used(&key).await.unwrap());
        let stored = manager.entry(&key).await.unwrap().unwrap();
        assert_eq!(stored.access_count, 2);
        assert_eq!(stored.book_id.as_deref(), Some("book-1"));
        assert_eq!(manager.usage_by_book().await.unwrap().get("book-1"), Some(&1_000));

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn test_mark_used_adopts_orphan_file() {
        let (_dir, manager) = manager(10_000).await;
        let key = CacheKey::new("kokoro-af_heart", 1.0, "orphan").stem();
        write_file(&manager.raw_path(&key), 800).await;

        assert!(manager.entry(&key).await.unwrap().is_none());
        assert!(manager.mark_used(&key).await.unwrap());

        let adopted = manager.entry(&key).await.unwrap().unwrap();
        assert_eq!(adopted.size_bytes, 800);
        assert_eq!(adopted.voice_id, "kokoro-af_heart");
        assert_eq!(adopted.engine_type, "kokoro");
        assert_eq!(adopted.access_count, 1);
    }

    #[tokio::test]
    async fn test_mark_used_on_truncated_file_is_miss() {
        let (_dir, manager) = manager(10_000).await;
        write_file(&manager.raw_path("partial"), 10).await;

        assert!(!manager.mark_used("partial").await.unwrap());
        assert!(manager.entry("partial").await.unwrap().is_none());
        assert_eq!(manager.stats().await.unwrap().misses, 1);
    }

    #[tokio::test]
    async fn test_delete_by_prefix_spares_pinned() {
        let (_dir, manager) = manager(100_000).await;
        for key in ["kokoro_r100_aa", "kokoro_r100_bb", "piper_r100_cc"] {
            write_file(&manager.raw_path(key), 1_000).await;
            manager
                .register_entry(key, RegisterEntry { size_bytes: 1_000, ..Default::default() })
                .await
                .unwrap();
        }
        // 无记录的残留文件也按前缀清理
        write_file(&manager.raw_path("kokoro_r100_dd"), 1_000).await;
        manager.pin("kokoro_r100_bb");

        let deleted = manager.delete_by_prefix("kokoro_").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(!manager.raw_path("kokoro_r100_aa").exists());
        assert!(!manager.raw_path("kokoro_r100_dd").exists());
        assert!(manager.raw_path("kokoro_r100_bb").exists());
        assert!(manager.entry("kokoro_r100_bb").await.unwrap().is_some());
        assert!(manager.entry("piper_r100_cc").await.unwrap().is_some());
        assert_eq!(manager.total_size().await.unwrap(), 2_000);
    }

    #[tokio::test]
    async fn test_clear() {
        let (_dir, manager) = manager(100_000).await;
        for key in ["a", "b", "c"] {
            write_file(&manager.raw_path(key), 1_000).await;
            manager
                .register_entry(key, RegisterEntry { size_bytes: 1_000, ..Default::default() })
                .await
                .unwrap();
        }

        manager.pin("b");
        assert_eq!(manager.clear().await.unwrap(), 2);
        assert_eq!(manager.total_size().await.unwrap(), 1_000);
        assert!(manager.is_ready("b").await);

        manager.unpin("b");
        assert_eq!(manager.clear().await.unwrap(), 1);
        assert_eq!(manager.total_size().await.unwrap(), 0);
        assert!(!manager.is_ready("b").await);
    }

    #[tokio::test]
    async fn test_usage_warning_emitted_once_per_crossing() {
        let (_dir, manager) = manager(10_000).await;
        let mut rx = manager.events().subscribe();

        write_file(&manager.raw_path("a"), 9_500).await;
        manager
            .register_entry("a", RegisterEntry { size_bytes: 9_500, ..Default::default() })
            .await
            .unwrap();
        manager.evict_if_needed(None).await.unwrap();

        match rx.try_recv().unwrap() {
            CacheEvent::UsageWarning { total_bytes, max_bytes, .. } => {
                assert_eq!(total_bytes, 9_500);
                assert_eq!(max_bytes, 10_000);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // 持续高于阈值不重复告警
        assert!(rx.try_recv().is_err());
    }
}
