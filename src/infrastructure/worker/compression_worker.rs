//! Compression Worker - 后台缓存压缩
//!
//! 状态机: Raw → Compressing → {Compressed | CompressionFailed}
//!
//! - 只处理超过热度阈值未访问的 Raw / CompressionFailed 条目
//! - 处理期间 pin 住 key，淘汰不会删除正在压缩的文件
//! - 压缩结果先写临时文件再 rename，最后在一个事务里替换记录，之后才删除原始文件
//! - 启动时及每轮开始前把超时的 Compressing 条目退回 Raw

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::application::cache::CacheManager;
use crate::application::error::CacheError;
use crate::application::ports::{AudioCompressorPort, StorageError};
use crate::domain::cache::{CompressionState, EntryMetadata};

/// Worker 配置
#[derive(Debug, Clone, Deserialize)]
pub struct CompressionWorkerConfig {
    /// 超过该时长未访问才压缩（秒）
    #[serde(default = "default_hotness_threshold_secs")]
    pub hotness_threshold_secs: u64,

    /// Compressing 状态超过该时长视为中断（秒）
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,

    /// 扫描间隔（秒）
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// 每轮最多处理的条目数
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// 最大并发压缩数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_hotness_threshold_secs() -> u64 {
    3600 // 1 小时
}

fn default_stale_timeout_secs() -> u64 {
    600 // 10 分钟
}

fn default_interval_secs() -> u64 {
    300 // 5 分钟
}

fn default_batch_size() -> usize {
    32
}

fn default_max_concurrent() -> usize {
    2
}

impl Default for CompressionWorkerConfig {
    fn default() -> Self {
        Self {
            hotness_threshold_secs: default_hotness_threshold_secs(),
            stale_timeout_secs: default_stale_timeout_secs(),
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// 单轮扫描结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub compressed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub saved_bytes: u64,
}

#[derive(Debug)]
enum Outcome {
    Compressed { saved_bytes: u64 },
    Failed,
    Skipped,
}

/// 压缩 Worker
pub struct CompressionWorker {
    config: CompressionWorkerConfig,
    manager: Arc<CacheManager>,
    compressor: Arc<dyn AudioCompressorPort>,
    cancel: CancellationToken,
}

impl CompressionWorker {
    pub fn new(
        config: CompressionWorkerConfig,
        manager: Arc<CacheManager>,
        compressor: Arc<dyn AudioCompressorPort>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            manager,
            compressor,
            cancel,
        }
    }

    /// 启动 Worker，直到取消
    pub async fn run(self) {
        tracing::info!(
            interval_secs = self.config.interval_secs,
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent,
            "CompressionWorker started"
        );

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.recover_stale().await {
                        tracing::error!(error = %e, "Failed to recover stale compressions");
                    }
                    match self.run_once().await {
                        Ok(report) if report.compressed + report.failed > 0 => {
                            tracing::info!(
                                compressed = report.compressed,
                                failed = report.failed,
                                skipped = report.skipped,
                                saved_bytes = report.saved_bytes,
                                "Compression sweep completed"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Compression sweep failed"),
                    }
                }
            }
        }

        tracing::info!("CompressionWorker stopped");
    }

    /// 把超时的 Compressing 条目退回 Raw，返回恢复数
    pub async fn recover_stale(&self) -> Result<usize, CacheError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.stale_timeout_secs as i64);
        let storage = self.manager.storage();

        let mut recovered = 0;
        for entry in storage.find_stale_compressing(cutoff).await? {
            if self.manager.is_pinned(&entry.key) {
                continue;
            }
            let _pin = self.manager.pin_guard(&entry.key);

            // 原始文件仍在时才可能留下半成品
            if let Err(e) = fs::remove_file(self.manager.compressed_path(&entry.key)).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(key = %entry.key, error = %e, "Failed to remove partial compressed file");
                    continue;
                }
            }

            if storage
                .update_compression_state(
                    &entry.key,
                    CompressionState::Compressing,
                    CompressionState::Raw,
                    None,
                )
                .await?
            {
                recovered += 1;
                tracing::warn!(
                    key = %entry.key,
                    started_at = ?entry.compression_started_at,
                    "Recovered stale compression, entry reverted to raw"
                );
            }
        }

        Ok(recovered)
    }

    /// 执行一轮压缩
    pub async fn run_once(&self) -> Result<SweepReport, CacheError> {
        let mut report = SweepReport::default();
        if self.cancel.is_cancelled() {
            return Ok(report);
        }

        let cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.hotness_threshold_secs as i64);
        let storage = self.manager.storage();
        let mut candidates = storage
            .find_by_state(CompressionState::Raw, Some(cutoff), self.config.batch_size)
            .await?;
        let remaining = self.config.batch_size.saturating_sub(candidates.len());
        if remaining > 0 {
            candidates.extend(
                storage
                    .find_by_state(CompressionState::CompressionFailed, Some(cutoff), remaining)
                    .await?,
            );
        }
        if candidates.is_empty() {
            return Ok(report);
        }

        tracing::debug!(candidates = candidates.len(), "Starting compression sweep");

        let outcomes: Vec<Outcome> = stream::iter(candidates)
            .map(|entry| self.compress_entry(entry))
            .buffer_unordered(self.config.max_concurrent.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Outcome::Compressed { saved_bytes } => {
                    report.compressed += 1;
                    report.saved_bytes += saved_bytes;
                }
                Outcome::Failed => report.failed += 1,
                Outcome::Skipped => report.skipped += 1,
            }
        }

        Ok(report)
    }

    async fn compress_entry(&self, entry: EntryMetadata) -> Outcome {
        if self.cancel.is_cancelled() || self.manager.is_pinned(&entry.key) {
            return Outcome::Skipped;
        }
        let _pin = self.manager.pin_guard(&entry.key);
        let key = entry.key.as_str();
        let storage = self.manager.storage();

        match storage
            .update_compression_state(
                key,
                entry.compression_state,
                CompressionState::Compressing,
                Some(Utc::now()),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => return Outcome::Skipped,
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to mark entry compressing");
                return Outcome::Skipped;
            }
        }

        let raw_path = self.manager.raw_path(key);
        let raw = match fs::read(&raw_path).await {
            Ok(raw) => raw,
            Err(e) => {
                let error = CacheError::IoError(format!("Failed to read raw file: {}", e));
                return self.fail(key, &error).await;
            }
        };

        let compressor = self.compressor.clone();
        let job = tokio::task::spawn_blocking(move || compressor.compress(&raw));
        let compressed = tokio::select! {
            result = job => result,
            _ = self.cancel.cancelled() => {
                // 取消时退回 Raw，原始文件未动
                self.revert(key).await;
                return Outcome::Skipped;
            }
        };
        let compressed = match compressed {
            Ok(Ok(compressed)) => compressed,
            Ok(Err(e)) => return self.fail(key, &CacheError::from(e)).await,
            Err(e) => {
                let error = CacheError::Compression(format!("Compression task panicked: {}", e));
                return self.fail(key, &error).await;
            }
        };

        let temp_path = self.manager.temp_path(key);
        let compressed_path = self.manager.compressed_path(key);
        if let Err(e) = fs::write(&temp_path, &compressed.data).await {
            let _ = fs::remove_file(&temp_path).await;
            let error = CacheError::IoError(format!("Failed to write compressed file: {}", e));
            return self.fail(key, &error).await;
        }
        if let Err(e) = fs::rename(&temp_path, &compressed_path).await {
            let _ = fs::remove_file(&temp_path).await;
            let error = CacheError::IoError(format!("Failed to move compressed file: {}", e));
            return self.fail(key, &error).await;
        }

        // 读取最新记录，保留压缩期间累计的访问信息
        let current = match storage.get(key).await {
            Ok(Some(current)) if current.compression_state == CompressionState::Compressing => {
                current
            }
            Ok(Some(_)) => {
                let _ = fs::remove_file(&compressed_path).await;
                tracing::debug!(key, "Entry re-registered while compressing, output discarded");
                return Outcome::Skipped;
            }
            Ok(None) => {
                let _ = fs::remove_file(&compressed_path).await;
                tracing::debug!(key, "Entry removed while compressing");
                return Outcome::Skipped;
            }
            Err(e) => {
                let _ = fs::remove_file(&compressed_path).await;
                return self.fail(key, &CacheError::from(e)).await;
            }
        };
        let original_bytes = current.size_bytes;
        let compressed_bytes = compressed.data.len() as u64;
        let mut replacement = current.into_compressed(compressed_bytes);
        if replacement.audio_duration_ms == 0 {
            replacement.audio_duration_ms = compressed.duration_ms;
        }

        match storage
            .replace_entry(key, CompressionState::Compressing, &replacement)
            .await
        {
            Ok(()) => {}
            Err(StorageError::NotFound(_)) | Err(StorageError::Conflict(_)) => {
                let _ = fs::remove_file(&compressed_path).await;
                tracing::debug!(key, "Entry changed while compressing, output discarded");
                return Outcome::Skipped;
            }
            Err(e) => {
                let _ = fs::remove_file(&compressed_path).await;
                return self.fail(key, &CacheError::from(e)).await;
            }
        }

        // 替换之后被重新登记的条目，原始文件属于新记录
        let still_ours = matches!(
            storage.get(key).await,
            Ok(Some(latest)) if latest.is_compressed() && latest.size_bytes == compressed_bytes
        );
        if still_ours {
            // 记录已指向压缩文件，原始文件删除失败留给对账
            if let Err(e) = fs::remove_file(&raw_path).await {
                tracing::warn!(key, error = %e, "Failed to remove raw file after compression");
            }
        }

        tracing::info!(
            key,
            original_bytes,
            compressed_bytes,
            state = %CompressionState::Compressed,
            "Compressed cache entry"
        );
        self.manager
            .events()
            .publish_compressed(key, original_bytes, compressed_bytes);

        Outcome::Compressed {
            saved_bytes: original_bytes.saturating_sub(compressed_bytes),
        }
    }

    /// 压缩失败：清理产物，标记 CompressionFailed，原始文件保持可用
    async fn fail(&self, key: &str, error: &CacheError) -> Outcome {
        let _ = fs::remove_file(self.manager.compressed_path(key)).await;

        match self
            .manager
            .storage()
            .update_compression_state(
                key,
                CompressionState::Compressing,
                CompressionState::CompressionFailed,
                None,
            )
            .await
        {
            Ok(_) => {}
            Err(e) => {
                tracing::error!(key, error = %e, "Failed to mark compression failure");
            }
        }

        let error = error.to_string();
        tracing::warn!(
            key,
            error = %error,
            state = %CompressionState::CompressionFailed,
            "Cache entry compression failed"
        );
        self.manager.events().publish_compression_failed(key, &error);
        Outcome::Failed
    }

    async fn revert(&self, key: &str) {
        if let Err(e) = self
            .manager
            .storage()
            .update_compression_state(
                key,
                CompressionState::Compressing,
                CompressionState::Raw,
                None,
            )
            .await
        {
            tracing::warn!(key, error = %e, "Failed to revert cancelled compression");
        } else {
            tracing::debug!(key, "Compression cancelled, entry reverted to raw");
        }
    }
}
