//! 配额淘汰
//!
//! - 评分路径：按淘汰分数从低到高删除，直到降到配额的 headroom 目标以下
//! - 预算路径：先清理超龄条目，再按 LRU 删除到字节预算以内
//!
//! 两条路径都跳过已固定的条目，且与批量删除、对账互斥执行。

use chrono::Utc;
use std::cmp::Ordering;
use std::time::Duration;

use super::manager::{CacheManager, EvictionReport};
use crate::application::error::CacheError;
use crate::domain::cache::{EntryMetadata, EvictionContext};

/// 预算路径的限制
#[derive(Debug, Clone, Default)]
pub struct CacheBudget {
    pub max_size_bytes: Option<u64>,
    /// 超过该时长未访问的条目直接清理
    pub max_age: Option<Duration>,
}

impl CacheManager {
    /// 超出配额时按评分淘汰
    ///
    /// 未传入上下文时通过播放状态端口构建
    pub async fn evict_if_needed(
        &self,
        context: Option<EvictionContext>,
    ) -> Result<EvictionReport, CacheError> {
        let quota = self.max_size_bytes();
        let report = self.score_pass(quota, context).await?;
        self.check_usage(report.size_after, quota);
        Ok(report)
    }

    /// 预淘汰：为即将写入的 `upcoming_bytes` 提前腾出空间
    ///
    /// 以 `quota - upcoming_bytes` 作为本次的有效配额，配置的配额本身不变
    pub async fn ensure_headroom(
        &self,
        upcoming_bytes: u64,
        context: Option<EvictionContext>,
    ) -> Result<EvictionReport, CacheError> {
        let quota = self.max_size_bytes();
        let effective = quota.saturating_sub(upcoming_bytes);

        tracing::debug!(
            upcoming_bytes,
            quota,
            effective_quota = effective,
            "Ensuring cache headroom before batch"
        );

        self.score_pass(effective, context).await
    }

    /// 按字节/时间预算清理
    pub async fn prune_if_needed(&self, budget: &CacheBudget) -> Result<EvictionReport, CacheError> {
        let _pass = self.maintenance.lock().await;

        let total = self.storage.total_size().await?;
        let mut report = EvictionReport {
            size_before: total,
            size_after: total,
            ..Default::default()
        };

        let now = Utc::now();
        let max_age = budget
            .max_age
            .and_then(|age| chrono::Duration::from_std(age).ok());
        let over_budget = budget.max_size_bytes.map_or(false, |limit| total > limit);
        if max_age.is_none() && !over_budget {
            return Ok(report);
        }

        let mut entries = self.storage.list_all().await?;
        entries.sort_by(|a, b| a.last_accessed.cmp(&b.last_accessed));

        let mut current = total;
        let mut survivors = Vec::with_capacity(entries.len());
        for entry in entries {
            if self.pins.is_pinned(&entry.key) {
                report.skipped_pinned += 1;
                continue;
            }
            let expired = max_age.map_or(false, |age| now - entry.last_accessed > age);
            if expired {
                self.evict_one(&mut report, &mut current, entry, None).await;
            } else {
                survivors.push(entry);
            }
        }

        if let Some(limit) = budget.max_size_bytes {
            for entry in survivors {
                if current <= limit {
                    break;
                }
                if self.pins.is_pinned(&entry.key) {
                    report.skipped_pinned += 1;
                    continue;
                }
                self.evict_one(&mut report, &mut current, entry, None).await;
            }
        }

        report.size_after = current;
        tracing::info!(
            evicted = report.evicted_keys.len(),
            freed_bytes = report.freed_bytes,
            size_bytes = current,
            "Cache prune completed"
        );
        Ok(report)
    }

    async fn score_pass(
        &self,
        quota: u64,
        context: Option<EvictionContext>,
    ) -> Result<EvictionReport, CacheError> {
        let _pass = self.maintenance.lock().await;

        let total = self.storage.total_size().await?;
        let mut report = EvictionReport {
            size_before: total,
            size_after: total,
            ..Default::default()
        };
        if total <= quota {
            return Ok(report);
        }

        let mut context = match context {
            Some(context) => context,
            None => self.build_context().await?,
        };
        if context.max_access_count == 0 {
            context.max_access_count = self.storage.max_access_count().await?;
        }

        let target = (quota as f64 * self.config.headroom_percent / 100.0) as u64;
        let now = Utc::now();

        let mut candidates = Vec::new();
        for entry in self.storage.list_all().await? {
            if self.pins.is_pinned(&entry.key) {
                report.skipped_pinned += 1;
                continue;
            }
            let score = self.scorer.score_at(&entry, &context, now);
            candidates.push((score, entry));
        }
        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.last_accessed.cmp(&b.1.last_accessed))
        });

        let mut current = total;
        for (score, entry) in candidates {
            if current <= target {
                break;
            }
            // 评分期间可能被新 pin
            if self.pins.is_pinned(&entry.key) {
                report.skipped_pinned += 1;
                continue;
            }
            self.evict_one(&mut report, &mut current, entry, Some(score))
                .await;
        }

        report.size_after = current;
        if current > target {
            tracing::warn!(
                size_bytes = current,
                target_bytes = target,
                pinned = report.skipped_pinned,
                failed = report.failed,
                "Eviction pass could not reach headroom target"
            );
        } else {
            tracing::info!(
                evicted = report.evicted_keys.len(),
                freed_bytes = report.freed_bytes,
                size_bytes = current,
                target_bytes = target,
                "Eviction pass completed"
            );
        }
        Ok(report)
    }

    /// 删除单个条目；失败只记录，不中断整轮淘汰
    async fn evict_one(
        &self,
        report: &mut EvictionReport,
        current: &mut u64,
        entry: EntryMetadata,
        score: Option<f64>,
    ) {
        match self.delete_entry(&entry).await {
            Ok(()) => {
                *current = current.saturating_sub(entry.size_bytes);
                report.freed_bytes += entry.size_bytes;
                tracing::info!(
                    key = %entry.key,
                    score = ?score,
                    size_bytes = entry.size_bytes,
                    state = %entry.compression_state,
                    "Evicted cache entry"
                );
                self.events
                    .publish_evicted(&entry.key, entry.size_bytes, score);
                report.evicted_keys.push(entry.key);
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(key = %entry.key, error = %e, "Failed to evict cache entry, skipping");
            }
        }
    }

    /// 由播放状态快照构建淘汰上下文
    async fn build_context(&self) -> Result<EvictionContext, CacheError> {
        let mut context = EvictionContext {
            max_access_count: self.storage.max_access_count().await?,
            ..Default::default()
        };

        if let Some(playback) = &self.playback {
            let snapshot = playback.snapshot().await;
            context.active_voice_id = snapshot.active_voice_id;
            for (book_id, book) in snapshot.open_books {
                if let Some(segment) = book.current_segment {
                    context.current_segments.insert(book_id.clone(), segment);
                }
                if let Some(completion) = book.completion {
                    context.completion.insert(book_id, completion);
                }
            }
        }

        Ok(context)
    }
}
