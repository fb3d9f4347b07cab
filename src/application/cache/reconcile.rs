//! 启动对账 - 让元数据与磁盘文件重新一致
//!
//! - 无记录的有效文件：收养（压缩文件优先）
//! - 无可播放文件的记录：删除记录
//! - 已压缩条目残留的原始文件、未压缩条目残留的压缩文件、中间文件：删除
//!
//! 正在压缩或已固定的 key 不参与对账。

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;

use super::manager::{remove_file_if_exists, CacheManager, DiskFile};
use crate::application::error::CacheError;
use crate::domain::cache::{
    is_valid_stem, CompressionState, EntryMetadata, RAW_EXTENSION, TEMP_EXTENSION,
};

/// 对账结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// 新收养的孤儿文件
    pub adopted: usize,
    /// 删除的失效记录
    pub dropped: usize,
    /// 修正了状态/大小的记录
    pub repaired: usize,
    /// 删除的残留文件
    pub cleaned_files: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.adopted == 0 && self.dropped == 0 && self.repaired == 0 && self.cleaned_files == 0
    }
}

/// 同一 stem 在磁盘上的所有文件
#[derive(Debug, Default)]
pub(crate) struct DiskFiles {
    pub raw: Option<DiskFile>,
    pub compressed: Option<DiskFile>,
    pub temps: Vec<PathBuf>,
}

impl DiskFiles {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.raw
            .iter()
            .chain(self.compressed.iter())
            .map(|f| f.path.clone())
            .chain(self.temps.iter().cloned())
            .collect()
    }
}

enum FileKind {
    Raw,
    Compressed,
    Temp,
}

fn classify(name: &str, compressed_extension: &str) -> Option<(String, FileKind)> {
    let (stem, kind) = if let Some(rest) = name.strip_suffix(&format!(".{}", TEMP_EXTENSION)) {
        // {key}.{uuid}.tmp
        let (stem, _) = rest.rsplit_once('.')?;
        (stem, FileKind::Temp)
    } else if let Some(stem) = name.strip_suffix(&format!(".{}", RAW_EXTENSION)) {
        (stem, FileKind::Raw)
    } else if let Some(stem) = name.strip_suffix(&format!(".{}", compressed_extension)) {
        (stem, FileKind::Compressed)
    } else {
        return None;
    };

    is_valid_stem(stem).then(|| (stem.to_string(), kind))
}

impl CacheManager {
    /// 扫描缓存目录，按 stem 归组
    pub(crate) async fn scan_dir(&self) -> Result<HashMap<String, DiskFiles>, CacheError> {
        let mut files: HashMap<String, DiskFiles> = HashMap::new();

        let mut dir = match fs::read_dir(&self.config.cache_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((stem, kind)) = classify(name, &self.config.compressed_extension) else {
                continue;
            };

            match kind {
                FileKind::Temp => files.entry(stem).or_default().temps.push(path),
                FileKind::Raw => {
                    if let Some(file) = DiskFile::stat(&path).await {
                        files.entry(stem).or_default().raw = Some(file);
                    }
                }
                FileKind::Compressed => {
                    if let Some(file) = DiskFile::stat(&path).await {
                        files.entry(stem).or_default().compressed = Some(file);
                    }
                }
            }
        }

        Ok(files)
    }

    /// 对账元数据与磁盘文件，重复执行不会产生新的修改
    pub async fn reconcile(&self) -> Result<ReconcileReport, CacheError> {
        let _pass = self.maintenance.lock().await;

        let mut disk = self.scan_dir().await?;
        let mut report = ReconcileReport::default();
        let mut dropped = Vec::new();
        let mut updated = Vec::new();

        for entry in self.storage.list_all().await? {
            let files = disk.remove(&entry.key).unwrap_or_default();
            if self.pins.is_pinned(&entry.key)
                || entry.compression_state == CompressionState::Compressing
            {
                continue;
            }

            self.cleanup(&files.temps, &mut report).await;
            let raw_ok = self.raw_valid(&files);
            let compressed_ok = compressed_valid(&files);

            if entry.compression_state == CompressionState::Compressed {
                if compressed_ok {
                    self.cleanup_file(files.raw.as_ref(), &mut report).await;
                    if size_differs(&entry, files.compressed.as_ref()) {
                        updated.push(with_representation(
                            entry,
                            CompressionState::Compressed,
                            files.compressed.as_ref(),
                        ));
                    }
                } else if raw_ok {
                    // 压缩文件丢失，退回原始文件
                    self.cleanup_file(files.compressed.as_ref(), &mut report).await;
                    updated.push(with_representation(entry, CompressionState::Raw, files.raw.as_ref()));
                } else {
                    self.cleanup(&files.paths(), &mut report).await;
                    dropped.push(entry.key);
                }
            } else if raw_ok {
                self.cleanup_file(files.compressed.as_ref(), &mut report).await;
                if size_differs(&entry, files.raw.as_ref()) {
                    let state = entry.compression_state;
                    updated.push(with_representation(entry, state, files.raw.as_ref()));
                }
            } else if compressed_ok {
                // 原始文件已删而记录未替换，以压缩文件为准
                updated.push(with_representation(
                    entry,
                    CompressionState::Compressed,
                    files.compressed.as_ref(),
                ));
            } else {
                self.cleanup(&files.paths(), &mut report).await;
                dropped.push(entry.key);
            }
        }

        let mut adopted = Vec::new();
        for (stem, files) in disk {
            if self.pins.is_pinned(&stem) {
                continue;
            }
            self.cleanup(&files.temps, &mut report).await;

            if compressed_valid(&files) {
                self.cleanup_file(files.raw.as_ref(), &mut report).await;
                if let Some(file) = &files.compressed {
                    adopted.push(self.orphan_entry(&stem, file, true));
                }
            } else if self.raw_valid(&files) {
                self.cleanup_file(files.compressed.as_ref(), &mut report).await;
                if let Some(file) = &files.raw {
                    adopted.push(self.orphan_entry(&stem, file, false));
                }
            } else {
                self.cleanup_file(files.raw.as_ref(), &mut report).await;
                self.cleanup_file(files.compressed.as_ref(), &mut report).await;
            }
        }

        if !dropped.is_empty() {
            report.dropped = self.storage.remove_batch(&dropped).await? as usize;
        }
        if !updated.is_empty() {
            self.storage.upsert_batch(&updated).await?;
            report.repaired = updated.len();
        }
        if !adopted.is_empty() {
            self.storage.upsert_batch(&adopted).await?;
            report.adopted = adopted.len();
        }

        if report.is_clean() {
            tracing::debug!("Cache reconciliation found nothing to fix");
        } else {
            tracing::info!(
                adopted = report.adopted,
                dropped = report.dropped,
                repaired = report.repaired,
                cleaned_files = report.cleaned_files,
                "Cache reconciliation completed"
            );
        }
        self.events
            .publish_reconciled(report.adopted, report.dropped, report.cleaned_files);

        Ok(report)
    }

    fn raw_valid(&self, files: &DiskFiles) -> bool {
        files
            .raw
            .as_ref()
            .map_or(false, |f| f.size > self.config.min_valid_size_bytes)
    }

    async fn cleanup_file(&self, file: Option<&DiskFile>, report: &mut ReconcileReport) {
        if let Some(file) = file {
            self.cleanup(std::slice::from_ref(&file.path), report).await;
        }
    }

    async fn cleanup(&self, paths: &[PathBuf], report: &mut ReconcileReport) {
        for path in paths {
            match remove_file_if_exists(path).await {
                Ok(true) => {
                    report.cleaned_files += 1;
                    tracing::debug!(path = %path.display(), "Removed stale cache file");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale cache file");
                }
            }
        }
    }
}

fn compressed_valid(files: &DiskFiles) -> bool {
    files.compressed.as_ref().map_or(false, |f| f.size > 0)
}

fn size_differs(entry: &EntryMetadata, file: Option<&DiskFile>) -> bool {
    file.map_or(false, |f| f.size != entry.size_bytes)
}

fn with_representation(
    mut entry: EntryMetadata,
    state: CompressionState,
    file: Option<&DiskFile>,
) -> EntryMetadata {
    entry.compression_state = state;
    entry.compression_started_at = None;
    if let Some(file) = file {
        entry.size_bytes = file.size;
    }
    entry
}
