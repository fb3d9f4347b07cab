//! Cache Context - 缓存条目元数据

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 压缩状态机
///
/// `Raw → Compressing → {Compressed | CompressionFailed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionState {
    /// 原始 WAV
    #[default]
    Raw,
    /// 压缩进行中，原始文件仍然可播放
    Compressing,
    /// 已压缩，原始文件已删除
    Compressed,
    /// 压缩失败，行为与 Raw 完全一致，可重试
    CompressionFailed,
}

impl CompressionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionState::Raw => "raw",
            CompressionState::Compressing => "compressing",
            CompressionState::Compressed => "compressed",
            CompressionState::CompressionFailed => "compression_failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(CompressionState::Raw),
            "compressing" => Some(CompressionState::Compressing),
            "compressed" => Some(CompressionState::Compressed),
            "compression_failed" => Some(CompressionState::CompressionFailed),
            _ => None,
        }
    }

    /// 播放与淘汰时是否按原始文件处理
    pub fn is_raw_like(&self) -> bool {
        matches!(
            self,
            CompressionState::Raw | CompressionState::CompressionFailed
        )
    }
}

impl std::fmt::Display for CompressionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 缓存条目元数据
///
/// 每个缓存文件对应一条记录。`key` 与文件名 stem 相同。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub key: String,
    /// 当前可播放表示（原始或压缩）的大小
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub book_id: Option<String>,
    pub chapter_index: Option<u32>,
    pub segment_index: Option<u32>,
    pub voice_id: String,
    pub engine_type: String,
    pub audio_duration_ms: u64,
    pub compression_state: CompressionState,
    /// 仅在 Compressing 状态下设置
    pub compression_started_at: Option<DateTime<Utc>>,
}

impl EntryMetadata {
    /// 新注册的原始条目
    pub fn new_raw(key: impl Into<String>, voice_id: impl Into<String>, size_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            size_bytes,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            book_id: None,
            chapter_index: None,
            segment_index: None,
            voice_id: voice_id.into(),
            engine_type: "unknown".to_string(),
            audio_duration_ms: 0,
            compression_state: CompressionState::Raw,
            compression_started_at: None,
        }
    }

    /// 压缩成功后的替换记录
    pub fn into_compressed(self, compressed_size: u64) -> Self {
        Self {
            size_bytes: compressed_size,
            compression_state: CompressionState::Compressed,
            compression_started_at: None,
            ..self
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.compression_state == CompressionState::Compressed
    }
}
