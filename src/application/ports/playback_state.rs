//! Playback State Port - 播放状态来源
//!
//! 由书库/播放子系统提供，缓存管理器据此构建淘汰上下文

use async_trait::async_trait;
use std::collections::HashMap;

/// 某本书的播放快照
#[derive(Debug, Clone, PartialEq)]
pub struct BookPlayback {
    pub book_id: String,
    /// 当前播放段
    pub current_segment: Option<u32>,
    /// 完成度 0.0..=1.0
    pub completion: Option<f64>,
}

/// 播放状态快照
#[derive(Debug, Clone, Default)]
pub struct PlaybackSnapshot {
    pub active_voice_id: Option<String>,
    /// book_id -> 播放状态（仅包含当前打开的书）
    pub open_books: HashMap<String, BookPlayback>,
}

/// Playback State Port
#[async_trait]
pub trait PlaybackStatePort: Send + Sync {
    async fn snapshot(&self) -> PlaybackSnapshot;
}
