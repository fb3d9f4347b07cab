//! Cache Context - 音频缓存限界上下文
//!
//! 职责:
//! - 缓存 key 与文件名编解码
//! - 缓存条目元数据与压缩状态机
//! - 淘汰评分

mod cache_key;
mod entry;
mod scoring;

pub use cache_key::{
    infer_engine_type, is_valid_stem, CacheKey, COMPRESSED_EXTENSION, RAW_EXTENSION,
    TEMP_EXTENSION,
};
pub use entry::{CompressionState, EntryMetadata};
pub use scoring::{EvictionContext, EvictionScorer, ScoringPolicy, ScoringWeights};
