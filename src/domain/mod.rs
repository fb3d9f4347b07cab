//! Domain Layer - 领域层
//!
//! 包含一个限界上下文:
//! - Cache Context: 音频缓存条目、压缩状态与淘汰评分

pub mod cache;
