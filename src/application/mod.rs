//! 应用层 - 用例编排
//!
//! 包含：
//! - ports: 六边形架构端口定义（MetadataStorage、AudioCompressor、PlaybackState）
//! - cache: 缓存管理器
//! - error: 应用层错误定义

pub mod cache;
pub mod error;
pub mod ports;

pub use cache::{
    CacheBudget, CacheManager, CacheManagerConfig, CacheStats, EvictionReport, PinGuard,
    ReconcileReport, RegisterEntry,
};
pub use error::CacheError;
pub use ports::{
    AudioCompressorPort, BookPlayback, CompressedAudio, CompressionError, MetadataStoragePort,
    PlaybackSnapshot, PlaybackStatePort, StorageError,
};
