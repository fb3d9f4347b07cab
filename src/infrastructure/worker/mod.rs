//! Worker Layer - Background Task Processing
//!
//! 实现 CompressionWorker，把冷的原始音频压缩为 Opus

mod compression_worker;

pub use compression_worker::{CompressionWorker, CompressionWorkerConfig, SweepReport};
