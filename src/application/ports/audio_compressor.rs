//! Audio Compressor Port - 音频压缩抽象
//!
//! 压缩 worker 通过该接口把原始 WAV 转为更小的磁盘格式

use thiserror::Error;

/// 压缩错误
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),
}

/// 压缩结果
#[derive(Debug, Clone)]
pub struct CompressedAudio {
    pub data: Vec<u8>,
    pub duration_ms: u64,
    pub original_size: usize,
}

/// Audio Compressor Port
///
/// 实现为 CPU 密集的同步调用，调用方负责放到阻塞线程池执行
pub trait AudioCompressorPort: Send + Sync {
    /// 压缩后文件的扩展名（不含点）
    fn extension(&self) -> &'static str;

    /// 压缩原始音频
    fn compress(&self, raw: &[u8]) -> Result<CompressedAudio, CompressionError>;
}
