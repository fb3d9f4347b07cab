//! 应用层错误定义
//!
//! 缓存管理器对外暴露的统一错误类型

use thiserror::Error;

use crate::application::ports::StorageError;

/// 缓存管理错误
#[derive(Debug, Error)]
pub enum CacheError {
    /// 非法缓存 key（空、包含路径分隔符等）
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    /// 元数据存储错误
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// 文件系统错误
    #[error("IO error: {0}")]
    IoError(String),

    /// 压缩错误
    #[error("Compression error: {0}")]
    Compression(String),
}

impl CacheError {
    /// 创建非法 key 错误
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey(message.into())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::IoError(err.to_string())
    }
}

impl From<crate::application::ports::CompressionError> for CacheError {
    fn from(err: crate::application::ports::CompressionError) -> Self {
        CacheError::Compression(err.to_string())
    }
}
