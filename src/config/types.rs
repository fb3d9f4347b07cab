//! Configuration Types
//!
//! 定义所有配置结构体

use serde::Deserialize;
use std::path::PathBuf;

use crate::application::cache::CacheManagerConfig;
use crate::domain::cache::ScoringPolicy;
use crate::infrastructure::adapters::OpusCompressorConfig;
use crate::infrastructure::worker::CompressionWorkerConfig;

/// 应用主配置
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// 缓存目录与配额
    #[serde(default)]
    pub cache: CacheConfig,

    /// 淘汰评分策略
    #[serde(default)]
    pub scoring: ScoringPolicy,

    /// 后台压缩
    #[serde(default)]
    pub compression: CompressionConfig,

    /// 元数据存储
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// 组装缓存管理器配置
    pub fn manager_config(&self, compressed_extension: &str) -> CacheManagerConfig {
        CacheManagerConfig {
            cache_dir: self.cache.dir.clone(),
            max_size_bytes: self.cache.max_size_bytes,
            warning_threshold_percent: self.cache.warning_threshold_percent,
            headroom_percent: self.cache.headroom_percent,
            min_valid_size_bytes: self.cache.min_valid_size_bytes,
            compressed_extension: compressed_extension.to_string(),
            scoring: self.scoring.clone(),
        }
    }
}

/// 缓存配置
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// 音频缓存目录
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// 配额（字节）
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,

    /// 用量告警阈值（百分比）
    #[serde(default = "default_warning_threshold_percent")]
    pub warning_threshold_percent: f64,

    /// 淘汰目标（配额的百分比）
    #[serde(default = "default_headroom_percent")]
    pub headroom_percent: f64,

    /// 原始文件的最小有效大小（字节）
    #[serde(default = "default_min_valid_size_bytes")]
    pub min_valid_size_bytes: u64,

    /// 用量统计日志间隔（秒），0 表示关闭
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data/cache/audio")
}

fn default_max_size_bytes() -> u64 {
    500 * 1024 * 1024 // 500 MB
}

fn default_warning_threshold_percent() -> f64 {
    90.0
}

fn default_headroom_percent() -> f64 {
    90.0
}

fn default_min_valid_size_bytes() -> u64 {
    44 // WAV 头
}

fn default_stats_interval_secs() -> u64 {
    600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            max_size_bytes: default_max_size_bytes(),
            warning_threshold_percent: default_warning_threshold_percent(),
            headroom_percent: default_headroom_percent(),
            min_valid_size_bytes: default_min_valid_size_bytes(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

/// 压缩配置
#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    /// 是否启用后台压缩
    #[serde(default = "default_compression_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub worker: CompressionWorkerConfig,

    #[serde(default)]
    pub opus: OpusCompressorConfig,
}

fn default_compression_enabled() -> bool {
    true
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: default_compression_enabled(),
            worker: CompressionWorkerConfig::default(),
            opus: OpusCompressorConfig::default(),
        }
    }
}

/// 元数据存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackend {
    Sqlite,
    Sled,
}

impl Default for MetadataBackend {
    fn default() -> Self {
        Self::Sqlite
    }
}

/// 元数据存储配置
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    #[serde(default)]
    pub backend: MetadataBackend,

    /// SQLite 文件路径或 sled 目录
    #[serde(default = "default_metadata_path")]
    pub path: String,

    /// SQLite 最大连接数
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_metadata_path() -> String {
    "data/cache/metadata.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            backend: MetadataBackend::default(),
            path: default_metadata_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
