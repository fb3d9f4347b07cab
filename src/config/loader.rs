//! Configuration Loader
//!
//! 实现多源配置加载与合并逻辑
//!
//! 优先级（从高到低）：
//! 1. 环境变量
//! 2. 配置文件（config.toml）
//! 3. 默认值

use config::{Config, ConfigError as ConfigCrateError, Environment, File};
use std::path::Path;
use thiserror::Error;

use super::types::AppConfig;

/// 配置加载错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigCrateError> for ConfigError {
    fn from(err: ConfigCrateError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

/// 配置文件搜索路径
const CONFIG_FILE_NAMES: &[&str] = &["config", "config.local"];

/// 加载应用配置
///
/// # 环境变量示例
/// - `ROVEL_CACHE__MAX_SIZE_BYTES=1073741824`
/// - `ROVEL_CACHE__DIR=/var/cache/rovel/audio`
/// - `ROVEL_METADATA__BACKEND=sled`
/// - `ROVEL_SCORING__WEIGHTS__RECENCY=0.4`
/// - `ROVEL_COMPRESSION__WORKER__HOTNESS_THRESHOLD_SECS=7200`
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from_path(None)
}

/// 从指定路径加载配置
///
/// `config_path` 为 None 时搜索当前目录下的 config.toml / config.local.toml
pub fn load_config_from_path(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();

    // 1. 默认值（最低优先级）
    builder = builder
        .set_default("cache.dir", "data/cache/audio")?
        .set_default("cache.max_size_bytes", 500_u64 * 1024 * 1024)?
        .set_default("cache.warning_threshold_percent", 90.0)?
        .set_default("cache.headroom_percent", 90.0)?
        .set_default("metadata.backend", "sqlite")?
        .set_default("metadata.path", "data/cache/metadata.db")?
        .set_default("compression.enabled", true)?
        .set_default("log.level", "info")?
        .set_default("log.json", false)?;

    // 2. 配置文件
    if let Some(path) = config_path {
        builder = builder.add_source(File::from(path).required(true));
    } else {
        for name in CONFIG_FILE_NAMES {
            builder = builder.add_source(File::with_name(name).required(false));
        }
    }

    // 3. 环境变量（最高优先级）
    // 前缀: ROVEL_，层级分隔符: __
    builder = builder.add_source(
        Environment::with_prefix("ROVEL")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;

    let app_config: AppConfig = config.try_deserialize().map_err(|e| {
        ConfigError::ParseError(format!("Failed to deserialize config: {}", e))
    })?;

    validate_config(&app_config)?;

    Ok(app_config)
}

/// 验证配置有效性
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

    if config.cache.max_size_bytes == 0 {
        return invalid("Cache quota cannot be 0");
    }

    let percent_ok = |p: f64| p > 0.0 && p <= 100.0;
    if !percent_ok(config.cache.warning_threshold_percent) {
        return invalid("Warning threshold must be within (0, 100]");
    }
    if !percent_ok(config.cache.headroom_percent) {
        return invalid("Headroom target must be within (0, 100]");
    }

    let weights = &config.scoring.weights;
    let all_weights = [
        weights.recency,
        weights.frequency,
        weights.position,
        weights.completion,
        weights.voice,
    ];
    if all_weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return invalid("Scoring weights must be non-negative");
    }
    if !(weights.sum() > 0.0) {
        return invalid("At least one scoring weight must be positive");
    }
    if !(config.scoring.recency_half_life_hours > 0.0)
        || !(config.scoring.ahead_window > 0.0)
        || !(config.scoring.behind_window > 0.0)
    {
        return invalid("Scoring half-life and windows must be positive");
    }

    if config.metadata.path.is_empty() {
        return invalid("Metadata path cannot be empty");
    }

    let worker = &config.compression.worker;
    if config.compression.enabled {
        if worker.interval_secs == 0 {
            return invalid("Compression interval cannot be 0 when compression is enabled");
        }
        if worker.batch_size == 0 || worker.max_concurrent == 0 {
            return invalid("Compression batch size and concurrency must be positive");
        }
    }

    Ok(())
}

/// 打印配置信息（用于启动时日志）
pub fn print_config(config: &AppConfig) {
    tracing::info!("=== Cache Configuration ===");
    tracing::info!("Cache Directory: {:?}", config.cache.dir);
    tracing::info!("Quota: {} bytes", config.cache.max_size_bytes);
    tracing::info!(
        "Warning Threshold: {}%, Headroom Target: {}%",
        config.cache.warning_threshold_percent,
        config.cache.headroom_percent
    );
    tracing::info!(
        "Metadata: {:?} at {}",
        config.metadata.backend,
        config.metadata.path
    );
    tracing::info!("Scoring Weights: {:?}", config.scoring.weights);
    tracing::info!("Compression Enabled: {}", config.compression.enabled);
    if config.compression.enabled {
        tracing::info!(
            "Compression: every {}s, hotness {}s, bitrate {} bps",
            config.compression.worker.interval_secs,
            config.compression.worker.hotness_threshold_secs,
            config.compression.opus.bitrate
        );
    }
    tracing::info!("Log Level: {}", config.log.level);
    tracing::info!("===========================");
}
