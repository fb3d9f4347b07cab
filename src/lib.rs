//! Rovel Cache - 有声小说音频缓存子系统
//!
//! 架构设计: DDD + Hexagonal Architecture
//!
//! 领域层 (domain/):
//! - Cache Context: 缓存 key、条目元数据、压缩状态机、淘汰评分
//!
//! 应用层 (application/):
//! - Ports: 元数据存储、音频压缩、播放状态
//! - Cache: 缓存管理器（查找、注册、pin、淘汰、对账）
//!
//! 基础设施层 (infrastructure/):
//! - Persistence: SQLite + Sled 元数据存储
//! - Adapters: Opus 压缩器
//! - Worker: 后台压缩
//! - Events: 缓存事件广播

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use config::{load_config, AppConfig};
