//! Cache Manager - 音频缓存用例
//!
//! 包含：
//! - manager: 查找、注册、pin、批量维护
//! - eviction: 评分淘汰、预淘汰、预算清理
//! - reconcile: 启动对账
//! - pins: 引用计数的淘汰豁免

mod eviction;
mod manager;
mod pins;
mod reconcile;

#[cfg(test)]
pub(crate) mod testing;

pub use eviction::CacheBudget;
pub use manager::{CacheManager, CacheManagerConfig, CacheStats, EvictionReport, RegisterEntry};
pub use pins::{PinGuard, PinRegistry};
pub use reconcile::ReconcileReport;
