//! Infrastructure Layer - 基础设施层
//!
//! 提供所有端口的具体实现

pub mod adapters;
pub mod events;
pub mod persistence;
pub mod worker;

pub use events::{CacheEvent, EventPublisher};
pub use persistence::sled::SledMetadataStorage;
pub use persistence::sqlite::SqliteMetadataStorage;
pub use worker::{CompressionWorker, CompressionWorkerConfig};
