//! Events - 缓存事件发布

mod publisher;

pub use publisher::{CacheEvent, EventPublisher};
