//! Sled Persistence - Sled 元数据存储实现

mod metadata_store;

pub use metadata_store::{SledMetadataStorage, SledStoreConfig};
