//! Persistence Layer - 数据持久化
//!
//! 元数据存储的 SQLite 和 Sled 实现

pub mod sled;
pub mod sqlite;

pub use self::sled::SledMetadataStorage;
pub use self::sqlite::SqliteMetadataStorage;
