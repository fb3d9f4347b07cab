//! SQLite Persistence - SQLite 元数据存储实现

mod database;
mod metadata_repo;

pub use database::*;
pub use metadata_repo::*;
