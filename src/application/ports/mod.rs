//! Application Ports - 出站端口定义
//!
//! 定义应用层与基础设施层的抽象接口

mod audio_compressor;
mod metadata_storage;
mod playback_state;

#[cfg(test)]
pub(crate) mod storage_contract;

pub use audio_compressor::{AudioCompressorPort, CompressedAudio, CompressionError};
pub use metadata_storage::{MetadataStoragePort, StorageError};
pub use playback_state::{BookPlayback, PlaybackSnapshot, PlaybackStatePort};
