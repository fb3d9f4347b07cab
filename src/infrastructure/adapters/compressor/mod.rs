//! Audio Compressor Adapters
//!
//! 实现 AudioCompressorPort：WAV → Ogg Opus

mod opus_compressor;

pub use opus_compressor::{OpusCompressor, OpusCompressorConfig};
