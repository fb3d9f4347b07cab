//! Opus Compressor - 基于 symphonia + libopus 的缓存压缩器
//!
//! 原始 WAV 解码为 PCM，必要时下混/重采样，再以 20ms 帧编码为 Ogg Opus (RFC 7845)

use ogg::writing::{PacketWriteEndInfo, PacketWriter};
use opus::{Application, Bitrate, Channels, Encoder};
use serde::Deserialize;
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::application::ports::{AudioCompressorPort, CompressedAudio, CompressionError};
use crate::domain::cache::COMPRESSED_EXTENSION;

/// Opus 支持的输入采样率
const OPUS_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Ogg Opus 的 granule position 固定以 48kHz 计
const GRANULE_RATE: u64 = 48_000;

/// 单个 Opus 包上限
const MAX_PACKET_BYTES: usize = 4000;

/// 压缩器配置
#[derive(Debug, Clone, Deserialize)]
pub struct OpusCompressorConfig {
    /// 目标比特率 (bps)
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,

    /// 帧长 (ms)，取 10/20/40/60
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
}

fn default_bitrate() -> u32 {
    32_000 // 语音 32 kbps 足够
}

fn default_frame_ms() -> u32 {
    20
}

impl Default for OpusCompressorConfig {
    fn default() -> Self {
        Self {
            bitrate: default_bitrate(),
            frame_ms: default_frame_ms(),
        }
    }
}

/// WAV → Ogg Opus 压缩器
pub struct OpusCompressor {
    config: OpusCompressorConfig,
}

impl OpusCompressor {
    pub fn new(config: OpusCompressorConfig) -> Self {
        Self { config }
    }
}

impl Default for OpusCompressor {
    fn default() -> Self {
        Self::new(OpusCompressorConfig::default())
    }
}

/// 解码后的交错 PCM
struct Pcm {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: usize,
}

impl Pcm {
    fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }

    fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.frames() as u64 * 1000 / self.sample_rate as u64
    }
}

impl AudioCompressorPort for OpusCompressor {
    fn extension(&self) -> &'static str {
        COMPRESSED_EXTENSION
    }

    fn compress(&self, raw: &[u8]) -> Result<CompressedAudio, CompressionError> {
        if raw.len() < 12 || &raw[0..4] != b"RIFF" || &raw[8..12] != b"WAVE" {
            return Err(CompressionError::InvalidInput(
                "Input is not a RIFF/WAVE file".to_string(),
            ));
        }

        let pcm = decode(raw)?;
        if pcm.frames() == 0 {
            return Err(CompressionError::InvalidInput(
                "WAV contains no samples".to_string(),
            ));
        }
        let duration_ms = pcm.duration_ms();
        let pcm = downmix_to_stereo(pcm);
        let pcm = resample_for_opus(pcm);
        let data = self.encode(&pcm)?;

        tracing::debug!(
            original_size = raw.len(),
            opus_size = data.len(),
            bitrate = self.config.bitrate,
            duration_ms,
            "Encoded cache entry to Opus"
        );

        Ok(CompressedAudio {
            data,
            duration_ms,
            original_size: raw.len(),
        })
    }
}

impl OpusCompressor {
    fn encode(&self, pcm: &Pcm) -> Result<Vec<u8>, CompressionError> {
        let encoding = |what: &str, e: opus::Error| {
            CompressionError::EncodingError(format!("{}: {}", what, e))
        };

        let channels = if pcm.channels == 1 {
            Channels::Mono
        } else {
            Channels::Stereo
        };
        let mut encoder = Encoder::new(pcm.sample_rate, channels, Application::Voip)
            .map_err(|e| encoding("Failed to create Opus encoder", e))?;
        encoder
            .set_bitrate(Bitrate::Bits(self.config.bitrate as i32))
            .map_err(|e| encoding("Failed to set bitrate", e))?;

        // 编码器前瞻，以输入采样率计
        let lookahead = encoder.get_lookahead().unwrap_or(312).max(0) as u64;
        let to_granule = |samples: u64| samples * GRANULE_RATE / pcm.sample_rate as u64;
        let pre_skip = to_granule(lookahead);

        let frame_ms = match self.config.frame_ms {
            10 | 20 | 40 | 60 => self.config.frame_ms,
            _ => default_frame_ms(),
        };
        let frame_len = pcm.sample_rate as usize * frame_ms as usize / 1000;
        let frame_samples = frame_len * pcm.channels;
        let frame_granule = to_granule(frame_len as u64);

        let pcm_i16: Vec<i16> = pcm
            .samples
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();

        // 额外的静音帧把前瞻缓冲里剩余的样本推出来
        let flush_frames = (lookahead as usize + frame_len - 1) / frame_len;
        let mut frames: Vec<Vec<i16>> = pcm_i16
            .chunks(frame_samples)
            .map(|chunk| {
                let mut frame = chunk.to_vec();
                frame.resize(frame_samples, 0);
                frame
            })
            .collect();
        frames.extend(std::iter::repeat(vec![0i16; frame_samples]).take(flush_frames.max(1)));

        let mut out = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut out);
            let io = |what: &str, e: std::io::Error| {
                CompressionError::EncodingError(format!("{}: {}", what, e))
            };

            writer
                .write_packet(
                    opus_head(pcm.channels as u8, pcm.sample_rate, pre_skip as u16),
                    0,
                    PacketWriteEndInfo::EndPage,
                    0,
                )
                .map_err(|e| io("Failed to write OpusHead", e))?;
            writer
                .write_packet(opus_tags(), 0, PacketWriteEndInfo::EndPage, 0)
                .map_err(|e| io("Failed to write OpusTags", e))?;

            let mut packet = vec![0u8; MAX_PACKET_BYTES];
            let mut granule = pre_skip;
            let last = frames.len() - 1;
            for (i, frame) in frames.iter().enumerate() {
                let len = encoder
                    .encode(frame, &mut packet)
                    .map_err(|e| encoding("Opus encode failed", e))?;
                granule += frame_granule;
                let end = if i == last {
                    PacketWriteEndInfo::EndStream
                } else {
                    PacketWriteEndInfo::NormalPacket
                };
                writer
                    .write_packet(packet[..len].to_vec(), 0, end, granule)
                    .map_err(|e| io("Failed to write Opus packet", e))?;
            }
        }

        Ok(out)
    }
}

/// symphonia 解码整段 WAV
fn decode(raw: &[u8]) -> Result<Pcm, CompressionError> {
    let decoding = |what: &str, e: SymphoniaError| {
        CompressionError::DecodingError(format!("{}: {}", what, e))
    };

    let mss = MediaSourceStream::new(Box::new(Cursor::new(raw.to_vec())), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("wav");

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| decoding("Probe failed", e))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| CompressionError::DecodingError("No audio track found".to_string()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| CompressionError::DecodingError("Unknown sample rate".to_string()))?;
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count())
        .ok_or_else(|| CompressionError::DecodingError("Unknown channel count".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| decoding("Decoder creation failed", e))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(decoding("Packet read error", e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!(error = e, "Skipping undecodable WAV packet");
                continue;
            }
            Err(e) => return Err(decoding("Decode failed", e)),
        };

        let spec = *decoded.spec();
        let frames = decoded.frames();
        let mut buf = SampleBuffer::<f32>::new(frames as u64, spec);
        buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(&buf.samples()[..frames * spec.channels.count()]);
    }

    Ok(Pcm {
        samples,
        sample_rate,
        channels,
    })
}

/// Opus 只接受单声道/立体声，多声道取前两路平均后复制
fn downmix_to_stereo(pcm: Pcm) -> Pcm {
    if pcm.channels <= 2 {
        return pcm;
    }
    let samples = pcm
        .samples
        .chunks(pcm.channels)
        .flat_map(|frame| {
            let mono = frame.iter().sum::<f32>() / frame.len() as f32;
            [mono, mono]
        })
        .collect();
    Pcm {
        samples,
        sample_rate: pcm.sample_rate,
        channels: 2,
    }
}

/// 线性插值重采样到不低于原采样率的最近 Opus 采样率
fn resample_for_opus(pcm: Pcm) -> Pcm {
    let target = OPUS_RATES
        .iter()
        .copied()
        .find(|rate| *rate >= pcm.sample_rate)
        .unwrap_or(48_000);
    if target == pcm.sample_rate {
        return pcm;
    }

    let frames = pcm.frames();
    let ratio = target as f64 / pcm.sample_rate as f64;
    let out_frames = (frames as f64 * ratio) as usize;
    let mut samples = Vec::with_capacity(out_frames * pcm.channels);
    for i in 0..out_frames {
        let pos = i as f64 / ratio;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let next = (idx + 1).min(frames - 1);
        for ch in 0..pcm.channels {
            let s0 = pcm.samples[idx * pcm.channels + ch];
            let s1 = pcm.samples[next * pcm.channels + ch];
            samples.push(s0 + (s1 - s0) * frac);
        }
    }

    Pcm {
        samples,
        sample_rate: target,
        channels: pcm.channels,
    }
}

/// OpusHead 标识包 (RFC 7845 §5.1)
fn opus_head(channels: u8, input_rate: u32, pre_skip: u16) -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.push(1);
    head.push(channels);
    head.extend_from_slice(&pre_skip.to_le_bytes());
    head.extend_from_slice(&input_rate.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes());
    head.push(0);
    head
}

/// OpusTags 注释包 (RFC 7845 §5.2)，无用户注释
fn opus_tags() -> Vec<u8> {
    let vendor = b"rovel-cache";
    let mut tags = Vec::with_capacity(16 + vendor.len());
    tags.extend_from_slice(b"OpusTags");
    tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    tags.extend_from_slice(vendor);
    tags.extend_from_slice(&0u32.to_le_bytes());
    tags
}
