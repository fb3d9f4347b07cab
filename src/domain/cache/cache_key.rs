//! Cache Context - 缓存 key 与文件名编解码

use serde::{Deserialize, Serialize};

/// 原始音频（合成输出）扩展名
pub const RAW_EXTENSION: &str = "wav";

/// 压缩后音频扩展名（默认 Opus）
pub const COMPRESSED_EXTENSION: &str = "opus";

/// 压缩中间产物扩展名
pub const TEMP_EXTENSION: &str = "tmp";

/// 缓存 key
///
/// 由 voice、语速标签、文本 md5 组成，渲染为文件名 stem：
/// `{voice}_{rate}_{hash}`，例如 `kokoro-af_heart_r100_5d41402abc4b2a76b9719d911017c592`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    voice_id: String,
    rate_tag: String,
    content_hash: String,
}

impl CacheKey {
    /// 从合成参数生成 key
    ///
    /// 相同 (voice, rate, text) 总是得到相同 key
    pub fn new(voice_id: &str, rate: f32, text: &str) -> Self {
        let digest = md5::compute(text.as_bytes());
        Self {
            voice_id: sanitize_voice(voice_id),
            rate_tag: rate_tag(rate),
            content_hash: format!("{:x}", digest),
        }
    }

    /// 从文件名 stem 解析 key（尽力而为，仅用于孤儿文件收养）
    ///
    /// hash 与 rate 从右侧截取，剩余部分视为 voice，因此 voice 可以包含 `_`
    pub fn parse(stem: &str) -> Option<Self> {
        let mut parts = stem.rsplitn(3, '_');
        let hash = parts.next()?;
        let rate = parts.next()?;
        let voice = parts.next()?;

        let hash_ok = !hash.is_empty() && hash.chars().all(|c| c.is_ascii_hexdigit());
        let rate_ok = rate.len() > 1
            && rate.starts_with('r')
            && rate[1..].chars().all(|c| c.is_ascii_digit());
        if !hash_ok || !rate_ok || voice.is_empty() {
            return None;
        }

        Some(Self {
            voice_id: voice.to_string(),
            rate_tag: rate.to_string(),
            content_hash: hash.to_string(),
        })
    }

    pub fn voice_id(&self) -> &str {
        &self.voice_id
    }

    pub fn rate_tag(&self) -> &str {
        &self.rate_tag
    }

    /// 文件名 stem（同时作为元数据记录的 key）
    pub fn stem(&self) -> String {
        format!("{}_{}_{}", self.voice_id, self.rate_tag, self.content_hash)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.voice_id, self.rate_tag, self.content_hash)
    }
}

/// stem 能否安全地作为文件名使用
pub fn is_valid_stem(stem: &str) -> bool {
    !stem.is_empty()
        && stem != "."
        && stem != ".."
        && stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// 已知的引擎前缀
const KNOWN_ENGINES: &[&str] = &["kokoro", "piper", "supertonic", "system"];

/// 从 voice id 前缀推断引擎
pub fn infer_engine_type(voice_id: &str) -> String {
    let lower = voice_id.to_lowercase();
    KNOWN_ENGINES
        .iter()
        .find(|engine| {
            lower
                .strip_prefix(*engine)
                .map(|rest| rest.is_empty() || rest.starts_with(&['-', '_', '.'][..]))
                .unwrap_or(false)
        })
        .map(|engine| engine.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// 语速标签: rate * 100 取整
fn rate_tag(rate: f32) -> String {
    let centis = if rate.is_finite() && rate > 0.0 {
        (rate * 100.0).round() as u32
    } else {
        100
    };
    format!("r{}", centis)
}

/// 保留字母数字与 `-` `_` `.`，其余替换为 `-`
fn sanitize_voice(voice_id: &str) -> String {
    let sanitized: String = voice_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "default".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        let a = CacheKey::new("kokoro-af_heart", 1.0, "Hello world");
        let b = CacheKey::new("kokoro-af_heart", 1.0, "Hello world");
        assert_eq!(a, b);
        assert_eq!(a.stem(), b.stem());
    }

    #[test]
    fn test_key_differs_by_input() {
        let base = CacheKey::new("kokoro-af_heart", 1.0, "Hello world");
        assert_ne!(base, CacheKey::new("kokoro-af_heart", 1.25, "Hello world"));
        assert_ne!(base, CacheKey::new("piper-en", 1.0, "Hello world"));
        assert_ne!(base, CacheKey::new("kokoro-af_heart", 1.0, "Hello there"));
    }

    #[test]
    fn test_stem_format() {
        let key = CacheKey::new("kokoro-af_heart", 1.0, "hello");
        assert_eq!(
            key.stem(),
            "kokoro-af_heart_r100_5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(key.to_string(), key.stem());
    }

    #[test]
    fn test_voice_is_sanitized() {
        let key = CacheKey::new("piper:en/US lessac", 1.0, "x");
        assert_eq!(key.voice_id(), "piper-en-US-lessac");
        assert!(!key.stem().contains('/'));
    }

    #[test]
    fn test_parse_stem() {
        let key = CacheKey::new("kokoro-af_heart", 0.9, "some text");
        let parsed = CacheKey::parse(&key.stem()).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.voice_id(), "kokoro-af_heart");
        assert_eq!(parsed.rate_tag(), "r90");
    }

    #[test]
    fn test_valid_stem() {
        assert!(is_valid_stem(&CacheKey::new("piper:en/US", 1.0, "x").stem()));
        assert!(is_valid_stem("legacy-file.v2"));
        assert!(!is_valid_stem(""));
        assert!(!is_valid_stem(".."));
        assert!(!is_valid_stem("../etc/passwd"));
        assert!(!is_valid_stem("a b"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(CacheKey::parse("not-a-cache-file").is_none());
        assert!(CacheKey::parse("voice_r100_nothex!").is_none());
        assert!(CacheKey::parse("voice_fast_abcdef").is_none());
        assert!(CacheKey::parse("_r100_abcdef").is_none());
    }

    #[test]
    fn test_infer_engine_type() {
        assert_eq!(infer_engine_type("kokoro-af_heart"), "kokoro");
        assert_eq!(infer_engine_type("Piper_en_US"), "piper");
        assert_eq!(infer_engine_type("supertonic"), "supertonic");
        assert_eq!(infer_engine_type("kokorox"), "unknown");
        assert_eq!(infer_engine_type("custom-voice"), "unknown");
    }
}
