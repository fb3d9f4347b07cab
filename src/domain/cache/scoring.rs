//! Cache Context - 淘汰评分
//!
//! `score(entry, context) -> [0, 1]`，分数越高越应保留。
//! 淘汰时按分数升序，从低端开始删除。
//!
//! 五个子分数加权求和：
//! - 最近访问（指数衰减，半衰期 48 小时）
//! - 访问频率（按全局最大访问次数归一化）
//! - 阅读位置（前方缓慢衰减，后方快速衰减并打折）
//! - 全书进度（`4p(1-p)`，50% 时最高）
//! - 当前音色匹配

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

use super::EntryMetadata;

/// 子分数权重
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ScoringWeights {
    #[serde(default = "default_recency_weight")]
    pub recency: f64,
    #[serde(default = "default_frequency_weight")]
    pub frequency: f64,
    #[serde(default = "default_position_weight")]
    pub position: f64,
    #[serde(default = "default_completion_weight")]
    pub completion: f64,
    #[serde(default = "default_voice_weight")]
    pub voice: f64,
}

fn default_recency_weight() -> f64 {
    0.30
}

fn default_frequency_weight() -> f64 {
    0.20
}

fn default_position_weight() -> f64 {
    0.30
}

fn default_completion_weight() -> f64 {
    0.15
}

fn default_voice_weight() -> f64 {
    0.05
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            recency: default_recency_weight(),
            frequency: default_frequency_weight(),
            position: default_position_weight(),
            completion: default_completion_weight(),
            voice: default_voice_weight(),
        }
    }
}

impl ScoringWeights {
    pub fn sum(&self) -> f64 {
        self.recency + self.frequency + self.position + self.completion + self.voice
    }
}

/// 评分策略
///
/// 权重与衰减参数均为经验值，作为默认策略而非固定规则
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScoringPolicy {
    #[serde(default)]
    pub weights: ScoringWeights,

    /// 最近访问的半衰期（小时）
    #[serde(default = "default_recency_half_life_hours")]
    pub recency_half_life_hours: f64,

    /// 播放位置前方的衰减窗口（段）
    #[serde(default = "default_ahead_window")]
    pub ahead_window: f64,

    /// 播放位置后方的衰减窗口（段）
    #[serde(default = "default_behind_window")]
    pub behind_window: f64,

    /// 播放位置后方的额外折扣
    #[serde(default = "default_behind_penalty")]
    pub behind_penalty: f64,
}

fn default_recency_half_life_hours() -> f64 {
    48.0
}

fn default_ahead_window() -> f64 {
    20.0
}

fn default_behind_window() -> f64 {
    5.0
}

fn default_behind_penalty() -> f64 {
    0.5
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            recency_half_life_hours: default_recency_half_life_hours(),
            ahead_window: default_ahead_window(),
            behind_window: default_behind_window(),
            behind_penalty: default_behind_penalty(),
        }
    }
}

/// 单次淘汰使用的上下文（不持久化）
#[derive(Debug, Clone, Default)]
pub struct EvictionContext {
    pub active_voice_id: Option<String>,
    /// 打开的书 book_id -> 当前播放段，未打开的书不参与位置评分
    pub current_segments: HashMap<String, u32>,
    /// book_id -> 完成度 0.0..=1.0
    pub completion: HashMap<String, f64>,
    pub max_access_count: u64,
}

/// 淘汰评分计算器（纯函数，无内部状态）
#[derive(Debug, Clone, Default)]
pub struct EvictionScorer {
    policy: ScoringPolicy,
}

impl EvictionScorer {
    pub fn new(policy: ScoringPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// 以当前时间评分
    pub fn score(&self, entry: &EntryMetadata, context: &EvictionContext) -> f64 {
        self.score_at(entry, context, Utc::now())
    }

    /// 以指定时间评分
    pub fn score_at(
        &self,
        entry: &EntryMetadata,
        context: &EvictionContext,
        now: DateTime<Utc>,
    ) -> f64 {
        let w = &self.policy.weights;
        let total_weight = w.sum();
        if !(total_weight > 0.0) {
            return 0.0;
        }

        let weighted = w.recency * self.recency(entry, now)
            + w.frequency * frequency(entry, context)
            + w.position * self.position(entry, context)
            + w.completion * completion(entry, context)
            + w.voice * voice_match(entry, context);

        (weighted / total_weight).clamp(0.0, 1.0)
    }

    fn recency(&self, entry: &EntryMetadata, now: DateTime<Utc>) -> f64 {
        let half_life = self.policy.recency_half_life_hours;
        if !(half_life > 0.0) {
            return 0.0;
        }
        let age_ms = (now - entry.last_accessed).num_milliseconds().max(0) as f64;
        let age_hours = age_ms / 3_600_000.0;
        0.5_f64.powf(age_hours / half_life)
    }

    fn position(&self, entry: &EntryMetadata, context: &EvictionContext) -> f64 {
        let (Some(book_id), Some(segment)) = (entry.book_id.as_ref(), entry.segment_index) else {
            return 0.0;
        };
        let Some(&current) = context.current_segments.get(book_id) else {
            return 0.0;
        };

        let distance = segment as f64 - current as f64;
        if distance >= 0.0 {
            decay(distance, self.policy.ahead_window)
        } else {
            self.policy.behind_penalty * decay(-distance, self.policy.behind_window)
        }
    }
}

fn decay(distance: f64, window: f64) -> f64 {
    if window > 0.0 {
        (-distance / window).exp()
    } else if distance == 0.0 {
        1.0
    } else {
        0.0
    }
}

fn frequency(entry: &EntryMetadata, context: &EvictionContext) -> f64 {
    if context.max_access_count == 0 {
        return 0.0;
    }
    (entry.access_count as f64 / context.max_access_count as f64).clamp(0.0, 1.0)
}

fn completion(entry: &EntryMetadata, context: &EvictionContext) -> f64 {
    let Some(book_id) = entry.book_id.as_ref() else {
        return 0.0;
    };
    match context.completion.get(book_id) {
        Some(p) if p.is_finite() => {
            let p = p.clamp(0.0, 1.0);
            4.0 * p * (1.0 - p)
        }
        _ => 0.0,
    }
}

fn voice_match(entry: &EntryMetadata, context: &EvictionContext) -> f64 {
    match context.active_voice_id.as_deref() {
        Some(active) if active == entry.voice_id => 1.0,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry_at(now: DateTime<Utc>, hours_ago: i64) -> EntryMetadata {
        let mut entry = EntryMetadata::new_raw("k", "kokoro-af", 1000);
        entry.last_accessed = now - Duration::hours(hours_ago);
        entry
    }

    fn book_entry(now: DateTime<Utc>, segment: u32) -> EntryMetadata {
        let mut entry = entry_at(now, 0);
        entry.book_id = Some("book-1".to_string());
        entry.segment_index = Some(segment);
        entry
    }

    fn recency_only() -> EvictionScorer {
        EvictionScorer::new(ScoringPolicy {
            weights: ScoringWeights {
                recency: 1.0,
                frequency: 0.0,
                position: 0.0,
                completion: 0.0,
                voice: 0.0,
            },
            ..Default::default()
        })
    }

    fn position_only() -> EvictionScorer {
        EvictionScorer::new(ScoringPolicy {
            weights: ScoringWeights {
                recency: 0.0,
                frequency: 0.0,
                position: 1.0,
                completion: 0.0,
                voice: 0.0,
            },
            ..Default::default()
        })
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        assert!((ScoringWeights::default().sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_in_unit_interval() {
        let now = Utc::now();
        let scorer = EvictionScorer::default();
        let mut entry = book_entry(now, 12);
        entry.access_count = 50;
        let context = EvictionContext {
            active_voice_id: Some("kokoro-af".to_string()),
            current_segments: HashMap::from([("book-1".to_string(), 12)]),
            completion: HashMap::from([("book-1".to_string(), 0.5)]),
            max_access_count: 10,
            ..Default::default()
        };

        let score = scorer.score_at(&entry, &context, now);
        assert!((0.0..=1.0).contains(&score));
        // 所有维度都取满分
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_context_contributes_only_recency() {
        let now = Utc::now();
        let scorer = EvictionScorer::default();
        let entry = book_entry(now, 3);
        let score = scorer.score_at(&entry, &EvictionContext::default(), now);
        assert!((score - 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_recency_half_life() {
        let now = Utc::now();
        let scorer = recency_only();
        let ctx = EvictionContext::default();
        let fresh = scorer.score_at(&entry_at(now, 0), &ctx, now);
        let two_days = scorer.score_at(&entry_at(now, 48), &ctx, now);
        let week = scorer.score_at(&entry_at(now, 24 * 7), &ctx, now);
        assert!((fresh - 1.0).abs() < 1e-9);
        assert!((two_days - 0.5).abs() < 1e-6);
        assert!(week < 0.1);
    }

    #[test]
    fn test_future_access_time_is_clamped() {
        let now = Utc::now();
        let scorer = recency_only();
        let entry = entry_at(now, -5);
        let score = scorer.score_at(&entry, &EvictionContext::default(), now);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_monotonic_in_access_count() {
        let now = Utc::now();
        let scorer = EvictionScorer::default();
        let ctx = EvictionContext {
            max_access_count: 20,
            ..Default::default()
        };
        let mut previous = f64::MIN;
        for count in [0, 1, 5, 10, 20, 40] {
            let mut entry = entry_at(now, 10);
            entry.access_count = count;
            let score = scorer.score_at(&entry, &ctx, now);
            assert!(score >= previous);
            previous = score;
        }
    }

    #[test]
    fn test_monotonic_in_recency() {
        let now = Utc::now();
        let scorer = EvictionScorer::default();
        let ctx = EvictionContext::default();
        let mut previous = f64::MIN;
        for hours_ago in [500, 100, 48, 10, 1, 0] {
            let score = scorer.score_at(&entry_at(now, hours_ago), &ctx, now);
            assert!(score >= previous);
            previous = score;
        }
    }

    #[test]
    fn test_ahead_decays_slower_than_behind() {
        let now = Utc::now();
        let scorer = position_only();
        let ctx = EvictionContext {
            current_segments: HashMap::from([("book-1".to_string(), 100)]),
            ..Default::default()
        };

        let at = scorer.score_at(&book_entry(now, 100), &ctx, now);
        let ahead = scorer.score_at(&book_entry(now, 105), &ctx, now);
        let behind = scorer.score_at(&book_entry(now, 95), &ctx, now);

        assert!((at - 1.0).abs() < 1e-9);
        assert!((ahead - (-5.0_f64 / 20.0).exp()).abs() < 1e-9);
        assert!((behind - 0.5 * (-1.0_f64).exp()).abs() < 1e-9);
        assert!(ahead > behind);
    }

    #[test]
    fn test_unknown_position_contributes_zero() {
        let now = Utc::now();
        let scorer = position_only();
        let ctx = EvictionContext {
            current_segments: HashMap::from([("other-book".to_string(), 1)]),
            ..Default::default()
        };
        assert_eq!(scorer.score_at(&book_entry(now, 1), &ctx, now), 0.0);

        let orphan = entry_at(now, 0);
        assert_eq!(scorer.score_at(&orphan, &ctx, now), 0.0);
    }

    #[test]
    fn test_completion_bell_curve() {
        let now = Utc::now();
        let scorer = EvictionScorer::new(ScoringPolicy {
            weights: ScoringWeights {
                recency: 0.0,
                frequency: 0.0,
                position: 0.0,
                completion: 1.0,
                voice: 0.0,
            },
            ..Default::default()
        });
        let score_for = |p: f64| {
            let ctx = EvictionContext {
                completion: HashMap::from([("book-1".to_string(), p)]),
                ..Default::default()
            };
            scorer.score_at(&book_entry(now, 0), &ctx, now)
        };

        assert!((score_for(0.5) - 1.0).abs() < 1e-9);
        assert!((score_for(0.25) - 0.75).abs() < 1e-9);
        assert_eq!(score_for(0.0), 0.0);
        assert_eq!(score_for(1.0), 0.0);
        assert_eq!(score_for(1.7), 0.0);
        assert_eq!(score_for(f64::NAN), 0.0);
    }

    #[test]
    fn test_voice_match_tie_breaker() {
        let now = Utc::now();
        let scorer = EvictionScorer::default();
        let ctx = EvictionContext {
            active_voice_id: Some("kokoro-af".to_string()),
            ..Default::default()
        };
        let matching = entry_at(now, 24);
        let mut other = entry_at(now, 24);
        other.voice_id = "piper-en".to_string();

        let diff = scorer.score_at(&matching, &ctx, now) - scorer.score_at(&other, &ctx, now);
        assert!((diff - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_zero_weights_yield_zero() {
        let scorer = EvictionScorer::new(ScoringPolicy {
            weights: ScoringWeights {
                recency: 0.0,
                frequency: 0.0,
                position: 0.0,
                completion: 0.0,
                voice: 0.0,
            },
            ..Default::default()
        });
        let now = Utc::now();
        assert_eq!(
            scorer.score_at(&entry_at(now, 0), &EvictionContext::default(), now),
            0.0
        );
    }
}
