//! Event Publisher Implementation
//!
//! 缓存事件广播（用量告警、淘汰、压缩、对账）

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// 缓存事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum CacheEvent {
    /// 用量越过告警阈值
    UsageWarning {
        total_bytes: u64,
        max_bytes: u64,
        percent: f64,
        message: String,
    },
    /// 条目被淘汰
    Evicted {
        key: String,
        freed_bytes: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        score: Option<f64>,
    },
    /// 条目压缩完成
    Compressed {
        key: String,
        original_bytes: u64,
        compressed_bytes: u64,
    },
    /// 条目压缩失败（原始文件保持可用）
    CompressionFailed { key: String, error: String },
    /// 启动对账完成
    Reconciled {
        adopted: usize,
        dropped: usize,
        cleaned_files: usize,
    },
}

/// 事件发布器
pub struct EventPublisher {
    channel: broadcast::Sender<CacheEvent>,
}

impl EventPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { channel: tx }
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// 订阅缓存事件
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.channel.subscribe()
    }

    /// 发布用量告警
    pub fn publish_usage_warning(&self, total_bytes: u64, max_bytes: u64) {
        let percent = if max_bytes > 0 {
            total_bytes as f64 * 100.0 / max_bytes as f64
        } else {
            0.0
        };
        let message = format!(
            "Audio cache is {:.1}% full ({} of {} bytes)",
            percent, total_bytes, max_bytes
        );
        self.publish(CacheEvent::UsageWarning {
            total_bytes,
            max_bytes,
            percent,
            message,
        });
    }

    /// 发布淘汰事件
    pub fn publish_evicted(&self, key: &str, freed_bytes: u64, score: Option<f64>) {
        self.publish(CacheEvent::Evicted {
            key: key.to_string(),
            freed_bytes,
            score,
        });
    }

    /// 发布压缩完成事件
    pub fn publish_compressed(&self, key: &str, original_bytes: u64, compressed_bytes: u64) {
        self.publish(CacheEvent::Compressed {
            key: key.to_string(),
            original_bytes,
            compressed_bytes,
        });
    }

    /// 发布压缩失败事件
    pub fn publish_compression_failed(&self, key: &str, error: &str) {
        self.publish(CacheEvent::CompressionFailed {
            key: key.to_string(),
            error: error.to_string(),
        });
    }

    /// 发布对账完成事件
    pub fn publish_reconciled(&self, adopted: usize, dropped: usize, cleaned_files: usize) {
        self.publish(CacheEvent::Reconciled {
            adopted,
            dropped,
            cleaned_files,
        });
    }

    fn publish(&self, event: CacheEvent) {
        if let Err(e) = self.channel.send(event) {
            tracing::debug!(error = %e, "Failed to publish cache event (no receivers)");
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_warning() {
        let publisher = EventPublisher::new();
        let mut rx = publisher.subscribe();

        publisher.publish_usage_warning(950, 1000);

        match rx.recv().await.unwrap() {
            CacheEvent::UsageWarning {
                total_bytes,
                max_bytes,
                percent,
                message,
            } => {
                assert_eq!(total_bytes, 950);
                assert_eq!(max_bytes, 1000);
                assert!((percent - 95.0).abs() < 1e-9);
                assert!(message.contains("95.0%"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let publisher = EventPublisher::new();
        publisher.publish_evicted("k", 10, Some(0.1));
    }

    #[test]
    fn test_event_json_shape() {
        let event = CacheEvent::Evicted {
            key: "k".to_string(),
            freed_bytes: 10,
            score: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"Evicted","data":{"key":"k","freed_bytes":10}}"#);
    }
}
