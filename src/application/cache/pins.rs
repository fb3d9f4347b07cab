//! Pin Registry - 淘汰豁免登记
//!
//! 每个 key 内部维护引用计数，对外仍是布尔语义：
//! 第一个持有者 pin 时返回 true，最后一个持有者 unpin 时返回 true。

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct PinRegistry {
    counts: DashMap<String, usize>,
}

impl PinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 增加一个持有者；key 由未固定变为固定时返回 true
    pub fn pin(&self, key: &str) -> bool {
        let mut count = self.counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// 释放一个持有者；key 变为未固定时返回 true
    pub fn unpin(&self, key: &str) -> bool {
        match self.counts.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() <= 1 {
                    occupied.remove();
                    true
                } else {
                    *occupied.get_mut() -= 1;
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn is_pinned(&self, key: &str) -> bool {
        self.counts.contains_key(key)
    }

    pub fn pinned_count(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// 作用域 pin，drop 时自动释放
#[must_use = "the pin is released as soon as the guard is dropped"]
pub struct PinGuard {
    registry: Arc<PinRegistry>,
    key: String,
}

impl PinGuard {
    pub(crate) fn new(registry: Arc<PinRegistry>, key: &str) -> Self {
        registry.pin(key);
        Self {
            registry,
            key: key.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.registry.unpin(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_unpin_reports_transitions() {
        let pins = PinRegistry::new();
        assert!(!pins.is_pinned("a"));

        assert!(pins.pin("a"));
        assert!(pins.is_pinned("a"));
        // 第二个持有者不改变对外状态
        assert!(!pins.pin("a"));

        assert!(!pins.unpin("a"));
        assert!(pins.is_pinned("a"));
        assert!(pins.unpin("a"));
        assert!(!pins.is_pinned("a"));

        assert!(!pins.unpin("a"));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let pins = Arc::new(PinRegistry::new());
        {
            let guard = PinGuard::new(pins.clone(), "k");
            assert_eq!(guard.key(), "k");
            assert!(pins.is_pinned("k"));
        }
        assert!(!pins.is_pinned("k"));
        assert!(pins.is_empty());
    }

    #[test]
    fn test_guard_coexists_with_manual_pin() {
        let pins = Arc::new(PinRegistry::new());
        pins.pin("k");
        drop(PinGuard::new(pins.clone(), "k"));
        assert!(pins.is_pinned("k"));
        assert_eq!(pins.pinned_count(), 1);
    }
}
