//! MetadataStoragePort 的公共行为测试，SQLite 与 Sled 后端共用

use chrono::{Duration, Utc};
use std::sync::Arc;

use super::{MetadataStoragePort, StorageError};
use crate::domain::cache::{CompressionState, EntryMetadata};

pub fn entry(key: &str, voice: &str, size: u64) -> EntryMetadata {
    EntryMetadata::new_raw(key, voice, size)
}

fn book_entry(key: &str, voice: &str, book: &str, size: u64) -> EntryMetadata {
    let mut e = entry(key, voice, size);
    e.book_id = Some(book.to_string());
    e
}

pub async fn point_operations(storage: &dyn MetadataStoragePort) {
    assert!(storage.get("missing").await.unwrap().is_none());
    assert!(!storage.contains("missing").await.unwrap());

    let e = entry("k1", "kokoro-af", 100);
    storage.upsert(&e).await.unwrap();
    assert!(storage.contains("k1").await.unwrap());
    let loaded = storage.get("k1").await.unwrap().unwrap();
    assert_eq!(loaded.size_bytes, 100);
    assert_eq!(loaded.voice_id, "kokoro-af");
    assert_eq!(loaded.compression_state, CompressionState::Raw);

    // upsert 覆盖同一 key，不产生第二条记录
    let mut updated = e.clone();
    updated.size_bytes = 250;
    storage.upsert(&updated).await.unwrap();
    assert_eq!(storage.count().await.unwrap(), 1);
    assert_eq!(storage.total_size().await.unwrap(), 250);

    assert!(storage.remove("k1").await.unwrap());
    assert!(!storage.remove("k1").await.unwrap());
    assert_eq!(storage.count().await.unwrap(), 0);
    assert_eq!(storage.total_size().await.unwrap(), 0);
}

pub async fn aggregates(storage: &dyn MetadataStoragePort) {
    storage
        .upsert_batch(&[
            book_entry("a", "v1", "book-1", 100),
            book_entry("b", "v1", "book-1", 200),
            book_entry("c", "v2", "book-2", 50),
            entry("d", "v2", 25),
        ])
        .await
        .unwrap();

    assert_eq!(storage.total_size().await.unwrap(), 375);
    assert_eq!(storage.count().await.unwrap(), 4);

    let by_book = storage.size_by_book().await.unwrap();
    assert_eq!(by_book.get("book-1"), Some(&300));
    assert_eq!(by_book.get("book-2"), Some(&50));
    assert_eq!(by_book.len(), 2);

    let by_voice = storage.size_by_voice().await.unwrap();
    assert_eq!(by_voice.get("v1"), Some(&300));
    assert_eq!(by_voice.get("v2"), Some(&75));

    assert_eq!(storage.compressed_count().await.unwrap(), 0);
    let mut compressed = storage.get("b").await.unwrap().unwrap();
    compressed.compression_state = CompressionState::Compressing;
    storage.upsert(&compressed).await.unwrap();
    storage
        .replace_entry(
            "b",
            CompressionState::Compressing,
            &compressed.clone().into_compressed(40),
        )
        .await
        .unwrap();
    assert_eq!(storage.compressed_count().await.unwrap(), 1);
    assert_eq!(storage.total_size().await.unwrap(), 215);
    assert_eq!(storage.size_by_book().await.unwrap().get("book-1"), Some(&140));

    // 删除后分组聚合同步更新
    storage.remove("c").await.unwrap();
    let by_book = storage.size_by_book().await.unwrap();
    assert!(by_book.get("book-2").map_or(true, |size| *size == 0));
    assert_eq!(storage.size_by_voice().await.unwrap().get("v2"), Some(&25));
}

pub async fn touch_increments(storage: &dyn MetadataStoragePort) {
    let mut e = entry("k", "v", 10);
    e.last_accessed = Utc::now() - Duration::days(3);
    storage.upsert(&e).await.unwrap();
    assert_eq!(storage.max_access_count().await.unwrap(), 0);

    let now = Utc::now();
    assert!(storage.touch("k", now).await.unwrap());
    assert!(storage.touch("k", now).await.unwrap());
    assert!(!storage.touch("missing", now).await.unwrap());

    let loaded = storage.get("k").await.unwrap().unwrap();
    assert_eq!(loaded.access_count, 2);
    assert_eq!(
        loaded.last_accessed.timestamp_millis(),
        now.timestamp_millis()
    );
    assert_eq!(storage.max_access_count().await.unwrap(), 2);
}

pub async fn find_by_state(storage: &dyn MetadataStoragePort) {
    let now = Utc::now();
    let mut old = entry("old", "v", 10);
    old.last_accessed = now - Duration::hours(10);
    let mut older = entry("older", "v", 10);
    older.last_accessed = now - Duration::hours(20);
    let mut hot = entry("hot", "v", 10);
    hot.last_accessed = now;
    let mut failed = entry("failed", "v", 10);
    failed.last_accessed = now - Duration::hours(30);
    failed.compression_state = CompressionState::CompressionFailed;
    storage
        .upsert_batch(&[old, older, hot, failed])
        .await
        .unwrap();

    let cutoff = now - Duration::hours(1);
    let raw = storage
        .find_by_state(CompressionState::Raw, Some(cutoff), 10)
        .await
        .unwrap();
    let keys: Vec<_> = raw.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["older", "old"]);

    let limited = storage
        .find_by_state(CompressionState::Raw, None, 1)
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].key, "older");

    let failed = storage
        .find_by_state(CompressionState::CompressionFailed, Some(cutoff), 10)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
}

pub async fn compression_state_cas(storage: &dyn MetadataStoragePort) {
    storage.upsert(&entry("k", "v", 10)).await.unwrap();
    let started = Utc::now() - Duration::hours(2);

    // 状态不匹配时不生效
    assert!(!storage
        .update_compression_state(
            "k",
            CompressionState::Compressing,
            CompressionState::Raw,
            None
        )
        .await
        .unwrap());

    assert!(storage
        .update_compression_state(
            "k",
            CompressionState::Raw,
            CompressionState::Compressing,
            Some(started)
        )
        .await
        .unwrap());
    let loaded = storage.get("k").await.unwrap().unwrap();
    assert_eq!(loaded.compression_state, CompressionState::Compressing);
    assert_eq!(
        loaded.compression_started_at.map(|t| t.timestamp_millis()),
        Some(started.timestamp_millis())
    );

    let stale = storage
        .find_stale_compressing(Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    let fresh = storage
        .find_stale_compressing(Utc::now() - Duration::hours(3))
        .await
        .unwrap();
    assert!(fresh.is_empty());

    assert!(storage
        .update_compression_state(
            "k",
            CompressionState::Compressing,
            CompressionState::Raw,
            None
        )
        .await
        .unwrap());
    let loaded = storage.get("k").await.unwrap().unwrap();
    assert_eq!(loaded.compression_state, CompressionState::Raw);
    assert!(loaded.compression_started_at.is_none());

    assert!(!storage
        .update_compression_state(
            "missing",
            CompressionState::Raw,
            CompressionState::Compressing,
            None
        )
        .await
        .unwrap());
}

pub async fn replace_entry(storage: &dyn MetadataStoragePort) {
    let mut original = entry("old", "v", 1000);
    original.compression_state = CompressionState::Compressing;
    storage.upsert(&original).await.unwrap();

    let mut renamed = original.clone().into_compressed(100);
    renamed.key = "new".to_string();
    storage
        .replace_entry("old", CompressionState::Compressing, &renamed)
        .await
        .unwrap();

    assert!(storage.get("old").await.unwrap().is_none());
    let loaded = storage.get("new").await.unwrap().unwrap();
    assert_eq!(loaded.compression_state, CompressionState::Compressed);
    assert_eq!(storage.total_size().await.unwrap(), 100);
    assert_eq!(storage.count().await.unwrap(), 1);

    // 旧 key 已不存在时整个替换失败，不插入新记录
    let ghost = entry("ghost-new", "v", 5);
    let err = storage
        .replace_entry("ghost", CompressionState::Compressing, &ghost)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
    assert!(storage.get("ghost-new").await.unwrap().is_none());
    assert_eq!(storage.total_size().await.unwrap(), 100);

    // 旧记录已被重新登记为 Raw 时拒绝替换，保留新登记的记录
    storage.upsert(&entry("fresh", "v", 2000)).await.unwrap();
    let stale = entry("fresh", "v", 1000).into_compressed(50);
    let err = storage
        .replace_entry("fresh", CompressionState::Compressing, &stale)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Conflict(_)));
    let kept = storage.get("fresh").await.unwrap().unwrap();
    assert_eq!(kept.compression_state, CompressionState::Raw);
    assert_eq!(kept.size_bytes, 2000);
    assert_eq!(storage.total_size().await.unwrap(), 2100);
    assert_eq!(storage.compressed_count().await.unwrap(), 1);
}

pub async fn batch_and_clear(storage: &dyn MetadataStoragePort) {
    let entries: Vec<_> = (0..5)
        .map(|i| entry(&format!("k{}", i), "v", 10))
        .collect();
    storage.upsert_batch(&entries).await.unwrap();
    assert_eq!(storage.count().await.unwrap(), 5);

    let removed = storage
        .remove_batch(&["k0".to_string(), "k1".to_string(), "nope".to_string()])
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(storage.total_size().await.unwrap(), 30);
    assert_eq!(storage.list_all().await.unwrap().len(), 3);

    storage.clear().await.unwrap();
    assert_eq!(storage.count().await.unwrap(), 0);
    assert_eq!(storage.total_size().await.unwrap(), 0);
    assert!(storage.size_by_voice().await.unwrap().values().all(|v| *v == 0));
}

/// clear 与并发写入交错后，聚合与索引仍和剩余条目一致
pub async fn clear_concurrent_with_writes(storage: Arc<dyn MetadataStoragePort>) {
    let seeded: Vec<_> = (0..50)
        .map(|i| entry(&format!("seed-{}", i), "v", 10))
        .collect();
    storage.upsert_batch(&seeded).await.unwrap();

    let writer = {
        let storage = storage.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                storage
                    .upsert(&entry(&format!("w-{}", i), "v", 7))
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    for _ in 0..5 {
        storage.clear().await.unwrap();
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();

    let remaining = storage.list_all().await.unwrap();
    let sum: u64 = remaining.iter().map(|e| e.size_bytes).sum();
    assert_eq!(storage.total_size().await.unwrap(), sum);
    assert_eq!(storage.count().await.unwrap(), remaining.len() as u64);
    assert_eq!(
        storage.size_by_voice().await.unwrap().get("v").copied().unwrap_or(0),
        sum
    );
    let raw = storage
        .find_by_state(CompressionState::Raw, None, usize::MAX)
        .await
        .unwrap();
    assert_eq!(raw.len(), remaining.len());

    // 最后一次 clear 之后不再有残留聚合
    storage.clear().await.unwrap();
    assert_eq!(storage.total_size().await.unwrap(), 0);
    assert_eq!(storage.count().await.unwrap(), 0);
    assert!(storage.size_by_voice().await.unwrap().is_empty());
}

pub async fn key_prefix(storage: &dyn MetadataStoragePort) {
    storage
        .upsert_batch(&[
            entry("kokoro_r100_aa", "kokoro", 1),
            entry("kokoro_r100_bb", "kokoro", 1),
            entry("Kokoro_r100_cc", "Kokoro", 1),
            entry("piper_r100_aa", "piper", 1),
        ])
        .await
        .unwrap();

    let found = storage.find_by_key_prefix("kokoro_").await.unwrap();
    let mut keys: Vec<_> = found.into_iter().map(|e| e.key).collect();
    keys.sort();
    assert_eq!(keys, vec!["kokoro_r100_aa", "kokoro_r100_bb"]);
}
