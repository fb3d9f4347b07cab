//! rovel-cache - 有声小说音频缓存守护进程
//!
//! 启动流程：加载配置 → 打开元数据存储 → 构建缓存管理器 →
//! 恢复中断的压缩 → 启动对账 → 运行压缩 worker，直到 Ctrl-C

use std::sync::Arc;
use std::time::Duration;

use rovel_cache::application::cache::CacheManager;
use rovel_cache::application::ports::{AudioCompressorPort, MetadataStoragePort};
use rovel_cache::config::{load_config, print_config, AppConfig, MetadataBackend};
use rovel_cache::infrastructure::adapters::OpusCompressor;
use rovel_cache::infrastructure::events::{CacheEvent, EventPublisher};
use rovel_cache::infrastructure::persistence::sled::{SledMetadataStorage, SledStoreConfig};
use rovel_cache::infrastructure::persistence::sqlite::{
    create_pool, run_migrations, DatabaseConfig, SqliteMetadataStorage,
};
use rovel_cache::infrastructure::worker::CompressionWorker;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置（优先级：环境变量 > 配置文件 > 默认值）
    let config = load_config().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    init_tracing(&config);

    tracing::info!("rovel-cache - audio cache daemon");
    print_config(&config);

    let storage = open_storage(&config).await?;
    let events = EventPublisher::new().arc();
    let compressor: Arc<dyn AudioCompressorPort> =
        Arc::new(OpusCompressor::new(config.compression.opus.clone()));

    let manager = CacheManager::new(
        config.manager_config(compressor.extension()),
        storage,
        events.clone(),
    )
    .await?
    .arc();

    let cancel = CancellationToken::new();
    let worker = CompressionWorker::new(
        config.compression.worker.clone(),
        manager.clone(),
        compressor,
        cancel.clone(),
    );

    // 先恢复中断的压缩，再对账，避免把半成品当作残留
    let recovered = worker.recover_stale().await?;
    if recovered > 0 {
        tracing::info!(recovered, "Recovered interrupted compressions");
    }
    let report = manager.reconcile().await?;
    tracing::info!(?report, "Startup reconciliation finished");
    manager.evict_if_needed(None).await?;

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(log_events(events.clone(), cancel.clone())));
    if config.cache.stats_interval_secs > 0 {
        tasks.push(tokio::spawn(log_stats(
            manager.clone(),
            Duration::from_secs(config.cache.stats_interval_secs),
            cancel.clone(),
        )));
    }
    if config.compression.enabled {
        tasks.push(tokio::spawn(worker.run()));
    } else {
        tracing::info!("Background compression disabled");
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install Ctrl+C handler: {}", e))?;
    tracing::info!("Received shutdown signal");

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task failed during shutdown");
        }
    }

    tracing::info!("rovel-cache shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let log_filter = format!("{},rovel_cache={},sqlx=warn", config.log.level, config.log.level);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_filter));

    if config.log.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn open_storage(config: &AppConfig) -> anyhow::Result<Arc<dyn MetadataStoragePort>> {
    let path = std::path::Path::new(&config.metadata.path);

    match config.metadata.backend {
        MetadataBackend::Sqlite => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let db_config = DatabaseConfig {
                max_connections: config.metadata.max_connections,
                ..DatabaseConfig::new(path)
            };
            let pool = create_pool(&db_config).await?;
            run_migrations(&pool).await?;
            Ok(Arc::new(SqliteMetadataStorage::new(pool)))
        }
        MetadataBackend::Sled => {
            let store = SledMetadataStorage::new(&SledStoreConfig {
                db_path: config.metadata.path.clone(),
            })?;
            Ok(Arc::new(store))
        }
    }
}

/// 把缓存事件写入日志
async fn log_events(events: Arc<EventPublisher>, cancel: CancellationToken) {
    let mut rx = events.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(CacheEvent::UsageWarning { message, .. }) => {
                    // 管理器越过阈值时已输出 warn
                    tracing::debug!("Usage warning event: {}", message);
                }
                Ok(CacheEvent::CompressionFailed { key, error }) => {
                    tracing::debug!(key = %key, error = %error, "Compression failure event");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Cache event listener lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// 周期性输出用量统计
async fn log_stats(manager: Arc<CacheManager>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match manager.stats().await {
                Ok(stats) => tracing::info!(
                    entries = stats.total_entries,
                    size_bytes = stats.total_size_bytes,
                    usage_percent = stats.usage_percent,
                    compressed = stats.compressed_entries,
                    pinned = stats.pinned_entries,
                    hits = stats.hits,
                    misses = stats.misses,
                    "Audio cache usage"
                ),
                Err(e) => tracing::warn!(error = %e, "Failed to collect cache stats"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    /// 记录每条日志的级别
    #[derive(Clone, Default)]
    struct Levels(Arc<Mutex<Vec<Level>>>);

    impl<S: Subscriber> Layer<S> for Levels {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if let Ok(mut levels) = self.0.lock() {
                levels.push(*event.metadata().level());
            }
        }
    }

    #[tokio::test]
    async fn test_usage_warning_event_is_not_logged_twice() {
        let levels = Levels::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(levels.clone()));

        let events = EventPublisher::new().arc();
        let cancel = CancellationToken::new();
        let publisher = events.clone();
        let stop = cancel.clone();
        tokio::join!(log_events(events, cancel), async move {
            tokio::task::yield_now().await;
            publisher.publish_usage_warning(95, 100);
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            stop.cancel();
        });

        let levels = levels.0.lock().unwrap();
        assert!(levels.contains(&Level::DEBUG));
        assert!(!levels.contains(&Level::WARN));
    }
}
