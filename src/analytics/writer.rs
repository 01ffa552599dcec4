//! Asynchronous analytics service
//!
//! Records are enqueued without blocking onto a bounded channel drained by one
//! blocking writer task, which owns the only writing SQLite connection.
//! Retention sweeps are sent through the same channel so every write is
//! serialized through that task. Queries use a second, read-only-by-convention
//! connection on the blocking pool.

use super::query::{BasicStats, EnhancedStats, SearchFilter};
use super::record::AnalyticsRecord;
use super::store::{SqliteStore, cutoff_before};
use crate::config::{AnalyticsBackend, AnalyticsConfig};
use crate::error::{AppError, AppResult};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Result of [`Analytics::record`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// Queue full or store closed; the record is gone
    Dropped,
    /// Analytics is disabled; nothing was attempted
    Disabled,
}

enum StoreCommand {
    Insert(Box<AnalyticsRecord>),
    Sweep {
        cutoff: chrono::DateTime<Utc>,
        reply: Option<oneshot::Sender<AppResult<usize>>>,
    },
}

struct Enabled {
    sender: Mutex<Option<mpsc::Sender<StoreCommand>>>,
    reader: Arc<SqliteStore>,
    writer: Mutex<Option<JoinHandle<()>>>,
    retention_cancel: CancellationToken,
    retention: Mutex<Option<JoinHandle<()>>>,
}

/// Analytics store handle shared by the pipeline and the analytics API
pub struct Analytics {
    config: AnalyticsConfig,
    enabled: Option<Enabled>,
    dropped: AtomicU64,
}

impl Analytics {
    /// Open the configured store and start the writer and retention tasks
    ///
    /// Never fails: if the store cannot be opened the service comes up
    /// disabled and the analytics API answers 503, while proxying continues.
    /// Must be called inside a Tokio runtime.
    pub fn open(config: &AnalyticsConfig) -> Arc<Self> {
        if config.backend == AnalyticsBackend::None {
            tracing::info!("Analytics disabled by configuration");
            return Arc::new(Self::disabled(config));
        }

        match Self::start(config) {
            Ok(enabled) => {
                tracing::info!(
                    path = %config.database_path().display(),
                    retention_days = config.retention_days,
                    queue_capacity = config.queue_capacity,
                    "Analytics store opened"
                );
                Arc::new(Self {
                    config: config.clone(),
                    enabled: Some(enabled),
                    dropped: AtomicU64::new(0),
                })
            }
            Err(e) => {
                tracing::error!(
                    path = %config.database_path().display(),
                    error = %e,
                    "Failed to open analytics store, analytics disabled"
                );
                Arc::new(Self::disabled(config))
            }
        }
    }

    /// A service that accepts nothing and answers every query with 503
    pub fn disabled(config: &AnalyticsConfig) -> Self {
        Self {
            config: config.clone(),
            enabled: None,
            dropped: AtomicU64::new(0),
        }
    }

    fn start(config: &AnalyticsConfig) -> AppResult<Enabled> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            AppError::Storage(format!(
                "cannot create analytics directory {}: {}",
                config.data_dir.display(),
                e
            ))
        })?;

        let path = config.database_path();
        let writer_store = SqliteStore::open(&path, config.busy_timeout())?;
        let reader = Arc::new(SqliteStore::open(&path, config.busy_timeout())?);

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let writer = tokio::task::spawn_blocking(move || writer_loop(writer_store, receiver));

        let retention_cancel = CancellationToken::new();
        let retention = tokio::spawn(retention_loop(
            sender.clone(),
            retention_cancel.clone(),
            config.cleanup_interval(),
            config.retention(),
        ));

        Ok(Enabled {
            sender: Mutex::new(Some(sender)),
            reader,
            writer: Mutex::new(Some(writer)),
            retention_cancel,
            retention: Mutex::new(Some(retention)),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.is_some()
    }

    /// Enqueue a record without waiting
    ///
    /// A full queue drops the record, counts it and logs a warning.
    pub fn record(&self, record: AnalyticsRecord) -> Enqueue {
        let Some(enabled) = &self.enabled else {
            return Enqueue::Disabled;
        };

        let sender = enabled.sender.lock();
        let Some(sender) = sender.as_ref() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Analytics store closed, dropping record");
            return Enqueue::Dropped;
        };

        match sender.try_send(StoreCommand::Insert(Box::new(record.truncated()))) {
            Ok(()) => Enqueue::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    dropped_total = total,
                    capacity = self.config.queue_capacity,
                    "Analytics queue full, dropping record"
                );
                Enqueue::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Analytics writer stopped, dropping record");
                Enqueue::Dropped
            }
        }
    }

    /// Records waiting for the writer
    pub fn queue_size(&self) -> usize {
        self.enabled
            .as_ref()
            .and_then(|e| {
                e.sender
                    .lock()
                    .as_ref()
                    .map(|s| s.max_capacity() - s.capacity())
            })
            .unwrap_or(0)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn reader(&self) -> AppResult<Arc<SqliteStore>> {
        self.enabled
            .as_ref()
            .map(|e| e.reader.clone())
            .ok_or_else(|| AppError::AnalyticsUnavailable("analytics is disabled".to_string()))
    }

    async fn read<T, F>(&self, query: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> rusqlite::Result<T> + Send + 'static,
    {
        let store = self.reader()?;
        tokio::task::spawn_blocking(move || query(&store))
            .await
            .map_err(|e| AppError::Internal(format!("analytics query task failed: {}", e)))?
            .map_err(AppError::from)
    }

    pub async fn search(&self, filter: SearchFilter) -> AppResult<Vec<AnalyticsRecord>> {
        self.read(move |store| store.search(&filter)).await
    }

    /// Single record by id; `NotFound` if absent
    pub async fn get(&self, id: i64) -> AppResult<AnalyticsRecord> {
        self.read(move |store| store.get(id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Message {}", id)))
    }

    pub async fn models(&self) -> AppResult<Vec<String>> {
        self.read(|store| store.models()).await
    }

    pub async fn aggregate(&self, hours: u32) -> AppResult<EnhancedStats> {
        self.read(move |store| store.aggregate(hours, Utc::now()))
            .await
    }

    /// Basic counters; available even when analytics is disabled
    pub async fn stats(&self) -> BasicStats {
        let total_records = if self.is_enabled() {
            match self.read(|store| store.count()).await {
                Ok(count) => Some(count),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to count analytics records");
                    None
                }
            }
        } else {
            None
        };

        BasicStats {
            backend: if self.is_enabled() {
                self.config.backend.as_str().to_string()
            } else {
                AnalyticsBackend::None.as_str().to_string()
            },
            data_dir: self.config.data_dir.display().to_string(),
            enabled: self.is_enabled(),
            queue_size: self.queue_size(),
            dropped_records: self.dropped_count(),
            total_records,
        }
    }

    /// Run a retention sweep now, through the writer, and wait for it
    ///
    /// Returns the number of records deleted.
    pub async fn sweep_now(&self) -> AppResult<usize> {
        let sender = self
            .enabled
            .as_ref()
            .and_then(|e| e.sender.lock().clone())
            .ok_or_else(|| AppError::AnalyticsUnavailable("analytics is disabled".to_string()))?;

        let (reply, response) = oneshot::channel();
        let cutoff = cutoff_before(Utc::now(), self.config.retention());
        sender
            .send(StoreCommand::Sweep {
                cutoff,
                reply: Some(reply),
            })
            .await
            .map_err(|_| AppError::Storage("analytics writer stopped".to_string()))?;

        response
            .await
            .map_err(|_| AppError::Storage("analytics writer stopped".to_string()))?
    }

    /// Flush and close
    ///
    /// Stops the retention task, closes the queue, waits for the writer to
    /// drain every queued record, then releases the store. Idempotent.
    pub async fn close(&self) {
        let Some(enabled) = &self.enabled else {
            return;
        };

        enabled.retention_cancel.cancel();
        let retention = enabled.retention.lock().take();
        if let Some(handle) = retention {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Analytics retention task ended abnormally");
            }
        }

        let pending = self.queue_size();
        // dropping the last sender lets the writer drain and exit
        drop(enabled.sender.lock().take());

        let writer = enabled.writer.lock().take();
        if let Some(handle) = writer {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Analytics writer ended abnormally");
            }
            tracing::info!(flushed = pending, "Analytics store closed");
        }
    }
}

fn writer_loop(store: SqliteStore, mut receiver: mpsc::Receiver<StoreCommand>) {
    while let Some(command) = receiver.blocking_recv() {
        match command {
            StoreCommand::Insert(record) => {
                if let Err(e) = store.insert(&record) {
                    tracing::error!(
                        model = %record.model,
                        error = %e,
                        "Failed to write analytics record"
                    );
                }
            }
            StoreCommand::Sweep { cutoff, reply } => {
                let result = store.delete_older_than(cutoff).map_err(AppError::from);
                match &result {
                    Ok(0) => tracing::debug!("Retention sweep found nothing to delete"),
                    Ok(deleted) => {
                        tracing::info!(deleted = deleted, cutoff = %cutoff, "Retention sweep removed old records")
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Retention sweep failed, retrying next tick")
                    }
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }
    tracing::debug!("Analytics writer drained");
}

async fn retention_loop(
    sender: mpsc::Sender<StoreCommand>,
    cancel: CancellationToken,
    interval: std::time::Duration,
    retention: chrono::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let cutoff = cutoff_before(Utc::now(), retention);
                let command = StoreCommand::Sweep { cutoff, reply: None };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = sender.send(command) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    tracing::debug!("Analytics retention task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::record::sample_record;
    use std::time::Duration;

    fn config_in(dir: &tempfile::TempDir) -> AnalyticsConfig {
        AnalyticsConfig {
            data_dir: dir.path().join("analytics"),
            ..AnalyticsConfig::default()
        }
    }

    async fn wait_for_count(analytics: &Analytics, expected: usize) -> Vec<AnalyticsRecord> {
        for _ in 0..100 {
            let records = analytics.search(SearchFilter::default()).await.unwrap();
            if records.len() >= expected {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {} records", expected);
    }

    #[tokio::test]
    async fn test_record_is_persisted_asynchronously() {
        let dir = tempfile::tempdir().unwrap();
        let analytics = Analytics::open(&config_in(&dir));
        assert!(analytics.is_enabled());

        assert_eq!(analytics.record(sample_record()), Enqueue::Queued);
        let records = wait_for_count(&analytics, 1).await;
        assert_eq!(records[0].model, "phi4");

        let loaded = analytics.get(records[0].id).await.unwrap();
        assert_eq!(loaded.category, "summarize");
        analytics.close().await;
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let analytics = Analytics::open(&config_in(&dir));
        let err = analytics.get(999).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        analytics.close().await;
    }

    #[tokio::test]
    async fn test_close_flushes_queue() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let analytics = Analytics::open(&config);
        for _ in 0..25 {
            assert_eq!(analytics.record(sample_record()), Enqueue::Queued);
        }
        analytics.close().await;

        let store = SqliteStore::open(&config.database_path(), Duration::from_secs(5)).unwrap();
        assert_eq!(store.count().unwrap(), 25);

        // closed: further records are dropped and counted
        assert_eq!(analytics.record(sample_record()), Enqueue::Dropped);
        assert_eq!(analytics.dropped_count(), 1);
        // idempotent
        analytics.close().await;
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let analytics = Analytics::open(&config_in(&dir));

        let mut old = sample_record();
        old.model = "expired".to_string();
        old.timestamp = Utc::now() - chrono::Duration::days(8);
        let mut fresh = sample_record();
        fresh.model = "fresh".to_string();
        fresh.timestamp = Utc::now() - chrono::Duration::days(6);

        analytics.record(old);
        analytics.record(fresh);
        wait_for_count(&analytics, 2).await;

        let deleted = analytics.sweep_now().await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = analytics.search(SearchFilter::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].model, "fresh");
        analytics.close().await;
    }

    #[tokio::test]
    async fn test_disabled_store_answers_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config = AnalyticsConfig {
            backend: AnalyticsBackend::None,
            ..config_in(&dir)
        };
        let analytics = Analytics::open(&config);

        assert!(!analytics.is_enabled());
        assert_eq!(analytics.record(sample_record()), Enqueue::Disabled);
        assert!(matches!(
            analytics.search(SearchFilter::default()).await,
            Err(AppError::AnalyticsUnavailable(_))
        ));
        assert!(matches!(
            analytics.aggregate(1).await,
            Err(AppError::AnalyticsUnavailable(_))
        ));
        let stats = analytics.stats().await;
        assert!(!stats.enabled);
        assert_eq!(stats.backend, "none");
        assert!(stats.total_records.is_none());
        analytics.close().await;
    }

    #[tokio::test]
    async fn test_open_failure_degrades_to_disabled() {
        let dir = tempfile::tempdir().unwrap();
        // a regular file where the data directory should be
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let config = AnalyticsConfig {
            data_dir: blocker,
            ..AnalyticsConfig::default()
        };

        let analytics = Analytics::open(&config);
        assert!(!analytics.is_enabled());
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let config = AnalyticsConfig {
            queue_capacity: 1,
            ..config_in(&dir)
        };
        let analytics = Analytics::open(&config);

        let outcomes: Vec<Enqueue> = (0..500).map(|_| analytics.record(sample_record())).collect();
        let dropped = outcomes.iter().filter(|o| **o == Enqueue::Dropped).count() as u64;
        assert!(dropped > 0, "a capacity-1 queue should overflow");
        assert_eq!(analytics.dropped_count(), dropped);
        analytics.close().await;
    }

    #[tokio::test]
    async fn test_stats_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let analytics = Analytics::open(&config_in(&dir));
        analytics.record(sample_record());
        wait_for_count(&analytics, 1).await;

        let stats = analytics.stats().await;
        assert!(stats.enabled);
        assert_eq!(stats.backend, "sqlite");
        assert_eq!(stats.total_records, Some(1));
        assert_eq!(stats.dropped_records, 0);
        analytics.close().await;
    }
}
