//! Durable half of the Transmission audit trail (spec §4.6, §9). The core
//! depends only on `vp_core::AuditSink::write`, a synchronous, non-blocking
//! call; this crate supplies the Postgres-backed implementation with its own
//! bounded queue and background worker, so a slow or down database never
//! stalls a channel broker.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use vp_control::AuditRecord;
use vp_core::AuditSink;

/// Queue-depth/drop-count hook, mirroring `vp_core::BrokerMetrics`'s stance
/// that metrics are an interface, not a concrete exporter. `server/gateway`
/// wires this to the real `vp-metrics` Prometheus gauges.
pub trait AuditMetrics: Send + Sync {
    fn set_queue_depth(&self, depth: usize);
    fn record_dropped(&self);
}

#[derive(Default)]
pub struct NoopAuditMetrics;

impl AuditMetrics for NoopAuditMetrics {
    fn set_queue_depth(&self, _depth: usize) {}
    fn record_dropped(&self) {}
}

struct Shared {
    queue: Mutex<VecDeque<AuditRecord>>,
    notify: Notify,
    capacity: usize,
    metrics: Arc<dyn AuditMetrics>,
}

/// Postgres-backed `AuditSink`. `write` only ever touches an in-process
/// queue; a single background task owns the database connection pool and
/// drains the queue at its own pace. On overflow the oldest queued record is
/// dropped (§4.6) rather than applying backpressure to the broker.
pub struct PgAuditSink {
    shared: Arc<Shared>,
}

impl PgAuditSink {
    /// Spawns the background drain task on the current Tokio runtime.
    pub fn new(pool: PgPool, capacity: usize, metrics: Arc<dyn AuditMetrics>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            notify: Notify::new(),
            capacity,
            metrics,
        });
        tokio::spawn(drain_loop(pool, shared.clone()));
        Self { shared }
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(pool).await
    }

    #[cfg(test)]
    fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl AuditSink for PgAuditSink {
    fn write(&self, record: AuditRecord) {
        let mut q = self.shared.queue.lock();
        if q.len() >= self.shared.capacity {
            q.pop_front();
            self.shared.metrics.record_dropped();
            warn!("audit queue full, dropped oldest record");
        }
        q.push_back(record);
        let depth = q.len();
        drop(q);
        self.shared.metrics.set_queue_depth(depth);
        self.shared.notify.notify_one();
    }
}

async fn drain_loop(pool: PgPool, shared: Arc<Shared>) {
    loop {
        let record = {
            let mut q = shared.queue.lock();
            q.pop_front()
        };
        let Some(record) = record else {
            shared.notify.notified().await;
            continue;
        };
        shared.metrics.set_queue_depth(shared.queue.lock().len());
        if let Err(err) = insert(&pool, &record).await {
            error!(session_id = %record.session_id, error = %err, "audit write failed, record dropped");
        } else {
            debug!(session_id = %record.session_id, "audit record written");
        }
    }
}

async fn insert(pool: &PgPool, record: &AuditRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (
            session_id, channel_id, user_id, username, start_time, end_time,
            duration_seconds, audio_format, chunks_count, total_bytes,
            participant_count, is_emergency, network_quality,
            location_lat, location_lon, missing_chunks, packet_loss_rate
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        ON CONFLICT (session_id) DO NOTHING
        "#,
    )
    .bind(record.session_id.0.clone())
    .bind(record.channel_id.to_string())
    .bind(record.user_id.to_string())
    .bind(&record.username)
    .bind(record.start_time)
    .bind(record.end_time)
    .bind(record.duration_seconds)
    .bind(&record.audio_format)
    .bind(record.chunks_count)
    .bind(record.total_bytes)
    .bind(record.participant_count)
    .bind(record.is_emergency)
    .bind(&record.network_quality)
    .bind(record.location_lat)
    .bind(record.location_lon)
    .bind(record.missing_chunks)
    .bind(record.packet_loss_rate)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vp_control::{ChannelId, SessionId, UserId};

    fn sample(id: &str) -> AuditRecord {
        AuditRecord {
            session_id: SessionId(id.to_string()),
            channel_id: ChannelId::new(),
            user_id: UserId::new(),
            username: "pilot".into(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration_seconds: 5,
            audio_format: "opus".into(),
            chunks_count: 10,
            total_bytes: 1000,
            participant_count: 2,
            is_emergency: false,
            network_quality: "good".into(),
            location_lat: None,
            location_lon: None,
            missing_chunks: 0,
            packet_loss_rate: 0.0,
        }
    }

    struct CountingMetrics {
        dropped: std::sync::atomic::AtomicU64,
    }

    impl AuditMetrics for CountingMetrics {
        fn set_queue_depth(&self, _depth: usize) {}
        fn record_dropped(&self) {
            self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    #[test]
    fn overflow_drops_oldest_and_counts_it() {
        let metrics = Arc::new(CountingMetrics {
            dropped: std::sync::atomic::AtomicU64::new(0),
        });
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: 2,
            metrics: metrics.clone(),
        });
        let sink = PgAuditSink { shared };
        sink.write(sample("a"));
        sink.write(sample("b"));
        sink.write(sample("c"));
        assert_eq!(sink.queue_len(), 2);
        assert_eq!(metrics.dropped.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
