//! The address → Broker router (spec §4.5). Owns broker lifecycle: lazy
//! construction on first reference, idle dehydration, and (via
//! `ChannelBroker::spawn`'s own supervisor) restart-on-panic.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use vp_control::{ChannelDescriptor, ChannelId, CoreError, CoreResult};

use crate::audit::AuditSink;
use crate::channel::{ChannelBroker, ChannelHandle};
use crate::clock::Clock;
use crate::constants::BrokerConfig;
use crate::metrics::BrokerMetrics;

/// Resolves a channel id to its descriptor. Backed in production by the
/// administrative collaborator's store; out of scope for this crate
/// (spec §1). `server/gateway` wires the real implementation.
#[async_trait::async_trait]
pub trait ChannelDirectory: Send + Sync {
    async fn resolve(&self, channel_id: ChannelId) -> CoreResult<ChannelDescriptor>;
}

/// Fixed, in-memory directory for tests and dev-mode seeding.
#[derive(Default)]
pub struct StaticChannelDirectory {
    channels: RwLock<HashMap<ChannelId, ChannelDescriptor>>,
}

impl StaticChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, descriptor: ChannelDescriptor) {
        self.channels.write().insert(descriptor.id, descriptor);
    }
}

#[async_trait::async_trait]
impl ChannelDirectory for StaticChannelDirectory {
    async fn resolve(&self, channel_id: ChannelId) -> CoreResult<ChannelDescriptor> {
        self.channels
            .read()
            .get(&channel_id)
            .cloned()
            .ok_or(CoreError::NoSuchChannel)
    }
}

pub struct Dispatcher {
    registry: Arc<DashMap<ChannelId, ChannelHandle>>,
    directory: Arc<dyn ChannelDirectory>,
    config: BrokerConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<dyn BrokerMetrics>,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<dyn ChannelDirectory>,
        config: BrokerConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<dyn BrokerMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(DashMap::new()),
            directory,
            config,
            clock,
            audit,
            metrics,
        })
    }

    /// Return the broker for `channel_id`, constructing it lazily (loading
    /// the descriptor from `ChannelDirectory`) if this is the first
    /// reference. `NoSuchChannel` if the directory doesn't know it.
    pub async fn handle(&self, channel_id: ChannelId) -> CoreResult<ChannelHandle> {
        if let Some(existing) = self.registry.get(&channel_id) {
            return Ok(existing.clone());
        }

        let descriptor = self.directory.resolve(channel_id).await?;

        let registry = self.registry.clone();
        let config = self.config.clone();
        let clock = self.clock.clone();
        let audit = self.audit.clone();
        let metrics = self.metrics.clone();

        let handle = self
            .registry
            .entry(channel_id)
            .or_insert_with(move || ChannelBroker::spawn(descriptor, config, clock, audit, metrics, registry))
            .clone();
        self.metrics.set_broker_count(self.registry.len());
        Ok(handle)
    }

    pub fn broker_count(&self) -> usize {
        self.registry.len()
    }

    /// Periodic dehydration sweep (spec §4.5, default DEHYDRATE_IDLE = 10
    /// min): tear down brokers with no participants and no active
    /// transmission for long enough. Run this as a detached background
    /// task from the binary's `main`.
    pub async fn run_dehydration_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        loop {
            ticker.tick().await;
            let channel_ids: Vec<ChannelId> = self.registry.iter().map(|entry| *entry.key()).collect();
            for channel_id in channel_ids {
                let handle = match self.registry.get(&channel_id) {
                    Some(h) => h.clone(),
                    None => continue,
                };
                if let Ok(snapshot) = handle.probe().await {
                    if !snapshot.has_transmission
                        && snapshot.participant_count == 0
                        && snapshot.idle_for >= self.config.dehydrate_idle
                    {
                        tracing::debug!(%channel_id, "dehydrating idle channel broker");
                        handle.shutdown();
                        self.metrics.record_dehydration();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NullAuditSink;
    use crate::clock::SystemClock;
    use crate::metrics::NoopMetrics;
    use chrono::Utc;

    fn dispatcher() -> (Arc<Dispatcher>, Arc<StaticChannelDirectory>) {
        let directory = Arc::new(StaticChannelDirectory::new());
        let dispatcher = Dispatcher::new(
            directory.clone(),
            BrokerConfig::default(),
            Arc::new(SystemClock),
            Arc::new(NullAuditSink),
            Arc::new(NoopMetrics),
        );
        (dispatcher, directory)
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected() {
        let (dispatcher, _directory) = dispatcher();
        let err = dispatcher.handle(ChannelId::new()).await.unwrap_err();
        assert_eq!(err, CoreError::NoSuchChannel);
    }

    #[tokio::test]
    async fn known_channel_constructs_once_and_is_reused() {
        let (dispatcher, directory) = dispatcher();
        let channel_id = ChannelId::new();
        directory.seed(ChannelDescriptor {
            id: channel_id,
            display_name: "Ridge Launch".into(),
            capacity: 10,
            created_at: Utc::now(),
        });
        let a = dispatcher.handle(channel_id).await.unwrap();
        let b = dispatcher.handle(channel_id).await.unwrap();
        assert_eq!(dispatcher.broker_count(), 1);
        assert!(a.probe().await.is_ok());
        assert!(b.probe().await.is_ok());
    }
}
