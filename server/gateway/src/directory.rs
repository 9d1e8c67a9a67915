use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::PgPool;
use tracing::warn;

use vp_control::{ChannelDescriptor, ChannelId, CoreError, CoreResult};
use vp_core::ChannelDirectory;

/// Resolves channels against the administrative collaborator's own
/// `channels` table (spec §1, §4.5): this crate neither owns nor migrates
/// that schema, it only reads `id, display_name, capacity, created_at` from
/// it. Results are cached read-only and refreshed lazily on a dispatcher
/// miss, matching spec §5's "Channel descriptor cache ... shared read-only".
pub struct PgChannelDirectory {
    pool: PgPool,
    cache: RwLock<HashMap<ChannelId, ChannelDescriptor>>,
}

impl PgChannelDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ChannelDirectory for PgChannelDirectory {
    async fn resolve(&self, channel_id: ChannelId) -> CoreResult<ChannelDescriptor> {
        if let Some(cached) = self.cache.read().get(&channel_id).cloned() {
            return Ok(cached);
        }

        let row = sqlx::query_as::<_, (uuid::Uuid, String, i64, DateTime<Utc>)>(
            "SELECT id, display_name, capacity, created_at FROM channels WHERE id = $1",
        )
        .bind(channel_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| {
            warn!(%channel_id, error = %err, "channel directory lookup failed");
            CoreError::NoSuchChannel
        })?;

        let (id, display_name, capacity, created_at) = row.ok_or(CoreError::NoSuchChannel)?;
        let descriptor = ChannelDescriptor {
            id: ChannelId(id),
            display_name,
            capacity: capacity.max(0) as usize,
            created_at,
        };
        self.cache.write().insert(channel_id, descriptor.clone());
        Ok(descriptor)
    }
}
