use metrics::{counter, gauge, histogram};

use vp_control::ChannelId;
use vp_core::BrokerMetrics;

use crate::labels::LabelPolicy;

/// Prometheus-backed implementation of `vp_core::BrokerMetrics`. Channel ids
/// are bucketed through `LabelPolicy` before they ever become a label value,
/// so the `/metrics` endpoint can't be used to enumerate or exfiltrate real
/// channel ids, nor blow up series cardinality.
pub struct BrokerMetricsImpl {
    ns: &'static str,
    policy: LabelPolicy,
}

impl BrokerMetricsImpl {
    pub fn new(namespace: &'static str, policy: LabelPolicy) -> Self {
        Self { ns: namespace, policy }
    }

    fn channel_label(&self, channel_id: ChannelId) -> String {
        self.policy
            .channel_bucket(channel_route_hash(&channel_id))
            .as_str()
            .to_string()
    }
}

impl BrokerMetrics for BrokerMetricsImpl {
    fn record_verb_call(&self, verb: &'static str) {
        counter!(format!("{}_broker_verb_calls_total", self.ns), "verb" => verb).increment(1);
    }

    fn record_verb_rejected(&self, verb: &'static str, kind: &'static str) {
        counter!(
            format!("{}_broker_verb_rejected_total", self.ns),
            "verb" => verb,
            "kind" => kind
        )
        .increment(1);
    }

    fn set_transmission_active(&self, channel_id: ChannelId, active: bool) {
        gauge!(
            format!("{}_broker_transmission_active", self.ns),
            "channel" => self.channel_label(channel_id)
        )
        .set(if active { 1.0 } else { 0.0 });
    }

    fn record_chunk_accepted(&self) {
        counter!(format!("{}_chunk_accepted_total", self.ns)).increment(1);
    }

    fn record_chunk_duplicate(&self) {
        counter!(format!("{}_chunk_duplicate_total", self.ns)).increment(1);
    }

    fn record_chunk_rejected(&self, kind: &'static str) {
        counter!(format!("{}_chunk_rejected_total", self.ns), "kind" => kind).increment(1);
    }

    fn record_fanout(&self, channel_id: ChannelId, subscriber_count: usize) {
        histogram!(
            format!("{}_broker_fanout_size", self.ns),
            "channel" => self.channel_label(channel_id)
        )
        .record(subscriber_count as f64);
    }

    fn record_subscriber_drop(&self, is_audio: bool) {
        let kind = if is_audio { "audio" } else { "control" };
        counter!(format!("{}_subscriber_dropped_frames_total", self.ns), "kind" => kind).increment(1);
    }

    fn set_broker_count(&self, count: usize) {
        gauge!(format!("{}_dispatcher_broker_count", self.ns)).set(count as f64);
    }

    fn record_dehydration(&self) {
        counter!(format!("{}_dispatcher_dehydrations_total", self.ns)).increment(1);
    }

    fn set_audit_queue_depth(&self, depth: usize) {
        gauge!(format!("{}_audit_queue_depth", self.ns)).set(depth as f64);
    }

    fn record_audit_dropped(&self) {
        counter!(format!("{}_audit_dropped_total", self.ns)).increment(1);
    }
}

/// FNV-1a 32-bit over the channel id's string form; only used to place a
/// channel into one of `LabelPolicy`'s bounded buckets, never to recover it.
fn channel_route_hash(channel_id: &ChannelId) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let s = channel_id.to_string();
    let mut h = OFFSET;
    for b in s.as_bytes() {
        h ^= *b as u32;
        h = h.wrapping_mul(PRIME);
    }
    h
}
