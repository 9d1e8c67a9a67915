use vp_control::ChannelId;

/// Metrics hook for the broker, fan-out, chunk buffer, dispatcher and audit
/// sink (spec §9 "the audit sink is an interface, not a concrete database"
/// — the same stance applies to metrics). `server/metrics` implements this
/// against Prometheus; `NoopMetrics` is the zero-cost default, mirroring
/// the teacher's `VoiceMetrics`/`NoopMetrics` split.
pub trait BrokerMetrics: Send + Sync {
    fn record_verb_call(&self, verb: &'static str);
    fn record_verb_rejected(&self, verb: &'static str, kind: &'static str);
    fn set_transmission_active(&self, channel_id: ChannelId, active: bool);
    fn record_chunk_accepted(&self);
    fn record_chunk_duplicate(&self);
    fn record_chunk_rejected(&self, kind: &'static str);
    fn record_fanout(&self, channel_id: ChannelId, subscriber_count: usize);
    fn record_subscriber_drop(&self, is_audio: bool);
    fn set_broker_count(&self, count: usize);
    fn record_dehydration(&self);
    fn set_audit_queue_depth(&self, depth: usize);
    fn record_audit_dropped(&self);
}

#[derive(Default)]
pub struct NoopMetrics;

impl BrokerMetrics for NoopMetrics {
    fn record_verb_call(&self, _verb: &'static str) {}
    fn record_verb_rejected(&self, _verb: &'static str, _kind: &'static str) {}
    fn set_transmission_active(&self, _channel_id: ChannelId, _active: bool) {}
    fn record_chunk_accepted(&self) {}
    fn record_chunk_duplicate(&self) {}
    fn record_chunk_rejected(&self, _kind: &'static str) {}
    fn record_fanout(&self, _channel_id: ChannelId, _subscriber_count: usize) {}
    fn record_subscriber_drop(&self, _is_audio: bool) {}
    fn set_broker_count(&self, _count: usize) {}
    fn record_dehydration(&self) {}
    fn set_audit_queue_depth(&self, _depth: usize) {}
    fn record_audit_dropped(&self) {}
}
