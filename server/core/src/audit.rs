use vp_control::AuditRecord;

/// Durable sink for `TransmissionAuditRecord`s (spec §4.6, §9). A single,
/// non-blocking `write`: the sink owns its own queue and worker, and the
/// broker never awaits it. `server/audit` provides the Postgres-backed
/// implementation; `NullAuditSink`/`RecordingAuditSink` below are test
/// doubles used by this crate's own tests.
pub trait AuditSink: Send + Sync {
    fn write(&self, record: AuditRecord);
}

/// Discards every record. Useful where audit durability is out of scope
/// for the test in question.
#[derive(Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn write(&self, _record: AuditRecord) {}
}

/// Collects records in memory for assertions.
#[derive(Default)]
pub struct RecordingAuditSink {
    records: parking_lot::Mutex<Vec<AuditRecord>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn write(&self, record: AuditRecord) {
        self.records.lock().push(record);
    }
}
