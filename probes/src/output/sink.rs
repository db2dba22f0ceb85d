//! Sinks consuming decoded output records

use log::warn;
use probes_common::{EventBundle, StatsRecord};
use serde::Serialize;
use std::io::Write;

/// Append-only stream of typed records produced by the readers. One sink per
/// session; bundles arrive already finalized and are never mutated after
/// emission.
pub trait RecordSink {
    fn bundle(&mut self, bundle: EventBundle);
    fn stats(&mut self, stats: StatsRecord);
    /// Push buffered data towards the consumer; called at flush points.
    fn flush(&mut self) {}
}

/// Collects records in memory. Used by tests and by embedders that drain
/// programmatically.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub bundles: Vec<EventBundle>,
    pub stats: Vec<StatsRecord>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordSink for MemorySink {
    fn bundle(&mut self, bundle: EventBundle) {
        self.bundles.push(bundle);
    }

    fn stats(&mut self, stats: StatsRecord) {
        self.stats.push(stats);
    }
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum Record<'a> {
    Bundle(&'a EventBundle),
    Stats(&'a StatsRecord),
}

/// Writes each record as one JSON line. The daemon's default output format.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesSink { writer }
    }

    fn write_record(&mut self, record: &Record) {
        match serde_json::to_string(record) {
            Ok(mut line) => {
                // One write per record, so concurrent sessions sharing the
                // output interleave at line granularity only.
                line.push('\n');
                if let Err(e) = self.writer.write_all(line.as_bytes()) {
                    warn!("failed to write record: {e}");
                }
            }
            Err(e) => warn!("failed to serialize record: {e}"),
        }
    }
}

impl<W: Write> RecordSink for JsonLinesSink<W> {
    fn bundle(&mut self, bundle: EventBundle) {
        self.write_record(&Record::Bundle(&bundle));
    }

    fn stats(&mut self, stats: StatsRecord) {
        self.write_record(&Record::Stats(&stats));
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("failed to flush record sink: {e}");
        }
    }
}
