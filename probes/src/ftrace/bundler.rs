//! Bundle assembly for one (session, cpu, read pass)
//!
//! The bundler lazily opens an output bundle on the first interesting event,
//! batches compact scheduling rows, and on finalize attaches pending generic
//! event schemas and the interned kernel-symbol side table before handing
//! the bundle to the session's sink.

use std::collections::BTreeSet;

use probes_common::{
    BundleError, ClockSnapshot, DecodedEvent, EventBundle, InternedSymbol, ParseStatus,
    TraceClock,
};

use super::compact_sched::CompactSchedBuffer;
use super::metadata::SessionMetadata;
use super::symbolizer::SymbolResolver;
use super::translation::TranslationTable;
use crate::output::RecordSink;

pub struct Bundler<'a> {
    sink: &'a mut dyn RecordSink,
    compact_sched_buf: &'a mut CompactSchedBuffer,
    compact_sched_enabled: bool,
    symbolize_ksyms: bool,
    cpu: u32,
    clock: TraceClock,
    clock_snapshot: Option<ClockSnapshot>,
    /// Timestamp of the last event written into the previous bundle for this
    /// (session, cpu); referenced by every new bundle for downstream
    /// continuity checks.
    previous_bundle_end_timestamp: u64,
    bundle: Option<EventBundle>,
    /// Lost-events flag for the next opened bundle.
    next_lost_events: bool,
    pending_descriptors: BTreeSet<u32>,
}

impl<'a> Bundler<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sink: &'a mut dyn RecordSink,
        compact_sched_buf: &'a mut CompactSchedBuffer,
        compact_sched_enabled: bool,
        symbolize_ksyms: bool,
        cpu: u32,
        clock: TraceClock,
        clock_snapshot: Option<ClockSnapshot>,
        previous_bundle_end_timestamp: u64,
    ) -> Bundler<'a> {
        Bundler {
            sink,
            compact_sched_buf,
            compact_sched_enabled,
            symbolize_ksyms,
            cpu,
            clock,
            clock_snapshot,
            previous_bundle_end_timestamp,
            bundle: None,
            next_lost_events: false,
            pending_descriptors: BTreeSet::new(),
        }
    }

    pub fn bundle(&mut self) -> &mut EventBundle {
        let lost_events = self.next_lost_events;
        let cpu = self.cpu;
        // Zero is valid and expected for the first bundle per cpu: it means
        // all data since the session started is present.
        let previous_bundle_end_timestamp = self.previous_bundle_end_timestamp;
        let clock = self.clock;
        let clock_snapshot = self.clock_snapshot;
        self.bundle.get_or_insert_with(|| EventBundle {
            cpu,
            lost_events,
            previous_bundle_end_timestamp,
            clock,
            clock_snapshot,
            ..EventBundle::default()
        })
    }

    pub fn push_event(&mut self, event: DecodedEvent) {
        self.bundle().events.push(event);
    }

    pub fn write_error(&mut self, timestamp: u64, status: ParseStatus) {
        log::debug!("error parsing ftrace page: {status:?}");
        self.bundle().errors.push(BundleError { timestamp, status });
    }

    pub fn attach_broken_page(&mut self, page: &[u8]) {
        self.bundle().broken_page = Some(page.to_vec());
    }

    /// Remember that this bundle's dynamic events need their schema emitted.
    pub fn note_generic_descriptor(&mut self, output_id: u32) {
        self.pending_descriptors.insert(output_id);
    }

    pub fn compact_sched_buf(&mut self) -> &mut CompactSchedBuffer {
        self.compact_sched_buf
    }

    /// Close the current bundle (if any) and start the next one with the
    /// given loss flag. Called on lost-events pages and on interner
    /// overflow, so that the single per-bundle `lost_events` flag maps to
    /// one boundary.
    pub fn start_new_bundle(
        &mut self,
        lost_events: bool,
        table: &TranslationTable,
        metadata: &mut SessionMetadata,
        symbolizer: &mut dyn SymbolResolver,
    ) {
        self.finalize(table, metadata, symbolizer);
        self.next_lost_events = lost_events;
        // Eagerly open, so a loss signal with no decodable events still
        // reaches the sink.
        self.bundle();
    }

    /// Flush compact columns, pending schemas and new symbol interning
    /// entries, then emit the bundle.
    pub fn finalize(
        &mut self,
        table: &TranslationTable,
        metadata: &mut SessionMetadata,
        symbolizer: &mut dyn SymbolResolver,
    ) {
        let Some(mut bundle) = self.bundle.take() else {
            self.next_lost_events = false;
            return;
        };
        self.next_lost_events = false;

        if self.compact_sched_enabled {
            bundle.compact_sched = self.compact_sched_buf.write_and_reset();
        }

        for output_id in std::mem::take(&mut self.pending_descriptors) {
            if let Some(descriptor) = table.generic_descriptor(output_id) {
                bundle.descriptors.push(descriptor.clone());
            }
        }

        if self.symbolize_ksyms {
            // Only indices above the session's written watermark are new.
            // If every lookup fails, the watermark must not advance: the
            // next bundle still has to emit the incremental-state-cleared
            // marker.
            let watermark_at_start = metadata.last_symbol_index_written;
            let symbols: Vec<InternedSymbol> = metadata
                .unwritten_symbol_addrs()
                .filter_map(|(index, addr)| {
                    symbolizer.lookup(addr).map(|name| InternedSymbol { index, name })
                })
                .collect();
            if !symbols.is_empty() {
                if watermark_at_start == 0 {
                    bundle.incremental_state_cleared = true;
                }
                bundle.symbols = symbols;
                metadata.last_symbol_index_written = metadata.symbol_count();
            }
        }

        // The next bundle references the last event of this one.
        self.sink.bundle(bundle);
    }

    /// Update the carried end-of-bundle timestamp after a parsed page.
    pub fn set_previous_bundle_end_timestamp(&mut self, timestamp: u64) {
        self.previous_bundle_end_timestamp = timestamp;
    }

    #[must_use]
    pub fn previous_bundle_end_timestamp(&self) -> u64 {
        self.previous_bundle_end_timestamp
    }
}
