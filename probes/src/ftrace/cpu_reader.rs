//! Per-CPU ring buffer reader and record decoder
//!
//! Each reader owns one nonblocking `trace_pipe_raw` fd and drains it in
//! page-sized reads. Pages are decoded once per subscribing session using
//! the instance's translation table, with special-cased handling for the
//! compact scheduling encoding, print filtering, raw syscalls and kprobes.
//!
//! Error handling: decoding disagreements with the kernel's binary layout
//! abort the current page only; the error is recorded inline in the output
//! bundle with a timestamp and parsing resumes on the next page.

use log::debug;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};

use probes_common::{
    ClockSnapshot, DecodedEvent, EventPayload, FieldVal, FieldValue, KprobeType, ParseStatus,
    TraceClock,
};

use super::bundler::Bundler;
use super::compact_sched::{
    CompactSchedBuffer, CompactSchedSwitchFormat, CompactSchedWakingFormat,
    COMPACT_SCHED_INTERNER_THRESHOLD,
};
use super::event_info::{
    GENERIC_EVENT_LEGACY_ID, KPROBE_EVENT_FIELD_ID, SYS_ENTER_FIELD_ID, SYS_EXIT_FIELD_ID,
    TASK_RENAME_FIELD_ID,
};
use super::format::PageHeaderSpec;
use super::metadata::SessionMetadata;
use super::muxer::DataSourceConfig;
use super::symbolizer::SymbolResolver;
use super::tracefs::sys_page_size;
use super::translation::{Event, Field, TranslationStrategy, TranslationTable};
use crate::output::RecordSink;

// Event header type_or_length values with special meaning. See the kernel's
// include/linux/ring_buffer.h, also exported at runtime via
// events/header_event.
const TYPE_PADDING: u32 = 29;
const TYPE_TIME_EXTEND: u32 = 30;
const TYPE_TIME_STAMP: u32 = 31;

/// Mask for the data length portion of the page header's `commit` field. The
/// kernel never names this boundary explicitly, but 27 bits is the constant
/// used by the reference readers.
const PAGE_DATA_SIZE_MASK: u32 = (1 << 27) - 1;
/// Set when the cpu lost events since the last read (reading clears it).
const PAGE_MISSED_EVENTS_FLAG: u32 = 1 << 31;

/// A read that returns less than this threshold means we caught up with the
/// kernel's write pointer: the page was terminated prematurely rather than
/// filled. Needs to account for fragmentation, so half a page rather than a
/// full one; long print events can still produce false positives, which only
/// cost an early end of batch.
fn page_fill_threshold() -> u32 {
    (sys_page_size() / 2) as u32
}

/// Scratch memory reused across read batches: page-sized read buffers plus
/// the compact scheduling accumulator.
pub struct ParsingBuffers {
    data: Vec<u8>,
    compact_sched: CompactSchedBuffer,
    buf_pages: usize,
}

/// Work in batches of this many pages for cache locality and bounded memory.
pub const PARSING_BUF_SIZE_PAGES: usize = 32;

impl ParsingBuffers {
    #[must_use]
    pub fn new() -> ParsingBuffers {
        ParsingBuffers {
            data: Vec::new(),
            compact_sched: CompactSchedBuffer::new(),
            buf_pages: PARSING_BUF_SIZE_PAGES,
        }
    }

    pub fn allocate_if_needed(&mut self) {
        if self.data.is_empty() {
            self.data = vec![0u8; self.buf_pages * sys_page_size()];
        }
    }

    #[must_use]
    pub fn buf_pages(&self) -> usize {
        self.buf_pages
    }
}

impl Default for ParsingBuffers {
    fn default() -> Self {
        ParsingBuffers::new()
    }
}

/// Parsed raw page header: timestamp of the first event, payload length in
/// bytes and the kernel's lost-events signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub timestamp: u64,
    pub size: u32,
    pub lost_events: bool,
}

/// Everything the reader needs to decode for one subscribing session.
pub struct SessionTarget<'a> {
    pub parsing_config: &'a DataSourceConfig,
    pub sink: &'a mut dyn RecordSink,
    pub metadata: &'a mut SessionMetadata,
    pub parse_errors: &'a mut BTreeSet<ParseStatus>,
    /// Timestamp of the last event written for this cpu, carried across
    /// read passes.
    pub bundle_end_timestamp: &'a mut u64,
}

pub struct CpuReader {
    cpu: usize,
    trace_fd: File,
}

impl CpuReader {
    #[must_use]
    pub fn new(cpu: usize, trace_fd: File) -> CpuReader {
        CpuReader { cpu, trace_fd }
    }

    #[must_use]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// The raw pipe fd, for watermark poll registration.
    #[must_use]
    pub fn raw_buffer_fd(&self) -> RawFd {
        self.trace_fd.as_raw_fd()
    }

    /// Drain up to `max_pages` from this cpu's pipe, decoding for every
    /// started session. Returns the number of pages read; a return equal to
    /// `max_pages` means the cpu may have more data pending.
    #[allow(clippy::too_many_arguments)]
    pub fn read_cycle(
        &mut self,
        bufs: &mut ParsingBuffers,
        max_pages: usize,
        table: &TranslationTable,
        clock: TraceClock,
        clock_snapshot: Option<ClockSnapshot>,
        symbolizer: &mut dyn SymbolResolver,
        sessions: &mut [SessionTarget],
    ) -> usize {
        bufs.allocate_if_needed();
        let mut total_pages_read = 0;
        let mut is_first_batch = true;
        loop {
            let batch_pages = bufs.buf_pages().min(max_pages - total_pages_read);
            let pages_read = self.read_and_process_batch(
                bufs,
                batch_pages,
                is_first_batch,
                table,
                clock,
                clock_snapshot,
                symbolizer,
                sessions,
            );
            total_pages_read += pages_read;

            // Either we caught up to the writer (or hit an error), or this
            // cycle's page budget is exhausted.
            if pages_read != batch_pages || total_pages_read >= max_pages {
                break;
            }
            is_first_batch = false;
        }
        total_pages_read
    }

    #[allow(clippy::too_many_arguments)]
    fn read_and_process_batch(
        &mut self,
        bufs: &mut ParsingBuffers,
        max_pages: usize,
        first_batch_in_cycle: bool,
        table: &TranslationTable,
        clock: TraceClock,
        clock_snapshot: Option<ClockSnapshot>,
        symbolizer: &mut dyn SymbolResolver,
        sessions: &mut [SessionTarget],
    ) -> usize {
        let page_size = sys_page_size();
        let mut pages_read = 0;
        while pages_read < max_pages {
            let page_buf = &mut bufs.data[pages_read * page_size..][..page_size];
            match self.trace_fd.read(page_buf) {
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Expected errnos: EAGAIN (no data in nonblocking mode),
                    // ENOMEM and EBUSY (transient kernel failures), ENODEV
                    // (cpu went offline). Everything else is reported.
                    let benign = matches!(
                        e.raw_os_error(),
                        Some(libc::EAGAIN | libc::ENOMEM | libc::EBUSY | libc::ENODEV)
                    );
                    if !benign {
                        set_parse_error(sessions, self.cpu, ParseStatus::UnexpectedReadError);
                    }
                    break;
                }
                // Rare, but possible; seems to occur when we caught up to
                // the writer.
                Ok(0) => {
                    debug!("[cpu{}]: 0-sized read from ftrace pipe", self.cpu);
                    break;
                }
                Ok(n) if n != page_size => {
                    // The kernel hands out whole constructed pages,
                    // zero-filling the tail if needed; a sub-page read is
                    // out of contract.
                    set_parse_error(sessions, self.cpu, ParseStatus::PartialPageRead);
                    break;
                }
                Ok(_) => {
                    pages_read += 1;
                    let page = &bufs.data[(pages_read - 1) * page_size..][..page_size];
                    let Some((header, _)) = Self::parse_page_header(page, table.page_header())
                    else {
                        // Processed (and reported) below with the rest of
                        // the batch.
                        break;
                    };
                    // A short first read of the cycle is normal: it's the
                    // remainder of a page partially consumed by the previous
                    // cycle.
                    if header.size < page_fill_threshold()
                        && !(first_batch_in_cycle && pages_read == 1)
                    {
                        break;
                    }
                }
            }
        }

        if pages_read == 0 {
            return 0;
        }

        let ParsingBuffers { data, compact_sched, .. } = bufs;
        let parsing_buf = &data[..pages_read * page_size];
        for session in sessions {
            Self::process_pages_for_data_source(
                session,
                self.cpu,
                parsing_buf,
                pages_read,
                table,
                clock,
                clock_snapshot,
                symbolizer,
                compact_sched,
            );
        }
        pages_read
    }

    /// Drain a stopped instance's pre-existing buffer pages: plain
    /// nonblocking reads without the catch-up heuristic, decoded with the
    /// same pipeline. Timestamps are parsed as-is since they belong to a
    /// previous boot's clock.
    pub fn read_frozen(
        &mut self,
        bufs: &mut ParsingBuffers,
        max_pages: usize,
        table: &TranslationTable,
        symbolizer: &mut dyn SymbolResolver,
        session: &mut SessionTarget,
    ) -> usize {
        bufs.allocate_if_needed();
        let page_size = sys_page_size();
        let max_pages = max_pages.min(bufs.buf_pages());

        let mut pages_read = 0;
        while pages_read < max_pages {
            let page_buf = &mut bufs.data[pages_read * page_size..][..page_size];
            match self.trace_fd.read(page_buf) {
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if e.raw_os_error() != Some(libc::EAGAIN) {
                        session.parse_errors.insert(ParseStatus::UnexpectedReadError);
                    }
                    break;
                }
                Ok(0) => break,
                Ok(n) if n != page_size => {
                    session.parse_errors.insert(ParseStatus::PartialPageRead);
                    break;
                }
                Ok(_) => pages_read += 1,
            }
        }

        if pages_read == 0 {
            return 0;
        }

        let ParsingBuffers { data, compact_sched, .. } = bufs;
        let parsing_buf = &data[..pages_read * page_size];
        Self::process_pages_for_data_source(
            session,
            self.cpu,
            parsing_buf,
            pages_read,
            table,
            TraceClock::Boot,
            None,
            symbolizer,
            compact_sched,
        );
        pages_read
    }

    /// Decode `pages_read` pages for one session, emitting bundles to its
    /// sink. Parsing continues past broken pages; errors are recorded
    /// inline. Returns false if any page failed.
    #[allow(clippy::too_many_arguments)]
    pub fn process_pages_for_data_source(
        session: &mut SessionTarget,
        cpu: usize,
        parsing_buf: &[u8],
        pages_read: usize,
        table: &TranslationTable,
        clock: TraceClock,
        clock_snapshot: Option<ClockSnapshot>,
        symbolizer: &mut dyn SymbolResolver,
        compact_sched_buf: &mut CompactSchedBuffer,
    ) -> bool {
        let page_size = sys_page_size();
        let ds_config = session.parsing_config;
        let compact_sched_enabled = ds_config.compact_sched.enabled;
        let mut bundler = Bundler::new(
            &mut *session.sink,
            compact_sched_buf,
            compact_sched_enabled,
            ds_config.symbolize_ksyms,
            cpu as u32,
            clock,
            clock_snapshot,
            *session.bundle_end_timestamp,
        );

        let mut success = true;
        for page_idx in 0..pages_read {
            let page = &parsing_buf[page_idx * page_size..][..page_size];
            let parsed = Self::parse_page_header(page, table.page_header());
            let valid = parsed.filter(|(header, data_offset)| {
                header.size > 0 && data_offset + header.size as usize <= page_size
            });
            let Some((header, data_offset)) = valid else {
                let timestamp = parsed.map_or(0, |(header, _)| header.timestamp);
                session.parse_errors.insert(ParseStatus::AbiInvalidPageHeader);
                bundler.write_error(timestamp, ParseStatus::AbiInvalidPageHeader);
                if ds_config.debug_ftrace_abi {
                    bundler.attach_broken_page(page);
                }
                success = false;
                continue;
            };

            // Start a new bundle if the kernel overwrote data since our last
            // read (single lost_events flag per bundle), or if the compact
            // interner outgrew its threshold.
            let interner_past_threshold = compact_sched_enabled
                && bundler.compact_sched_buf().interner().interned_comms_size()
                    > COMPACT_SCHED_INTERNER_THRESHOLD;
            if header.lost_events || interner_past_threshold {
                bundler.start_new_bundle(
                    header.lost_events,
                    table,
                    session.metadata,
                    symbolizer,
                );
            }

            let payload = &page[data_offset..data_offset + header.size as usize];
            match Self::parse_page_payload(
                payload,
                &header,
                table,
                ds_config,
                &mut bundler,
                session.metadata,
            ) {
                Ok(last_written_ts) => {
                    if last_written_ts != 0 {
                        bundler.set_previous_bundle_end_timestamp(last_written_ts);
                    }
                }
                Err(status) => {
                    session.parse_errors.insert(status);
                    bundler.write_error(header.timestamp, status);
                    if ds_config.debug_ftrace_abi {
                        bundler.attach_broken_page(page);
                    }
                    success = false;
                }
            }
        }

        bundler.finalize(table, session.metadata, symbolizer);
        *session.bundle_end_timestamp = bundler.previous_bundle_end_timestamp();
        success
    }

    /// Parse a raw page header: `timestamp` (u64), then the `commit` word
    /// whose low 27 bits are the payload length and whose top bits carry the
    /// loss flags. Returns the header and the payload start offset.
    #[must_use]
    pub fn parse_page_header(page: &[u8], spec: PageHeaderSpec) -> Option<(PageHeader, usize)> {
        let timestamp = read_u64(page, usize::from(spec.timestamp_offset))?;
        // Little-endian: the meaningful bits of an 8-byte commit live in the
        // low word.
        let size_and_flags = read_u32(page, usize::from(spec.commit_offset))?;
        let header = PageHeader {
            timestamp,
            size: size_and_flags & PAGE_DATA_SIZE_MASK,
            lost_events: size_and_flags & PAGE_MISSED_EVENTS_FLAG != 0,
        };
        Some((header, usize::from(spec.data_offset())))
    }

    /// Walk the page's records, dispatching on the 4-byte event header.
    /// Returns the timestamp of the last written event (0 if none).
    fn parse_page_payload(
        payload: &[u8],
        page_header: &PageHeader,
        table: &TranslationTable,
        ds_config: &DataSourceConfig,
        bundler: &mut Bundler,
        metadata: &mut SessionMetadata,
    ) -> Result<u64, ParseStatus> {
        let mut pos = 0usize;
        let end = payload.len();
        let mut timestamp = page_header.timestamp;
        let mut last_written_event_ts = 0u64;

        while pos < end {
            let event_header =
                read_u32(payload, pos).ok_or(ParseStatus::AbiShortEventHeader)?;
            pos += 4;
            let type_or_length = event_header & 0x1f;
            let time_delta = event_header >> 5;
            timestamp += u64::from(time_delta);

            match type_or_length {
                TYPE_PADDING => {
                    // Null padding with unspecified size is only valid
                    // beyond the committed payload.
                    if time_delta == 0 {
                        return Err(ParseStatus::AbiNullPadding);
                    }
                    let length =
                        read_u32(payload, pos).ok_or(ParseStatus::AbiShortPaddingLength)?;
                    pos += 4;
                    // Length includes itself.
                    if length < 4 {
                        return Err(ParseStatus::AbiInvalidPaddingLength);
                    }
                    pos += length as usize - 4;
                }
                TYPE_TIME_EXTEND => {
                    let time_delta_ext =
                        read_u32(payload, pos).ok_or(ParseStatus::AbiShortTimeExtend)?;
                    pos += 4;
                    timestamp += u64::from(time_delta_ext) << 27;
                }
                TYPE_TIME_STAMP => {
                    // Absolute timestamp record (4.17+ layout): same shape
                    // as a time extend, but replaces the running value.
                    let time_delta_ext =
                        read_u32(payload, pos).ok_or(ParseStatus::AbiShortTimeStamp)?;
                    pos += 4;
                    timestamp = u64::from(time_delta) + (u64::from(time_delta_ext) << 27);
                }
                _ => {
                    // Data record. type_or_length <= 28 encodes the length
                    // directly (in 4-byte words); 0 means the length is in
                    // the first payload word.
                    let event_size = if type_or_length == 0 {
                        let size =
                            read_u32(payload, pos).ok_or(ParseStatus::AbiShortDataLength)?;
                        pos += 4;
                        // Seen on select kernels: the header promises more
                        // data but the rest of the page is zeroes.
                        if size == 0 {
                            return Err(ParseStatus::AbiZeroDataLength);
                        }
                        if size < 4 {
                            return Err(ParseStatus::AbiInvalidDataLength);
                        }
                        size as usize - 4
                    } else {
                        4 * type_or_length as usize
                    };

                    let start = pos;
                    let next = start + event_size;
                    if next > end {
                        return Err(ParseStatus::AbiEndOverflow);
                    }
                    let record = &payload[start..next];
                    let ftrace_event_id =
                        read_u16(record, 0).ok_or(ParseStatus::AbiShortEventId)?;

                    if ds_config.event_filter.is_event_enabled(usize::from(ftrace_event_id)) {
                        let compact = table.compact_sched_format();
                        let compact_enabled = ds_config.compact_sched.enabled;
                        let mut event_written = true;

                        if compact_enabled && ftrace_event_id == compact.sched_switch.event_id {
                            if event_size < usize::from(compact.sched_switch.size) {
                                return Err(ParseStatus::ShortCompactEvent);
                            }
                            Self::parse_sched_switch_compact(
                                record,
                                timestamp,
                                &compact.sched_switch,
                                bundler.compact_sched_buf(),
                                metadata,
                            );
                        } else if compact_enabled
                            && ftrace_event_id == compact.sched_waking.event_id
                        {
                            if event_size < usize::from(compact.sched_waking.size) {
                                return Err(ParseStatus::ShortCompactEvent);
                            }
                            Self::parse_sched_waking_compact(
                                record,
                                timestamp,
                                &compact.sched_waking,
                                bundler.compact_sched_buf(),
                                metadata,
                            );
                        } else if let Some(print_filter) = ds_config
                            .print_filter
                            .as_ref()
                            .filter(|pf| pf.event_id() == ftrace_event_id)
                        {
                            if print_filter.is_event_interesting(record) {
                                if !Self::decode_event(
                                    ftrace_event_id,
                                    record,
                                    timestamp,
                                    table,
                                    ds_config,
                                    bundler,
                                    metadata,
                                ) {
                                    return Err(ParseStatus::InvalidEvent);
                                }
                            } else {
                                // Filtered out; doesn't count as written.
                                event_written = false;
                            }
                        } else if !Self::decode_event(
                            ftrace_event_id,
                            record,
                            timestamp,
                            table,
                            ds_config,
                            bundler,
                            metadata,
                        ) {
                            return Err(ParseStatus::InvalidEvent);
                        }

                        if event_written {
                            last_written_event_ts = timestamp;
                        }
                    }
                    pos = next;
                }
            }
        }

        Ok(last_written_event_ts)
    }

    /// Decode a single enabled event into the bundle. Returns false when the
    /// record disagrees with the translation plan.
    fn decode_event(
        ftrace_event_id: u16,
        record: &[u8],
        timestamp: u64,
        table: &TranslationTable,
        ds_config: &DataSourceConfig,
        bundler: &mut Bundler,
        metadata: &mut SessionMetadata,
    ) -> bool {
        // The event is enabled, so the table must know it.
        let Some(info) = table.event_by_id(ftrace_event_id) else {
            return false;
        };
        if usize::from(info.size) > record.len() {
            debug!("expected event length is beyond end of buffer");
            return false;
        }

        let mut pid = 0i32;
        if let Some(common_pid) = table.common_pid() {
            match decode_field_value(common_pid, record, table, metadata) {
                Some(FieldValue::Int(value)) => pid = value as i32,
                _ => return false,
            }
        }

        let mut success = true;
        let is_generic = TranslationTable::is_generic_event_output_id(info.output_id);
        let (output_id, payload) = if is_generic {
            if ds_config.write_generic_evt_descriptors {
                // Self-describing encoding: same shape as known events, plus
                // a pending schema for the bundle.
                bundler.note_generic_descriptor(info.output_id);
                let fields = decode_fields(info, record, table, metadata, &mut success);
                (info.output_id, EventPayload::Fields(fields))
            } else {
                // Legacy encoding: each field carries its own name.
                let mut fields = Vec::with_capacity(info.fields.len());
                for field in &info.fields {
                    match decode_field_value(field, record, table, metadata) {
                        Some(value) => fields.push((field.ftrace_name.clone(), value)),
                        None => success = false,
                    }
                }
                (
                    GENERIC_EVENT_LEGACY_ID,
                    EventPayload::LegacyGeneric { event_name: info.name.clone(), fields },
                )
            }
        } else if info.output_id == SYS_ENTER_FIELD_ID {
            match decode_sys_enter(info, record) {
                Some(fields) => (info.output_id, EventPayload::Fields(fields)),
                None => return false,
            }
        } else if info.output_id == SYS_EXIT_FIELD_ID {
            match decode_sys_exit(info, record, ds_config, metadata) {
                Some(fields) => (info.output_id, EventPayload::Fields(fields)),
                None => return false,
            }
        } else if info.output_id == KPROBE_EVENT_FIELD_ID {
            let kind = ds_config
                .kprobes
                .get(&ftrace_event_id)
                .copied()
                .unwrap_or(KprobeType::Instant);
            (info.output_id, EventPayload::Kprobe { name: info.name.clone(), kind })
        } else {
            let fields = decode_fields(info, record, table, metadata, &mut success);
            (info.output_id, EventPayload::Fields(fields))
        };

        // Task renames invalidate cached comm strings downstream; the
        // renamed pid equals the common pid for all cases we care about.
        if info.output_id == TASK_RENAME_FIELD_ID {
            metadata.add_rename_pid(metadata.last_seen_common_pid());
        }

        bundler.push_event(DecodedEvent { timestamp, pid, event: output_id, payload });
        metadata.finish_event();
        success
    }

    // Append a sched_switch to the compact batch, according to the
    // pre-validated format.
    fn parse_sched_switch_compact(
        record: &[u8],
        timestamp: u64,
        format: &CompactSchedSwitchFormat,
        compact_buf: &mut CompactSchedBuffer,
        metadata: &mut SessionMetadata,
    ) {
        let next_pid = read_i32(record, usize::from(format.next_pid_offset)).unwrap_or(0);
        metadata.add_pid(next_pid);
        let next_prio = read_i32(record, usize::from(format.next_prio_offset)).unwrap_or(0);
        let prev_state = read_signed(
            record,
            usize::from(format.prev_state_offset),
            usize::from(format.prev_state_size),
        )
        .unwrap_or(0);
        let comm = read_c_string(record, usize::from(format.next_comm_offset));
        compact_buf.append_switch(timestamp, prev_state, next_pid, next_prio, &comm);
    }

    fn parse_sched_waking_compact(
        record: &[u8],
        timestamp: u64,
        format: &CompactSchedWakingFormat,
        compact_buf: &mut CompactSchedBuffer,
        metadata: &mut SessionMetadata,
    ) {
        let pid = read_i32(record, usize::from(format.pid_offset)).unwrap_or(0);
        metadata.add_pid(pid);
        let target_cpu = read_i32(record, usize::from(format.target_cpu_offset)).unwrap_or(0);
        let prio = read_i32(record, usize::from(format.prio_offset)).unwrap_or(0);
        let comm = read_c_string(record, usize::from(format.comm_offset));
        let common_flags =
            record.get(usize::from(format.common_flags_offset)).copied().unwrap_or(0);
        compact_buf.append_waking(
            timestamp,
            pid,
            target_cpu,
            prio,
            &comm,
            u32::from(common_flags),
        );
    }
}

fn set_parse_error(sessions: &mut [SessionTarget], cpu: usize, status: ParseStatus) {
    debug!("[cpu{cpu}]: unexpected ftrace read error: {status:?}");
    for session in sessions {
        session.parse_errors.insert(status);
    }
}

fn decode_fields(
    info: &Event,
    record: &[u8],
    table: &TranslationTable,
    metadata: &mut SessionMetadata,
    success: &mut bool,
) -> Vec<FieldVal> {
    let mut fields = Vec::with_capacity(info.fields.len());
    for field in &info.fields {
        match decode_field_value(field, record, table, metadata) {
            Some(value) => fields.push(FieldVal { field: field.output_id, value }),
            None => *success = false,
        }
    }
    fields
}

/// Decode one field according to its translation strategy. `None` means the
/// record's bytes disagree with the plan (e.g. a `__data_loc` pointing
/// outside the record).
fn decode_field_value(
    field: &Field,
    record: &[u8],
    table: &TranslationTable,
    metadata: &mut SessionMetadata,
) -> Option<FieldValue> {
    use TranslationStrategy as S;
    let offset = usize::from(field.ftrace_offset);
    match field.strategy {
        S::Uint8ToUint64 | S::BoolToUint64 => {
            Some(FieldValue::Uint(u64::from(*record.get(offset)?)))
        }
        S::Uint16ToUint64 => Some(FieldValue::Uint(u64::from(read_u16(record, offset)?))),
        S::Uint32ToUint64 => Some(FieldValue::Uint(u64::from(read_u32(record, offset)?))),
        S::Uint64ToUint64 => Some(FieldValue::Uint(read_u64(record, offset)?)),
        S::Int8ToInt64 => Some(FieldValue::Int(i64::from(*record.get(offset)? as i8))),
        S::Int16ToInt64 => Some(FieldValue::Int(i64::from(read_u16(record, offset)? as i16))),
        S::Int32ToInt64 => Some(FieldValue::Int(i64::from(read_i32(record, offset)?))),
        S::Int64ToInt64 => Some(FieldValue::Int(read_u64(record, offset)? as i64)),
        S::FixedCStringToString => {
            let bytes = record.get(offset..offset + usize::from(field.ftrace_size))?;
            Some(FieldValue::Str(c_string_of(bytes)))
        }
        S::CStringToString => {
            let bytes = record.get(offset..)?;
            Some(FieldValue::Str(c_string_of(bytes)))
        }
        S::StringPtrToString => {
            // 4 or 8 byte kernel pointer, resolved through printk_formats.
            let address = match field.ftrace_size {
                4 => u64::from(read_u32(record, offset)?),
                _ => read_u64(record, offset)?,
            };
            Some(FieldValue::Str(table.lookup_trace_string(address).to_string()))
        }
        S::DataLocToString => {
            // Packed (offset, length) reference to the variable-length
            // section after the fixed record body.
            let data = read_u32(record, offset)?;
            let data_offset = (data & 0xffff) as usize;
            let data_len = ((data >> 16) & 0xffff) as usize;
            if data_len == 0 {
                return Some(FieldValue::Str(String::new()));
            }
            let bytes = record.get(data_offset..data_offset + data_len)?;
            Some(FieldValue::Str(c_string_of(bytes)))
        }
        S::Pid32ToInt64 => {
            let pid = read_i32(record, offset)?;
            metadata.add_pid(pid);
            Some(FieldValue::Int(i64::from(pid)))
        }
        S::CommonPid32ToInt64 => {
            let pid = read_i32(record, offset)?;
            metadata.add_common_pid(pid);
            Some(FieldValue::Int(i64::from(pid)))
        }
        S::Inode32ToUint64 => {
            let inode = u64::from(read_u32(record, offset)?);
            metadata.add_inode(inode);
            Some(FieldValue::Uint(inode))
        }
        S::Inode64ToUint64 => {
            let inode = read_u64(record, offset)?;
            metadata.add_inode(inode);
            Some(FieldValue::Uint(inode))
        }
        S::DevId32ToUint64 => {
            let dev = translate_block_device_id(u64::from(read_u32(record, offset)?));
            metadata.add_device(dev);
            Some(FieldValue::Uint(dev))
        }
        S::DevId64ToUint64 => {
            let dev = translate_block_device_id(read_u64(record, offset)?);
            metadata.add_device(dev);
            Some(FieldValue::Uint(dev))
        }
        S::SymAddr32ToUint64 => {
            let addr = u64::from(read_u32(record, offset)?);
            Some(FieldValue::SymbolIndex(metadata.add_symbol_addr(addr)))
        }
        S::SymAddr64ToUint64 => {
            let addr = read_u64(record, offset)?;
            Some(FieldValue::SymbolIndex(metadata.add_symbol_addr(addr)))
        }
        S::Invalid => None,
    }
}

fn decode_sys_enter(info: &Event, record: &[u8]) -> Option<Vec<FieldVal>> {
    if info.fields.len() != 2 {
        debug!("unexpected number of fields for sys_enter");
        return None;
    }
    let id_field = &info.fields[0];
    let args_field = &info.fields[1];

    let syscall_id = read_signed_field(id_field, record)?;
    let mut fields = vec![FieldVal { field: id_field.output_id, value: FieldValue::Int(syscall_id) }];

    // field:unsigned long args[6]; the element width follows from the
    // inferred type.
    let element_size = match args_field.strategy {
        TranslationStrategy::Uint32ToUint64 => 4usize,
        TranslationStrategy::Uint64ToUint64 => 8usize,
        _ => return None,
    };
    for i in 0..6 {
        let offset = usize::from(args_field.ftrace_offset) + i * element_size;
        let value = match element_size {
            4 => u64::from(read_u32(record, offset)?),
            _ => read_u64(record, offset)?,
        };
        fields.push(FieldVal { field: args_field.output_id, value: FieldValue::Uint(value) });
    }
    Some(fields)
}

fn decode_sys_exit(
    info: &Event,
    record: &[u8],
    ds_config: &DataSourceConfig,
    metadata: &mut SessionMetadata,
) -> Option<Vec<FieldVal>> {
    if info.fields.len() != 2 {
        debug!("unexpected number of fields for sys_exit");
        return None;
    }
    let id_field = &info.fields[0];
    let ret_field = &info.fields[1];
    let syscall_id = read_signed_field(id_field, record)?;
    let syscall_ret = read_signed_field(ret_field, record)?;

    // Successful fd-producing syscalls are marked for downstream scraping.
    if ds_config.syscalls_returning_fd.contains(&syscall_id)
        && (0..=i64::from(i32::MAX)).contains(&syscall_ret)
    {
        metadata.add_fd(syscall_ret as u64);
    }

    Some(vec![
        FieldVal { field: id_field.output_id, value: FieldValue::Int(syscall_id) },
        FieldVal { field: ret_field.output_id, value: FieldValue::Int(syscall_ret) },
    ])
}

/// Reads a signed kernel `long` field declared as int32 or int64.
fn read_signed_field(field: &Field, record: &[u8]) -> Option<i64> {
    match field.strategy {
        TranslationStrategy::Int32ToInt64 => {
            read_signed(record, usize::from(field.ftrace_offset), 4)
        }
        TranslationStrategy::Int64ToInt64 => {
            read_signed(record, usize::from(field.ftrace_offset), 8)
        }
        _ => None,
    }
}

/// User-space device id from the kernel's interleaved major/minor encoding.
fn translate_block_device_id(raw: u64) -> u64 {
    let major = raw >> 20;
    let minor = raw & ((1 << 20) - 1);
    ((major & 0xffff_f000) << 32)
        | ((major & 0xfff) << 8)
        | ((minor & 0xffff_ff00) << 12)
        | (minor & 0xff)
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes(data.get(offset..offset + 2)?.try_into().ok()?))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(offset..offset + 4)?.try_into().ok()?))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    Some(u64::from_le_bytes(data.get(offset..offset + 8)?.try_into().ok()?))
}

fn read_i32(data: &[u8], offset: usize) -> Option<i32> {
    read_u32(data, offset).map(|v| v as i32)
}

fn read_signed(data: &[u8], offset: usize, size: usize) -> Option<i64> {
    match size {
        4 => read_i32(data, offset).map(i64::from),
        8 => read_u64(data, offset).map(|v| v as i64),
        _ => None,
    }
}

/// Bytes until the first NUL or the end of the slice, as lossy UTF-8.
fn c_string_of(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

fn read_c_string(data: &[u8], offset: usize) -> String {
    data.get(offset..).map(c_string_of).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftrace::compact_sched::CompactSchedConfig;
    use crate::ftrace::symbolizer::NullSymbolizer;
    use crate::ftrace::translation::EventFilter;
    use crate::output::MemorySink;
    use probes_common::EventBundle;
    use std::collections::HashMap;

    /// Builds one synthetic raw ring-buffer page (64-bit header layout).
    pub(crate) struct PageBuilder {
        timestamp: u64,
        lost_events: bool,
        payload: Vec<u8>,
    }

    impl PageBuilder {
        pub(crate) fn new(timestamp: u64) -> PageBuilder {
            PageBuilder { timestamp, lost_events: false, payload: Vec::new() }
        }

        pub(crate) fn lost_events(mut self) -> PageBuilder {
            self.lost_events = true;
            self
        }

        fn push_u32(&mut self, value: u32) {
            self.payload.extend_from_slice(&value.to_le_bytes());
        }

        /// Data record with the length packed into the header word.
        pub(crate) fn add_event(mut self, time_delta: u32, record: &[u8]) -> PageBuilder {
            assert_eq!(record.len() % 4, 0);
            assert!(record.len() / 4 <= 28);
            self.push_u32((time_delta << 5) | (record.len() as u32 / 4));
            self.payload.extend_from_slice(record);
            self
        }

        /// Data record with an explicit length word (type_or_length == 0).
        pub(crate) fn add_sized_event(mut self, time_delta: u32, record: &[u8]) -> PageBuilder {
            self.push_u32(time_delta << 5);
            self.push_u32(record.len() as u32 + 4);
            self.payload.extend_from_slice(record);
            self
        }

        pub(crate) fn add_time_extend(mut self, time_delta: u32, extension: u32) -> PageBuilder {
            self.push_u32((time_delta << 5) | TYPE_TIME_EXTEND);
            self.push_u32(extension);
            self
        }

        pub(crate) fn add_absolute_timestamp(
            mut self,
            low_bits: u32,
            high_bits: u32,
        ) -> PageBuilder {
            self.push_u32((low_bits << 5) | TYPE_TIME_STAMP);
            self.push_u32(high_bits);
            self
        }

        pub(crate) fn add_padding(mut self, time_delta: u32, length: u32) -> PageBuilder {
            assert!(length >= 4);
            self.push_u32((time_delta << 5) | TYPE_PADDING);
            self.push_u32(length);
            self.payload.extend_from_slice(&vec![0u8; length as usize - 4]);
            self
        }

        pub(crate) fn build(self) -> Vec<u8> {
            self.build_with_size(self.payload.len() as u32)
        }

        /// Build with a forged payload size, for malformed-header tests.
        pub(crate) fn build_with_size(&self, size: u32) -> Vec<u8> {
            let mut page = vec![0u8; sys_page_size()];
            page[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
            let mut commit = size;
            if self.lost_events {
                commit |= PAGE_MISSED_EVENTS_FLAG;
            }
            page[8..12].copy_from_slice(&commit.to_le_bytes());
            page[16..16 + self.payload.len()].copy_from_slice(&self.payload);
            page
        }
    }

    /// A sched_switch record matching the fake format in the translation
    /// tests (64 bytes, event id 316).
    pub(crate) fn sched_switch_record(
        common_pid: i32,
        prev_comm: &str,
        prev_pid: i32,
        prev_prio: i32,
        prev_state: i64,
        next_comm: &str,
        next_pid: i32,
        next_prio: i32,
    ) -> Vec<u8> {
        let mut record = vec![0u8; 64];
        record[0..2].copy_from_slice(&316u16.to_le_bytes());
        record[4..8].copy_from_slice(&common_pid.to_le_bytes());
        record[8..8 + prev_comm.len()].copy_from_slice(prev_comm.as_bytes());
        record[24..28].copy_from_slice(&prev_pid.to_le_bytes());
        record[28..32].copy_from_slice(&prev_prio.to_le_bytes());
        record[32..40].copy_from_slice(&prev_state.to_le_bytes());
        record[40..40 + next_comm.len()].copy_from_slice(next_comm.as_bytes());
        record[56..60].copy_from_slice(&next_pid.to_le_bytes());
        record[60..64].copy_from_slice(&next_prio.to_le_bytes());
        record
    }

    pub(crate) fn ds_config_for_events(event_ids: &[u16], compact: bool) -> DataSourceConfig {
        let mut filter = EventFilter::new();
        for id in event_ids {
            filter.add_enabled_event(usize::from(*id));
        }
        DataSourceConfig {
            event_filter: filter,
            syscall_filter: EventFilter::new(),
            compact_sched: CompactSchedConfig { enabled: compact },
            print_filter: None,
            atrace_apps: Vec::new(),
            atrace_categories: Vec::new(),
            atrace_categories_sdk_optout: Vec::new(),
            symbolize_ksyms: false,
            buffer_percent: 0,
            syscalls_returning_fd: std::collections::BTreeSet::new(),
            kprobes: HashMap::new(),
            debug_ftrace_abi: false,
            write_generic_evt_descriptors: true,
        }
    }

    pub(crate) struct DecodeHarness {
        pub table: TranslationTable,
        pub config: DataSourceConfig,
        pub sink: MemorySink,
        pub metadata: SessionMetadata,
        pub parse_errors: BTreeSet<ParseStatus>,
        pub bundle_end_timestamp: u64,
        pub compact_buf: CompactSchedBuffer,
    }

    impl DecodeHarness {
        pub(crate) fn new(compact: bool) -> DecodeHarness {
            let (_dir, tracefs) =
                crate::ftrace::translation::tests::fake_tracefs_with_events(1);
            let table = TranslationTable::build(&tracefs);
            DecodeHarness {
                table,
                config: ds_config_for_events(&[316, 320, 5], compact),
                sink: MemorySink::new(),
                metadata: SessionMetadata::new(),
                parse_errors: BTreeSet::new(),
                bundle_end_timestamp: 0,
                compact_buf: CompactSchedBuffer::new(),
            }
        }

        pub(crate) fn process(&mut self, pages: &[Vec<u8>]) -> bool {
            let mut buf = Vec::new();
            for page in pages {
                buf.extend_from_slice(page);
            }
            let mut session = SessionTarget {
                parsing_config: &self.config,
                sink: &mut self.sink,
                metadata: &mut self.metadata,
                parse_errors: &mut self.parse_errors,
                bundle_end_timestamp: &mut self.bundle_end_timestamp,
            };
            CpuReader::process_pages_for_data_source(
                &mut session,
                0,
                &buf,
                pages.len(),
                &self.table,
                TraceClock::Boot,
                None,
                &mut NullSymbolizer,
                &mut self.compact_buf,
            )
        }

        pub(crate) fn bundles(&self) -> &[EventBundle] {
            &self.sink.bundles
        }
    }

    #[test]
    fn test_parse_page_header() {
        let spec = crate::ftrace::format::PageHeaderSpec {
            timestamp_offset: 0,
            commit_offset: 8,
            commit_size: 8,
        };
        let page = PageBuilder::new(1000).build_with_size(64);
        let (header, data_offset) = CpuReader::parse_page_header(&page, spec).unwrap();
        assert_eq!(header.timestamp, 1000);
        assert_eq!(header.size, 64);
        assert!(!header.lost_events);
        assert_eq!(data_offset, 16);

        let lost = PageBuilder::new(7).lost_events().build_with_size(32);
        let (header, _) = CpuReader::parse_page_header(&lost, spec).unwrap();
        assert!(header.lost_events);
        assert_eq!(header.size, 32);
    }

    #[test]
    fn test_single_sched_switch_compact() {
        let mut harness = DecodeHarness::new(true);
        let record = sched_switch_record(10, "prev", 10, 110, 1, "worker", 42, 120);
        let page = PageBuilder::new(1000).add_event(50, &record).build();

        assert!(harness.process(&[page]));
        assert!(harness.parse_errors.is_empty());
        let bundles = harness.bundles();
        assert_eq!(bundles.len(), 1);
        let bundle = &bundles[0];
        assert_eq!(bundle.cpu, 0);
        assert!(!bundle.lost_events);
        assert!(bundle.events.is_empty());

        let sched = bundle.compact_sched.as_ref().unwrap();
        assert_eq!(sched.switch_timestamp, vec![1050]);
        assert_eq!(sched.switch_next_pid, vec![42]);
        assert_eq!(sched.switch_next_prio, vec![120]);
        assert_eq!(sched.switch_prev_state, vec![1]);
        assert_eq!(sched.switch_next_comm_index, vec![0]);
        assert_eq!(sched.intern_table, vec!["worker".to_string()]);

        assert_eq!(harness.bundle_end_timestamp, 1050);
        assert!(harness.metadata.pids.contains(&42));
    }

    #[test]
    fn test_sched_switch_full_decode() {
        let mut harness = DecodeHarness::new(false);
        let record = sched_switch_record(10, "shell", 10, 110, 2, "worker", 42, 120);
        let page = PageBuilder::new(1000).add_event(50, &record).build();

        assert!(harness.process(&[page]));
        let bundle = &harness.bundles()[0];
        assert_eq!(bundle.events.len(), 1);
        let event = &bundle.events[0];
        assert_eq!(event.timestamp, 1050);
        assert_eq!(event.pid, 10);
        assert_eq!(event.event, crate::ftrace::event_info::SCHED_SWITCH_FIELD_ID);
        let EventPayload::Fields(fields) = &event.payload else {
            panic!("expected field payload");
        };
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[0].value, FieldValue::Str("shell".to_string()));
        assert_eq!(fields[4].value, FieldValue::Str("worker".to_string()));
        assert_eq!(fields[5].value, FieldValue::Int(42));
        assert_eq!(fields[6].value, FieldValue::Int(120));
        assert!(harness.metadata.pids.contains(&10));
    }

    #[test]
    fn test_time_extend_and_absolute_timestamp() {
        let mut harness = DecodeHarness::new(false);
        let record = sched_switch_record(1, "a", 1, 1, 0, "b", 2, 2);
        let page = PageBuilder::new(1000)
            .add_time_extend(3, 2) // += 3 + (2 << 27)
            .add_event(10, &record)
            .add_absolute_timestamp(5, 1) // = 5 + (1 << 27)
            .add_event(7, &record)
            .build();

        assert!(harness.process(&[page]));
        let bundle = &harness.bundles()[0];
        assert_eq!(bundle.events.len(), 2);
        assert_eq!(bundle.events[0].timestamp, 1000 + 3 + (2u64 << 27) + 10);
        assert_eq!(bundle.events[1].timestamp, 5 + (1u64 << 27) + 7);
    }

    #[test]
    fn test_padding_is_skipped() {
        let mut harness = DecodeHarness::new(false);
        let record = sched_switch_record(1, "a", 1, 1, 0, "b", 2, 2);
        let page = PageBuilder::new(1000)
            .add_padding(1, 12)
            .add_event(10, &record)
            .build();

        assert!(harness.process(&[page]));
        let bundle = &harness.bundles()[0];
        assert_eq!(bundle.events.len(), 1);
        assert_eq!(bundle.events[0].timestamp, 1011);
    }

    #[test]
    fn test_null_padding_aborts_page() {
        let mut harness = DecodeHarness::new(false);
        let mut page = PageBuilder::new(1000);
        page.push_u32(TYPE_PADDING); // time_delta == 0
        page.push_u32(0);
        let page = page.build();

        assert!(!harness.process(&[page]));
        assert!(harness.parse_errors.contains(&ParseStatus::AbiNullPadding));
        let bundle = &harness.bundles()[0];
        assert_eq!(bundle.errors.len(), 1);
        assert_eq!(bundle.errors[0].status, ParseStatus::AbiNullPadding);
        assert_eq!(bundle.errors[0].timestamp, 1000);
    }

    #[test]
    fn test_invalid_page_header_reported() {
        let mut harness = DecodeHarness::new(false);
        // Payload length exceeding the page.
        let page = PageBuilder::new(1000).build_with_size(1 << 20);

        assert!(!harness.process(&[page]));
        assert!(harness.parse_errors.contains(&ParseStatus::AbiInvalidPageHeader));
        let bundle = &harness.bundles()[0];
        assert!(bundle.events.is_empty());
        assert_eq!(bundle.errors[0].status, ParseStatus::AbiInvalidPageHeader);
        assert_eq!(bundle.errors[0].timestamp, 1000);
    }

    #[test]
    fn test_zero_data_length_reported() {
        let mut harness = DecodeHarness::new(false);
        let mut builder = PageBuilder::new(500);
        builder.push_u32(9 << 5); // type_or_length == 0, delta 9
        builder.push_u32(0); // length word of 0
        let page = builder.build();

        assert!(!harness.process(&[page]));
        assert!(harness.parse_errors.contains(&ParseStatus::AbiZeroDataLength));
    }

    #[test]
    fn test_lost_events_starts_new_bundle() {
        let mut harness = DecodeHarness::new(false);
        let record = sched_switch_record(1, "a", 1, 1, 0, "b", 2, 2);
        let first = PageBuilder::new(1000).add_event(10, &record).build();
        let second = PageBuilder::new(2000).lost_events().add_event(10, &record).build();

        assert!(harness.process(&[first, second]));
        let bundles = harness.bundles();
        assert_eq!(bundles.len(), 2);
        assert!(!bundles[0].lost_events);
        assert!(bundles[1].lost_events);
        assert_eq!(bundles[0].events.len(), 1);
        assert_eq!(bundles[1].events.len(), 1);
        // The second bundle references the last event of the first.
        assert_eq!(bundles[1].previous_bundle_end_timestamp, 1010);
    }

    #[test]
    fn test_disabled_events_are_skipped() {
        let mut harness = DecodeHarness::new(false);
        harness.config = ds_config_for_events(&[], false);
        let record = sched_switch_record(1, "a", 1, 1, 0, "b", 2, 2);
        let page = PageBuilder::new(1000).add_event(10, &record).build();

        assert!(harness.process(&[page]));
        // Nothing interesting: no bundle is opened at all.
        assert!(harness.bundles().is_empty());
        assert_eq!(harness.bundle_end_timestamp, 0);
    }

    #[test]
    fn test_explicit_length_record() {
        let mut harness = DecodeHarness::new(false);
        let record = sched_switch_record(1, "a", 1, 1, 0, "b", 2, 2);
        let page = PageBuilder::new(1000).add_sized_event(10, &record).build();

        assert!(harness.process(&[page]));
        assert_eq!(harness.bundles()[0].events.len(), 1);
    }

    #[test]
    fn test_end_overflow_reported() {
        let mut harness = DecodeHarness::new(false);
        let mut builder = PageBuilder::new(1000);
        // Claims 28 words of data but provides none.
        builder.push_u32((1 << 5) | 28);
        let page = builder.build();

        assert!(!harness.process(&[page]));
        assert!(harness.parse_errors.contains(&ParseStatus::AbiEndOverflow));
    }

    #[test]
    fn test_record_shorter_than_event_layout_is_invalid() {
        let mut harness = DecodeHarness::new(false);
        // 8-byte record carrying sched_switch's id; the layout wants 64.
        let mut record = vec![0u8; 8];
        record[0..2].copy_from_slice(&316u16.to_le_bytes());
        let page = PageBuilder::new(1000).add_event(1, &record).build();

        assert!(!harness.process(&[page]));
        assert!(harness.parse_errors.contains(&ParseStatus::InvalidEvent));
    }

    #[test]
    fn test_interner_overflow_forces_bundle_boundary() {
        let mut harness = DecodeHarness::new(true);
        // Three pages of sched_switches with distinct comms; the interner
        // crosses the threshold between pages, never within one bundle.
        let mut comm_counter = 0;
        let mut pages = Vec::new();
        for _ in 0..3 {
            let mut builder = PageBuilder::new(1000);
            for _ in 0..40 {
                let comm = format!("task{comm_counter:04}");
                comm_counter += 1;
                builder = builder.add_event(
                    1,
                    &sched_switch_record(1, "p", 1, 1, 0, &comm, comm_counter, 1),
                );
            }
            pages.push(builder.build());
        }

        assert!(harness.process(&pages));
        let bundles = harness.bundles();
        assert_eq!(bundles.len(), 2);
        for bundle in bundles {
            let sched = bundle.compact_sched.as_ref().unwrap();
            assert!(sched.intern_table.len() <= 2 * COMPACT_SCHED_INTERNER_THRESHOLD);
            assert!(!bundle.lost_events);
        }
        // Every comm survived, across the boundary.
        let total: usize = bundles
            .iter()
            .map(|b| b.compact_sched.as_ref().unwrap().switch_timestamp.len())
            .sum();
        assert_eq!(total, 120);
    }

    #[test]
    fn test_decode_data_loc_field() {
        let harness = DecodeHarness::new(false);
        let field = Field {
            ftrace_name: "name".to_string(),
            output_id: 1,
            output_kind: probes_common::OutputKind::String,
            ftrace_offset: 8,
            ftrace_size: 4,
            ftrace_type: crate::ftrace::translation::FtraceFieldType::DataLoc,
            strategy: TranslationStrategy::DataLocToString,
        };
        let mut metadata = SessionMetadata::new();

        // Packed (offset | len << 16) pointing at "hi\0" at offset 12.
        let mut record = vec![0u8; 16];
        record[8..12].copy_from_slice(&(12u32 | (3 << 16)).to_le_bytes());
        record[12..14].copy_from_slice(b"hi");
        let value = decode_field_value(&field, &record, &harness.table, &mut metadata);
        assert_eq!(value, Some(FieldValue::Str("hi".to_string())));

        // Zero length decodes to the empty string without error.
        let mut record = vec![0u8; 16];
        record[8..12].copy_from_slice(&12u32.to_le_bytes());
        let value = decode_field_value(&field, &record, &harness.table, &mut metadata);
        assert_eq!(value, Some(FieldValue::Str(String::new())));

        // Out-of-record reference is a decode failure, not a wild read.
        let mut record = vec![0u8; 16];
        record[8..12].copy_from_slice(&(12u32 | (200 << 16)).to_le_bytes());
        let value = decode_field_value(&field, &record, &harness.table, &mut metadata);
        assert_eq!(value, None);
    }

    #[test]
    fn test_sys_enter_and_sys_exit_decode() {
        use crate::ftrace::tracefs::tests::{add_fake_event, fake_tracefs};
        let (dir, tracefs) = fake_tracefs(1);
        std::fs::write(
            dir.path().join("events/header_page"),
            "\tfield: u64 timestamp;\toffset:0;\tsize:8;\tsigned:0;\n\
             \tfield: local_t commit;\toffset:8;\tsize:8;\tsigned:1;\n",
        )
        .unwrap();
        add_fake_event(
            dir.path(),
            "raw_syscalls",
            "sys_enter",
            "name: sys_enter\nID: 21\nformat:\n\
             \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
             \tfield:long id;\toffset:8;\tsize:8;\tsigned:1;\n\
             \tfield:unsigned long args[6];\toffset:16;\tsize:48;\tsigned:0;\n",
        );
        add_fake_event(
            dir.path(),
            "raw_syscalls",
            "sys_exit",
            "name: sys_exit\nID: 22\nformat:\n\
             \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
             \tfield:long id;\toffset:8;\tsize:8;\tsigned:1;\n\
             \tfield:long ret;\toffset:16;\tsize:8;\tsigned:1;\n",
        );
        let table = TranslationTable::build(&tracefs);

        let mut config = ds_config_for_events(&[21, 22], false);
        config.syscalls_returning_fd.insert(257); // openat

        let mut enter = vec![0u8; 64];
        enter[0..2].copy_from_slice(&21u16.to_le_bytes());
        enter[4..8].copy_from_slice(&33i32.to_le_bytes());
        enter[8..16].copy_from_slice(&257i64.to_le_bytes());
        for arg in 0..6u64 {
            let offset = 16 + (arg as usize) * 8;
            enter[offset..offset + 8].copy_from_slice(&(100 + arg).to_le_bytes());
        }
        let mut exit = vec![0u8; 24];
        exit[0..2].copy_from_slice(&22u16.to_le_bytes());
        exit[4..8].copy_from_slice(&33i32.to_le_bytes());
        exit[8..16].copy_from_slice(&257i64.to_le_bytes());
        exit[16..24].copy_from_slice(&5i64.to_le_bytes());

        let page = PageBuilder::new(1000).add_event(1, &enter).add_event(1, &exit).build();

        let mut sink = MemorySink::new();
        let mut metadata = SessionMetadata::new();
        let mut parse_errors = BTreeSet::new();
        let mut bundle_end = 0u64;
        let mut session = SessionTarget {
            parsing_config: &config,
            sink: &mut sink,
            metadata: &mut metadata,
            parse_errors: &mut parse_errors,
            bundle_end_timestamp: &mut bundle_end,
        };
        let mut compact = CompactSchedBuffer::new();
        assert!(CpuReader::process_pages_for_data_source(
            &mut session,
            0,
            &page,
            1,
            &table,
            TraceClock::Boot,
            None,
            &mut NullSymbolizer,
            &mut compact,
        ));

        let bundle = &sink.bundles[0];
        assert_eq!(bundle.events.len(), 2);

        let EventPayload::Fields(enter_fields) = &bundle.events[0].payload else {
            panic!("expected fields");
        };
        // Syscall id plus six args.
        assert_eq!(enter_fields.len(), 7);
        assert_eq!(enter_fields[0].value, FieldValue::Int(257));
        assert_eq!(enter_fields[1].value, FieldValue::Uint(100));
        assert_eq!(enter_fields[6].value, FieldValue::Uint(105));

        let EventPayload::Fields(exit_fields) = &bundle.events[1].payload else {
            panic!("expected fields");
        };
        assert_eq!(exit_fields[0].value, FieldValue::Int(257));
        assert_eq!(exit_fields[1].value, FieldValue::Int(5));
        // The successful openat's fd is marked for scraping.
        assert!(metadata.fds.contains(&(33, 5)));
    }

    #[test]
    fn test_translate_block_device_id() {
        // maj 8, min 1 (sda1): kernel encoding 8 << 20 | 1.
        let raw = (8u64 << 20) | 1;
        assert_eq!(translate_block_device_id(raw), (8 << 8) | 1);
    }

    #[test]
    fn test_c_string_reads() {
        assert_eq!(c_string_of(b"worker\0junk"), "worker");
        assert_eq!(c_string_of(b"full16charsnonul"), "full16charsnonul");
        assert_eq!(read_c_string(b"abc\0", 1), "bc");
        assert_eq!(read_c_string(b"abc", 10), "");
    }
}
