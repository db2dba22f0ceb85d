// Shared data model between the ftrace engine and record sinks.
//
// The engine decodes raw ring-buffer pages into these structures; sinks
// (JSON export, in-memory test sinks, the tracing service client) only ever
// see this crate's types. Everything here is serde-serializable so sinks can
// pick their own wire encoding.

use serde::{Deserialize, Serialize};

/// Output field ids below this value belong to events known at compile time.
/// Ids assigned to runtime-discovered ("generic") events start here and grow
/// monotonically for the lifetime of a tracing instance.
pub const GENERIC_EVENT_FIRST_ID: u32 = 65536;

/// Outcome of parsing a batch of raw ring-buffer bytes. ABI statuses describe
/// disagreements between the kernel's binary layout and our understanding of
/// it; they are emitted inline as data, never as process failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParseStatus {
    AbiInvalidPageHeader,
    AbiShortEventHeader,
    AbiNullPadding,
    AbiShortPaddingLength,
    AbiInvalidPaddingLength,
    AbiShortTimeExtend,
    AbiShortTimeStamp,
    AbiShortDataLength,
    AbiZeroDataLength,
    AbiInvalidDataLength,
    AbiEndOverflow,
    AbiShortEventId,
    InvalidEvent,
    ShortCompactEvent,
    UnexpectedReadError,
    PartialPageRead,
}

/// The kernel trace clock active while the bundle's events were recorded.
/// `Boot` is the modern default and is left implicit by sinks that follow the
/// original wire format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceClock {
    #[default]
    Boot,
    Global,
    Local,
    MonoRaw,
    Unknown,
}

/// Pairing of a kprobe record with its kretprobe counterpart, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KprobeType {
    Instant,
    Begin,
    End,
}

/// A single decoded field value. Kernel addresses are never emitted raw:
/// they arrive as indices into the bundle's interned symbol table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Int(i64),
    Uint(u64),
    Str(String),
    SymbolIndex(u32),
}

/// Field id + decoded value, in the event's declared field order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldVal {
    pub field: u32,
    pub value: FieldValue,
}

/// The per-event payload, in one of three encodings mirroring the decoder's
/// dispatch: the common id-keyed form, the legacy self-naming form for
/// generic events, and the fixed kprobe form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Fields(Vec<FieldVal>),
    LegacyGeneric { event_name: String, fields: Vec<(String, FieldValue)> },
    Kprobe { name: String, kind: KprobeType },
}

/// One decoded ftrace record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedEvent {
    /// Timestamp reconstructed from the page header and per-record deltas.
    pub timestamp: u64,
    /// The common header pid of the emitting task.
    pub pid: i32,
    /// Stable output field id identifying the event type.
    pub event: u32,
    pub payload: EventPayload,
}

/// Output type of a generic event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
    Int64,
    Uint64,
    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub id: u32,
    pub name: String,
    pub kind: OutputKind,
}

/// Self-describing schema for a runtime-discovered event, emitted alongside
/// the first bundle that contains such an event so downstream consumers can
/// decode later occurrences by id alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericEventDescriptor {
    pub event: u32,
    pub group: String,
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

/// Columnar encoding of scheduling events, with comm strings interned per
/// bundle. Row i of the switch (resp. waking) arrays is one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactSched {
    pub intern_table: Vec<String>,

    pub switch_timestamp: Vec<u64>,
    pub switch_prev_state: Vec<i64>,
    pub switch_next_pid: Vec<i32>,
    pub switch_next_prio: Vec<i32>,
    pub switch_next_comm_index: Vec<u32>,

    pub waking_timestamp: Vec<u64>,
    pub waking_pid: Vec<i32>,
    pub waking_target_cpu: Vec<i32>,
    pub waking_prio: Vec<i32>,
    pub waking_comm_index: Vec<u32>,
    pub waking_common_flags: Vec<u32>,
}

impl CompactSched {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.switch_timestamp.is_empty() && self.waking_timestamp.is_empty()
    }
}

/// Parse error reported inline in a bundle. `timestamp` is 0 when the error
/// occurred before the page timestamp could be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleError {
    pub timestamp: u64,
    pub status: ParseStatus,
}

/// Interned kernel symbol, valid from this bundle onwards within a session
/// (until `incremental_state_cleared` restarts the numbering).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternedSymbol {
    pub index: u32,
    pub name: String,
}

/// Snapshot pair used by consumers to convert a non-boot ftrace clock back
/// to the boot clock on a best-effort basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSnapshot {
    pub ftrace_clock_ts: i64,
    pub boot_clock_ts: i64,
}

/// An output grouping of decoded events sharing a cpu, clock and loss flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBundle {
    pub cpu: u32,
    /// The kernel overwrote unread data in this cpu's buffer since the last
    /// read. Constant per bundle: a loss signal forces a bundle boundary.
    pub lost_events: bool,
    /// Timestamp of the last event written into the previous bundle for this
    /// (session, cpu). Zero for the first bundle, meaning "all data valid
    /// since the session started".
    pub previous_bundle_end_timestamp: u64,
    /// Left implicit on the wire when it is the expected `Boot` clock.
    #[serde(default, skip_serializing_if = "is_boot_clock")]
    pub clock: TraceClock,
    pub clock_snapshot: Option<ClockSnapshot>,
    pub events: Vec<DecodedEvent>,
    pub compact_sched: Option<CompactSched>,
    pub descriptors: Vec<GenericEventDescriptor>,
    pub errors: Vec<BundleError>,
    pub symbols: Vec<InternedSymbol>,
    /// Set on the first bundle that writes interned symbols for a session,
    /// telling consumers to discard earlier symbol indices.
    pub incremental_state_cleared: bool,
    /// Raw page bytes attached when a session opted into ABI debugging and
    /// the page failed to parse.
    pub broken_page: Option<Vec<u8>>,
}

fn is_boot_clock(clock: &TraceClock) -> bool {
    *clock == TraceClock::Boot
}

/// Per-cpu ring buffer statistics, as reported by `per_cpu/cpuN/stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub cpu: u32,
    pub entries: u64,
    pub overrun: u64,
    pub commit_overrun: u64,
    pub bytes_read: u64,
    pub oldest_event_ts: f64,
    pub now_ts: f64,
    pub dropped_events: u64,
    pub read_events: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TracePhase {
    StartOfTrace,
    EndOfTrace,
}

/// Bracketing packet emitted around a frozen-instance drain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub phase: Option<TracePhase>,
    pub preserve_ftrace_buffer: bool,
    pub cpu_stats: Vec<CpuStats>,
    pub parse_errors: Vec<ParseStatus>,
}
