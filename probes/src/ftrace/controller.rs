//! Instance and session lifecycle, and the cooperative read loop
//!
//! One controller drives the root tracefs instance plus any secondary
//! `instances/<name>/` trees. All tracefs mutation and reader work happens
//! on the single task-runner thread; readers drain per-cpu pipes on a
//! periodic tick, optionally augmented with buffer-watermark wakeups where
//! the kernel supports them.

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::os::fd::RawFd;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use probes_common::{ClockSnapshot, ParseStatus, StatsRecord, TraceClock, TracePhase};

use super::atrace::AtraceRunner;
use super::compact_sched::CompactSchedConfig;
use super::config::{accessible_predefined_tracepoints, FtraceConfig};
use super::cpu_reader::{CpuReader, ParsingBuffers, SessionTarget};
use super::metadata::SessionMetadata;
use super::muxer::{ConfigMuxer, DataSourceConfig, MuxerContext, SetupDiagnostics};
use super::symbolizer::SymbolResolver;
use super::syscalls::SyscallTable;
use super::tracefs::{Tracefs, TracefsOps};
use super::translation::{EventFilter, TranslationTable};
use crate::domain::types::SessionId;
use crate::output::RecordSink;
use crate::preflight::kernel_supports_buffer_watermark;

const DEFAULT_TICK_PERIOD_MS: u32 = 100;
/// Tick period when every active session also polls the buffer watermark;
/// the tick is never disabled outright as it spreads the read work and
/// keeps metadata scrapes fresh.
const POLL_BACKING_TICK_PERIOD_MS: u32 = 1000;
const MIN_TICK_PERIOD_MS: u32 = 1;
const MAX_TICK_PERIOD_MS: u32 = 1000 * 60;

/// Read at most this many pages per cpu per read task. When the limit is
/// hit the pass reports "not done" and the loop reposts an immediate
/// continuation, letting other tasks run first.
pub const MAX_PAGES_PER_CPU_PER_READ_TICK: usize = 256; // 1 MB per cpu

/// Per-round page budget of the frozen-instance reader.
const FROZEN_MAX_READ_PAGES: usize = 32;

/// Upper bound on one flush; strictly larger than a worst-case read batch.
/// On expiry the flush resolves anyway and the next tick picks up the rest.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollSupport {
    Untested,
    Supported,
    Unsupported,
}

/// Post-pass hook for collaborators that scrape the per-session metadata
/// (seen pids, fds, renamed pids) before it is cleared.
pub trait ControllerObserver {
    fn on_data_written(&mut self, _session: SessionId, _metadata: &SessionMetadata) {}
}

/// Observer that ignores everything.
pub struct NullObserver;

impl ControllerObserver for NullObserver {}

struct TraceSession {
    config: FtraceConfig,
    instance_name: String,
    sink: Box<dyn RecordSink>,
    metadata: SessionMetadata,
    parse_errors: BTreeSet<ParseStatus>,
    /// Per-cpu last-written-event timestamps, carried across read passes.
    bundle_end_timestamps: Vec<u64>,
    diagnostics: SetupDiagnostics,
    started: bool,
}

struct FtraceInstance {
    name: String,
    tracefs: Box<dyn TracefsOps>,
    table: TranslationTable,
    muxer: ConfigMuxer,
    cpu_readers: Vec<CpuReader>,
    started_sessions: Vec<SessionId>,
    buffer_watches_posted: bool,
}

impl FtraceInstance {
    fn new(name: String, tracefs: Box<dyn TracefsOps>, secondary: bool) -> FtraceInstance {
        let table = TranslationTable::build(tracefs.as_ref());
        let predefined = accessible_predefined_tracepoints(tracefs.as_ref());
        let muxer = ConfigMuxer::new(SyscallTable::for_current_arch(), predefined, secondary);
        FtraceInstance {
            name,
            tracefs,
            table,
            muxer,
            cpu_readers: Vec::new(),
            started_sessions: Vec::new(),
            buffer_watches_posted: false,
        }
    }
}

pub struct FtraceController {
    primary: FtraceInstance,
    secondary_instances: HashMap<String, FtraceInstance>,
    sessions: HashMap<SessionId, TraceSession>,
    parsing_mem: ParsingBuffers,
    symbolizer: Box<dyn SymbolResolver>,
    atrace: Box<dyn AtraceRunner>,
    observer: Box<dyn ControllerObserver>,
    buffer_watermark_support: PollSupport,
}

impl FtraceController {
    /// Controller over the mount point guessed from the well-known paths.
    pub fn create(
        atrace: Box<dyn AtraceRunner>,
        symbolizer: Box<dyn SymbolResolver>,
        observer: Box<dyn ControllerObserver>,
    ) -> Result<FtraceController> {
        let tracefs = Tracefs::create_guessing_mount_point("")?;
        Ok(Self::new(Box::new(tracefs), atrace, symbolizer, observer))
    }

    #[must_use]
    pub fn new(
        tracefs: Box<dyn TracefsOps>,
        atrace: Box<dyn AtraceRunner>,
        symbolizer: Box<dyn SymbolResolver>,
        observer: Box<dyn ControllerObserver>,
    ) -> FtraceController {
        FtraceController {
            primary: FtraceInstance::new(String::new(), tracefs, false),
            secondary_instances: HashMap::new(),
            sessions: HashMap::new(),
            parsing_mem: ParsingBuffers::new(),
            symbolizer,
            atrace,
            observer,
            buffer_watermark_support: PollSupport::Untested,
        }
    }

    /// Configure a session: validates the request and mutates tracefs so
    /// the configured state includes it. Returns best-effort diagnostics on
    /// success (unknown events, atrace failures, ...).
    pub fn add_session(
        &mut self,
        id: SessionId,
        config: FtraceConfig,
        sink: Box<dyn RecordSink>,
    ) -> Result<SetupDiagnostics> {
        if self.sessions.contains_key(&id) {
            bail!("session {id} already exists");
        }
        let instance_name = config.instance_name.clone().unwrap_or_default();
        let instance = Self::instance_or_create(
            &mut self.primary,
            &mut self.secondary_instances,
            &instance_name,
        )?;

        let mut diagnostics = SetupDiagnostics::default();
        let mut ctx = MuxerContext {
            tracefs: instance.tracefs.as_ref(),
            table: &mut instance.table,
            atrace: self.atrace.as_mut(),
        };
        instance
            .muxer
            .setup_config(&mut ctx, id, &config, &mut diagnostics)
            .with_context(|| format!("failed to set up {id}"))?;

        self.sessions.insert(
            id,
            TraceSession {
                config,
                instance_name,
                sink,
                metadata: SessionMetadata::new(),
                parse_errors: BTreeSet::new(),
                bundle_end_timestamps: Vec::new(),
                diagnostics: diagnostics.clone(),
                started: false,
            },
        );
        Ok(diagnostics)
    }

    /// Start recording for a configured session. The first started session
    /// of an instance opens the per-cpu pipes and turns tracing on.
    pub fn start_session(&mut self, id: SessionId) -> Result<()> {
        if self.buffer_watermark_support == PollSupport::Untested {
            self.buffer_watermark_support = if kernel_supports_buffer_watermark() {
                PollSupport::Supported
            } else {
                PollSupport::Unsupported
            };
        }
        let poll_supported = self.buffer_watermark_support == PollSupport::Supported;

        let Some(session) = self.sessions.get_mut(&id) else {
            bail!("unknown session {id}");
        };
        if session.started {
            bail!("session {id} already started");
        }
        let instance = match self.secondary_instances.get_mut(&session.instance_name) {
            Some(instance) => instance,
            None => &mut self.primary,
        };

        instance
            .muxer
            .activate_config(instance.tracefs.as_ref(), id)
            .with_context(|| format!("failed to activate {id}"))?;
        session.started = true;

        let num_cpus = instance.tracefs.number_of_cpus();
        session.bundle_end_timestamps = vec![0; num_cpus];

        if instance.started_sessions.is_empty() {
            // Lazily allocate the parsing scratch; with multiple instances
            // it may already be valid.
            self.parsing_mem.allocate_if_needed();
            debug_assert!(instance.cpu_readers.is_empty());
            instance.cpu_readers.reserve(num_cpus);
            for cpu in 0..num_cpus {
                let fd = instance
                    .tracefs
                    .open_pipe_for_cpu(cpu)
                    .with_context(|| format!("failed to open trace pipe for cpu {cpu}"))?;
                instance.cpu_readers.push(CpuReader::new(cpu, fd));
            }
        }
        instance.started_sessions.push(id);

        // Arm watermark wakeups if requested by at least one session and
        // supported by this kernel.
        if poll_supported && !instance.buffer_watches_posted {
            let wants_poll = instance
                .started_sessions
                .iter()
                .filter_map(|sid| self.sessions.get(sid))
                .any(|s| s.config.drain_buffer_percent > 0);
            instance.buffer_watches_posted = wants_poll;
        }
        Ok(())
    }

    /// Remove a session from both sets, restoring tracefs state the other
    /// sessions don't need. Returns the session's sink, or `None` if the id
    /// is unknown. Idempotent and safe at any point after `add_session`.
    pub fn remove_session(&mut self, id: SessionId) -> Option<Box<dyn RecordSink>> {
        let session = self.sessions.remove(&id)?;
        let is_secondary = !session.instance_name.is_empty();
        let instance = match self.secondary_instances.get_mut(&session.instance_name) {
            Some(instance) => instance,
            None => &mut self.primary,
        };

        instance.started_sessions.retain(|sid| *sid != id);
        if instance.started_sessions.is_empty() {
            // Close all pipes before the muxer tears down: kprobe removal
            // and tracer resets require no open readers.
            instance.cpu_readers.clear();
            instance.buffer_watches_posted = false;
        }

        let mut ctx = MuxerContext {
            tracefs: instance.tracefs.as_ref(),
            table: &mut instance.table,
            atrace: self.atrace.as_mut(),
        };
        instance.muxer.remove_config(&mut ctx, id);

        if instance.started_sessions.is_empty() {
            instance.muxer.reset_current_tracer(instance.tracefs.as_ref());
        }

        if is_secondary && instance.muxer.session_count() == 0 {
            self.secondary_instances.remove(&session.instance_name);
        }
        Some(session.sink)
    }

    #[must_use]
    pub fn session_diagnostics(&self, id: SessionId) -> Option<&SetupDiagnostics> {
        self.sessions.get(&id).map(|s| &s.diagnostics)
    }

    #[must_use]
    pub fn started_session_count(&self) -> usize {
        self.sessions.values().filter(|s| s.started).count()
    }

    /// One pass over every instance's cpu buffers. Returns true when all
    /// cpus were fully drained (false means an immediate continuation is
    /// warranted).
    pub fn read_tick(&mut self) -> bool {
        let mut all_cpus_done = true;
        all_cpus_done &= Self::read_pass_for_instance(
            &mut self.primary,
            &mut self.sessions,
            &mut self.parsing_mem,
            self.symbolizer.as_mut(),
            MAX_PAGES_PER_CPU_PER_READ_TICK,
        );
        for instance in self.secondary_instances.values_mut() {
            all_cpus_done &= Self::read_pass_for_instance(
                instance,
                &mut self.sessions,
                &mut self.parsing_mem,
                self.symbolizer.as_mut(),
                MAX_PAGES_PER_CPU_PER_READ_TICK,
            );
        }

        // Let collaborators scrape the per-session metadata, then reset it.
        // The symbol interning state restarts with it, which is what makes
        // the incremental-state-cleared marker correct per pass.
        for (id, session) in &mut self.sessions {
            if session.started {
                self.observer.on_data_written(*id, &session.metadata);
                session.metadata.clear();
            }
        }
        all_cpus_done
    }

    /// Drain as much as possible within `timeout`, then flush every sink.
    /// Undrained data is picked up by the next tick.
    pub fn flush(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let mut all_done = true;
            let max_pages = self.primary.muxer.per_cpu_buffer_size_pages();
            all_done &= Self::read_pass_for_instance(
                &mut self.primary,
                &mut self.sessions,
                &mut self.parsing_mem,
                self.symbolizer.as_mut(),
                max_pages,
            );
            for instance in self.secondary_instances.values_mut() {
                let max_pages = instance.muxer.per_cpu_buffer_size_pages();
                all_done &= Self::read_pass_for_instance(
                    instance,
                    &mut self.sessions,
                    &mut self.parsing_mem,
                    self.symbolizer.as_mut(),
                    max_pages,
                );
            }
            if all_done || Instant::now() >= deadline {
                if Instant::now() >= deadline {
                    warn!("flush timed out with undrained cpu buffers");
                }
                break;
            }
        }
        for session in self.sessions.values_mut() {
            session.sink.flush();
        }
    }

    /// Current periodic drain interval: the minimum of the started
    /// sessions' requested periods, or a default (slower when every session
    /// also uses watermark polling).
    #[must_use]
    pub fn tick_period_ms(&self) -> u32 {
        if self.sessions.is_empty() {
            return DEFAULT_TICK_PERIOD_MS;
        }
        let mut using_poll = self.buffer_watermark_support == PollSupport::Supported;
        using_poll &= self.primary.started_sessions.is_empty()
            || self.primary.buffer_watches_posted;
        for instance in self.secondary_instances.values() {
            using_poll &= instance.started_sessions.is_empty() || instance.buffer_watches_posted;
        }

        let min_period = self
            .sessions
            .values()
            .filter(|s| s.started && s.config.drain_period_ms > 0)
            .map(|s| s.config.drain_period_ms)
            .min();
        let Some(period) = min_period else {
            return if using_poll { POLL_BACKING_TICK_PERIOD_MS } else { DEFAULT_TICK_PERIOD_MS };
        };
        if !(MIN_TICK_PERIOD_MS..=MAX_TICK_PERIOD_MS).contains(&period) {
            info!("drain_period_ms {period} out of range, using default");
            return DEFAULT_TICK_PERIOD_MS;
        }
        period
    }

    /// Raw pipe fds carrying watermark wakeups, across all instances.
    #[must_use]
    pub fn watermark_fds(&self) -> Vec<RawFd> {
        let mut fds = Vec::new();
        let instances =
            std::iter::once(&self.primary).chain(self.secondary_instances.values());
        for instance in instances {
            if instance.buffer_watches_posted {
                fds.extend(instance.cpu_readers.iter().map(CpuReader::raw_buffer_fd));
            }
        }
        fds
    }

    /// Cooperative main loop: periodic ticks, immediate continuations while
    /// buffers have backlog, and watermark wakeups where armed. Runs until
    /// the surrounding future is dropped.
    pub async fn run(&mut self) {
        loop {
            let all_done = self.read_tick();
            if !all_done {
                // Budget hit on some cpu: yield, then continue immediately.
                tokio::task::yield_now().await;
                continue;
            }
            let period = u64::from(self.tick_period_ms());
            let delay_ms = period - (now_wall_ms() % period);
            let watch_fds = self.watermark_fds();
            if watch_fds.is_empty() {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                continue;
            }

            let timeout = delay_ms.min(i64::from(i32::MAX) as u64) as i32;
            let woke =
                tokio::task::spawn_blocking(move || poll_readable(&watch_fds, timeout))
                    .await
                    .unwrap_or(false);
            if woke {
                // Zero-timeout re-poll: skip the pass if every buffer has
                // already dropped below the watermark again.
                let fds = self.watermark_fds();
                if !poll_readable(&fds, 0) {
                    continue;
                }
            }
        }
    }

    fn instance_or_create<'a>(
        primary: &'a mut FtraceInstance,
        secondary_instances: &'a mut HashMap<String, FtraceInstance>,
        name: &str,
    ) -> Result<&'a mut FtraceInstance> {
        if name.is_empty() {
            return Ok(primary);
        }
        if name.contains('/') || name.starts_with("..") {
            bail!("invalid tracefs instance name '{name}'");
        }
        match secondary_instances.entry(name.to_string()) {
            std::collections::hash_map::Entry::Occupied(entry) => Ok(entry.into_mut()),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let root = primary.tracefs.root_path().join(format!("instances/{name}/"));
                let tracefs = Tracefs::create(root)
                    .with_context(|| format!("no tracefs instance named '{name}'"))?;
                Ok(entry
                    .insert(FtraceInstance::new(name.to_string(), Box::new(tracefs), true)))
            }
        }
    }

    fn read_pass_for_instance(
        instance: &mut FtraceInstance,
        sessions: &mut HashMap<SessionId, TraceSession>,
        parsing_mem: &mut ParsingBuffers,
        symbolizer: &mut dyn SymbolResolver,
        max_pages: usize,
    ) -> bool {
        if instance.started_sessions.is_empty() {
            return true;
        }
        let clock = instance.muxer.trace_clock();
        let clock_snapshot = snapshot_clock_if_not_boot(instance.tracefs.as_ref(), clock);

        let mut all_cpus_done = true;
        for cpu in 0..instance.cpu_readers.len() {
            let mut targets: Vec<SessionTarget> = Vec::new();
            for (id, session) in sessions.iter_mut() {
                if !session.started || session.instance_name != instance.name {
                    continue;
                }
                let Some(parsing_config) = instance.muxer.data_source_config(*id) else {
                    continue;
                };
                targets.push(SessionTarget {
                    parsing_config,
                    sink: session.sink.as_mut(),
                    metadata: &mut session.metadata,
                    parse_errors: &mut session.parse_errors,
                    bundle_end_timestamp: &mut session.bundle_end_timestamps[cpu],
                });
            }
            let pages_read = instance.cpu_readers[cpu].read_cycle(
                parsing_mem,
                max_pages,
                &instance.table,
                clock,
                clock_snapshot,
                symbolizer,
                &mut targets,
            );
            if pages_read >= max_pages {
                all_cpus_done = false;
            }
        }
        all_cpus_done
    }
}

/// Reader for a stopped secondary instance whose ring buffers were
/// preserved across a reboot or a paused trace: drains the pre-existing
/// pages once, bracketed by start/end stats records, and clears the
/// instance's buffers when dropped.
pub struct FrozenInstanceReader {
    tracefs: Box<dyn TracefsOps>,
    table: TranslationTable,
    parsing_config: DataSourceConfig,
    cpu_readers: Vec<CpuReader>,
    cpu_page_quota: Vec<usize>,
    metadata: SessionMetadata,
    parse_errors: BTreeSet<ParseStatus>,
    bundle_end_timestamps: Vec<u64>,
    parsing_mem: ParsingBuffers,
}

impl FrozenInstanceReader {
    pub fn create(instance_name: &str) -> Result<FrozenInstanceReader> {
        if instance_name.contains('/') || instance_name.starts_with("..") {
            bail!("invalid tracefs instance name '{instance_name}'");
        }
        let tracefs =
            Tracefs::create_guessing_mount_point(&format!("instances/{instance_name}/"))?;
        Self::new(Box::new(tracefs))
    }

    pub fn new(tracefs: Box<dyn TracefsOps>) -> Result<FrozenInstanceReader> {
        let table = TranslationTable::build(tracefs.as_ref());

        // The previous boot may have recorded anything; enable every event
        // the table knows how to decode.
        let mut event_filter = EventFilter::new();
        for event in table.events() {
            event_filter.add_enabled_event(usize::from(event.ftrace_event_id));
        }
        let parsing_config = DataSourceConfig {
            event_filter,
            syscall_filter: EventFilter::new(),
            compact_sched: CompactSchedConfig { enabled: false },
            print_filter: None,
            atrace_apps: Vec::new(),
            atrace_categories: Vec::new(),
            atrace_categories_sdk_optout: Vec::new(),
            symbolize_ksyms: false,
            buffer_percent: 0,
            syscalls_returning_fd: BTreeSet::new(),
            kprobes: HashMap::new(),
            debug_ftrace_abi: false,
            write_generic_evt_descriptors: false,
        };

        // Assumes the same core count as when the buffer was written; on a
        // mismatch the page validation reports the damage per cpu.
        let num_cpus = tracefs.number_of_cpus();
        // Bound reads by the buffer size so a live writer can't keep the
        // drain alive forever.
        let page_quota = tracefs.cpu_buffer_size_pages();

        let mut cpu_readers = Vec::with_capacity(num_cpus);
        for cpu in 0..num_cpus {
            let fd = tracefs
                .open_pipe_for_cpu(cpu)
                .with_context(|| format!("failed to open trace pipe for cpu {cpu}"))?;
            cpu_readers.push(CpuReader::new(cpu, fd));
        }

        Ok(FrozenInstanceReader {
            tracefs,
            table,
            parsing_config,
            cpu_readers,
            cpu_page_quota: vec![page_quota; num_cpus],
            metadata: SessionMetadata::new(),
            parse_errors: BTreeSet::new(),
            bundle_end_timestamps: vec![0; num_cpus],
            parsing_mem: ParsingBuffers::new(),
        })
    }

    /// Drain every cpu until all return short reads or exhaust their page
    /// quota, emitting a start-of-trace stats record first and an
    /// end-of-trace record (with collected parse errors) last.
    pub fn drain(&mut self, sink: &mut dyn RecordSink) {
        sink.stats(StatsRecord {
            phase: Some(TracePhase::StartOfTrace),
            preserve_ftrace_buffer: true,
            cpu_stats: Vec::new(),
            parse_errors: Vec::new(),
        });

        let mut symbolizer = super::symbolizer::NullSymbolizer;
        loop {
            let mut all_cpus_done = true;
            for cpu in 0..self.cpu_readers.len() {
                let max_pages = FROZEN_MAX_READ_PAGES.min(self.cpu_page_quota[cpu]);
                if max_pages == 0 {
                    continue;
                }
                let mut session = SessionTarget {
                    parsing_config: &self.parsing_config,
                    sink: &mut *sink,
                    metadata: &mut self.metadata,
                    parse_errors: &mut self.parse_errors,
                    bundle_end_timestamp: &mut self.bundle_end_timestamps[cpu],
                };
                let pages_read = self.cpu_readers[cpu].read_frozen(
                    &mut self.parsing_mem,
                    max_pages,
                    &self.table,
                    &mut symbolizer,
                    &mut session,
                );
                if pages_read != 0 {
                    all_cpus_done = false;
                }
                self.cpu_page_quota[cpu] -= pages_read;
            }
            if all_cpus_done {
                break;
            }
        }

        let cpu_stats = (0..self.cpu_readers.len())
            .filter_map(|cpu| self.tracefs.read_cpu_stats(cpu))
            .collect();
        sink.stats(StatsRecord {
            phase: Some(TracePhase::EndOfTrace),
            preserve_ftrace_buffer: false,
            cpu_stats,
            parse_errors: self.parse_errors.iter().copied().collect(),
        });
    }
}

impl Drop for FrozenInstanceReader {
    fn drop(&mut self) {
        // The drained data must not be recovered on the next boot.
        self.cpu_readers.clear();
        self.tracefs.clear_trace();
    }
}

fn now_wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Snapshot pair for converting a non-boot ftrace clock back to boot time:
/// the instance's own "now" from cpu0's stats file, and CLOCK_BOOTTIME.
fn snapshot_clock_if_not_boot(
    tracefs: &dyn TracefsOps,
    clock: TraceClock,
) -> Option<ClockSnapshot> {
    if clock == TraceClock::Boot {
        return None;
    }
    let stats = tracefs.read_cpu_stats(0)?;
    let ftrace_clock_ts = (stats.now_ts * 1e9) as i64;
    Some(ClockSnapshot { ftrace_clock_ts, boot_clock_ts: boot_time_ns() })
}

#[allow(unsafe_code)] // clock_gettime requires unsafe
fn boot_time_ns() -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    let res = unsafe { libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts) };
    if res != 0 {
        return 0;
    }
    (ts.tv_sec as i64) * 1_000_000_000 + (ts.tv_nsec as i64)
}

/// poll(2) over the given fds; true when at least one is readable. Poll
/// errors on individual fds (e.g. offlined cores) don't count, the readers
/// handle those on the read path.
#[allow(unsafe_code)] // poll requires unsafe
#[must_use]
pub fn poll_readable(fds: &[RawFd], timeout_ms: i32) -> bool {
    if fds.is_empty() {
        return false;
    }
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|fd| libc::pollfd { fd: *fd, events: libc::POLLIN, revents: 0 })
        .collect();
    let res = loop {
        let res = unsafe {
            libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
        };
        if res >= 0 {
            break res;
        }
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::EINTR) {
            debug!("poll failed: {errno}");
            return false;
        }
    };
    if res == 0 {
        return false;
    }
    pollfds.iter().any(|p| p.revents & libc::POLLIN != 0)
}
