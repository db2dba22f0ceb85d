//! Config muxer: the single writer to tracefs
//!
//! Ftrace is one bunch of globally modifiable persistent state; given a
//! number of session configs we need the best union of all the settings that
//! makes everyone happy, while watching out for anybody else messing with
//! the same files. `setup_config` makes a best effort attempt to mutate
//! tracefs to honor a request without regressing sessions already in
//! progress; `remove_config` unwinds exactly the parts no remaining session
//! needs, and the last remover restores the pre-tracing state.

use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use probes_common::{KprobeType, TraceClock};

use super::atrace::AtraceRunner;
use super::compact_sched::CompactSchedConfig;
use super::config::{
    is_valid_kprobe_name, is_valid_tracefs_option_name, split_group_and_name, FtraceConfig,
    KprobeKind,
};
use super::print_filter::PrintFilterBinding;
use super::syscalls::{SyscallTable, ALL_SYSCALLS_ID};
use super::tracefs::{sys_page_size, TracefsOps};
use super::translation::{Event, EventFilter, TranslationTable};
use crate::domain::errors::SetupError;
use crate::domain::types::{GroupAndName, SessionId};

/// Groups under which the muxer installs dynamic probes; reserved, so user
/// event requests cannot collide with them.
pub const KPROBE_GROUP: &str = "probes_kprobe";
pub const KRETPROBE_GROUP: &str = "probes_kretprobe";

const DEFAULT_LOW_RAM_PER_CPU_BUFFER_SIZE_KB: u64 = 2 * (1 << 10); // 2mb
const DEFAULT_HIGH_RAM_PER_CPU_BUFFER_SIZE_KB: u64 = 8 * (1 << 10); // 8mb

/// Threshold for physical ram size used when deciding on default kernel
/// buffer sizes. We want to detect 8 GB, but the size reported through
/// sysconf is usually lower.
const HIGH_MEM_BYTES: u64 = 7 * (1 << 30); // 7gb

/// Default kernel wakeup watermark restored on teardown.
const DEFAULT_BUFFER_PERCENT: u32 = 50;

/// Trace clocks in preference order.
const CLOCKS: &[(&str, TraceClock)] = &[
    ("boot", TraceClock::Boot),
    ("global", TraceClock::Global),
    ("local", TraceClock::Local),
];

/// Optional monotonic raw clock, enabled via `use_monotonic_raw_clock`.
const CLOCK_MONO_RAW: &str = "mono_raw";

/// Best-effort problems hit during setup, reported to the owning session and
/// carried into its first output bundle.
#[derive(Debug, Default, Clone)]
pub struct SetupDiagnostics {
    pub failed_ftrace_events: Vec<String>,
    pub unknown_ftrace_events: Vec<String>,
    pub atrace_errors: Vec<String>,
}

impl SetupDiagnostics {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failed_ftrace_events.is_empty()
            && self.unknown_ftrace_events.is_empty()
            && self.atrace_errors.is_empty()
    }
}

/// State the muxer derives per session, used by the readers to parse ftrace
/// according to that session's config. Written during setup/remove only;
/// readers observe it read-only while the session is active.
#[derive(Debug)]
pub struct DataSourceConfig {
    /// Quickly answers "is kernel event id x enabled for this session".
    pub event_filter: EventFilter,
    /// Syscall ids enabled for this session; an empty filter with the
    /// all-syscalls sentinel set means every syscall.
    pub syscall_filter: EventFilter,
    pub compact_sched: CompactSchedConfig,
    /// Filters `ftrace/print` events on the content of their `buf` field.
    pub print_filter: Option<PrintFilterBinding>,
    pub atrace_apps: Vec<String>,
    pub atrace_categories: Vec<String>,
    pub atrace_categories_sdk_optout: Vec<String>,
    pub symbolize_ksyms: bool,
    /// `drain_buffer_percent` for poll-based reads; zero if unset.
    pub buffer_percent: u32,
    /// Syscall numbers to scan for new file descriptors.
    pub syscalls_returning_fd: BTreeSet<i64>,
    /// Keyed by kernel event id.
    pub kprobes: HashMap<u16, KprobeType>,
    /// Serialize raw ring buffer pages alongside ABI errors.
    pub debug_ftrace_abi: bool,
    /// Use the self-describing encoding for generic events.
    pub write_generic_evt_descriptors: bool,
}

/// Central cache of what we last wrote into tracefs. Mirrors the on-disk
/// state modulo best-effort restoration on teardown.
#[derive(Debug, Default)]
struct FtraceState {
    ftrace_events: EventFilter,
    /// Syscall ids, or the all-syscalls sentinel.
    syscall_filter: BTreeSet<usize>,
    /// current_tracer == "function_graph".
    funcgraph_on: bool,
    /// Any exclusive single-tenant feature active.
    exclusive_feature_active: bool,
    cpu_buffer_size_pages: usize,
    trace_clock: TraceClock,
    atrace_on: bool,
    atrace_apps: Vec<String>,
    atrace_categories: Vec<String>,
    atrace_categories_prefer_sdk: Vec<String>,
    saved_tracing_on: bool,
    installed_kprobes: BTreeSet<GroupAndName>,
    /// Option values before tracing started; there is no "default" for
    /// tracefs options, so the originals are restored on teardown.
    saved_tracefs_options: HashMap<String, bool>,
    saved_tracing_cpumask: Option<String>,
}

/// Borrowed collaborators for muxer operations: the instance's tracefs and
/// translation table, and the process-wide atrace runner.
pub struct MuxerContext<'a> {
    pub tracefs: &'a dyn TracefsOps,
    pub table: &'a mut TranslationTable,
    pub atrace: &'a mut dyn AtraceRunner,
}

pub struct ConfigMuxer {
    syscalls: SyscallTable,
    current_state: FtraceState,
    /// All configured sessions with their derived state. Not necessarily
    /// active: a configured-but-inactive session has buffer sizes and events
    /// set up, but tracing_on untouched.
    ds_configs: BTreeMap<SessionId, DataSourceConfig>,
    /// Subset of configured sessions currently recording. Ftrace is enabled
    /// iff this is non-empty.
    active_configs: BTreeSet<SessionId>,
    predefined_events: HashMap<String, Vec<GroupAndName>>,
    /// Secondary instances only support plain event recording; global
    /// features (atrace) are rejected.
    secondary_instance: bool,
}

impl ConfigMuxer {
    #[must_use]
    pub fn new(
        syscalls: SyscallTable,
        predefined_events: HashMap<String, Vec<GroupAndName>>,
        secondary_instance: bool,
    ) -> ConfigMuxer {
        ConfigMuxer {
            syscalls,
            current_state: FtraceState::default(),
            ds_configs: BTreeMap::new(),
            active_configs: BTreeSet::new(),
            predefined_events,
            secondary_instance,
        }
    }

    /// Mutate tracefs so that the configured (but not yet recording) state
    /// includes this session. Early exits do not undo prior mutations;
    /// callers needing atomicity must not share the instance.
    pub fn setup_config(
        &mut self,
        ctx: &mut MuxerContext,
        id: SessionId,
        request: &FtraceConfig,
        errors: &mut SetupDiagnostics,
    ) -> Result<(), SetupError> {
        if self.ds_configs.contains_key(&id) {
            return Err(SetupError::DuplicateSession(id));
        }
        let tracefs = ctx.tracefs;
        let config_has_exclusive_features = request.has_exclusive_features();

        if self.ds_configs.is_empty() {
            // If someone outside of us is using a non-nop tracer, yield.
            // This is the only notion of "in use" we can realistically
            // check for.
            if !request.preserve_ftrace_buffer && !tracefs.is_tracing_available() {
                error!(
                    "ftrace in use by another tracer in {}; current_tracer is not nop",
                    tracefs.root_path().display()
                );
                return Err(SetupError::TracingInUse);
            }

            // Clear tracefs state, remembering which value of tracing_on to
            // restore after we're done (the rest is not restored).
            self.current_state.saved_tracing_on = tracefs.tracing_on();
            if !request.preserve_ftrace_buffer {
                tracefs.set_tracing_on(false);
                tracefs.disable_all_events();
                tracefs.clear_trace();

                self.setup_clock(tracefs, request);
                self.setup_buffer_size(tracefs, request);
            } else {
                // Keeping the existing ring buffer contents: changing the
                // clock or buffer sizes would drop the pre-trace data.
                self.remember_active_clock(tracefs);
            }
        } else {
            if config_has_exclusive_features {
                error!("attempted to start a session with exclusive features while another session was active");
                return Err(SetupError::ExclusiveFeatureConflict);
            }
            if self.current_state.exclusive_feature_active {
                error!("attempted to start a session while a session with exclusive features was active");
                return Err(SetupError::ExclusiveFeatureConflict);
            }
        }

        if !request.tids_to_trace.is_empty() {
            let tids: Vec<String> =
                request.tids_to_trace.iter().map(ToString::to_string).collect();
            if !tracefs.set_event_tid_filter(&tids) {
                return Err(SetupError::EventTidFilter);
            }
        }

        if !request.tracefs_options.is_empty() {
            let mut saved_options = HashMap::new();
            for option in &request.tracefs_options {
                let Some(new_state) = option.state else { continue };
                if !is_valid_tracefs_option_name(&option.name) {
                    return Err(SetupError::InvalidTracefsOption(option.name.clone()));
                }
                let Some(old_state) = tracefs.tracefs_option(&option.name) else {
                    return Err(SetupError::UnknownTracefsOption(option.name.clone()));
                };
                saved_options.insert(option.name.clone(), old_state);
                if !tracefs.set_tracefs_option(&option.name, new_state) {
                    return Err(SetupError::UnknownTracefsOption(option.name.clone()));
                }
            }
            self.current_state.saved_tracefs_options = saved_options;
        }

        if !request.tracing_cpumask.is_empty() {
            let Some(saved) = tracefs.tracing_cpumask() else {
                return Err(SetupError::TracingCpuMask(request.tracing_cpumask.clone()));
            };
            if !tracefs.set_tracing_cpumask(&request.tracing_cpumask) {
                return Err(SetupError::TracingCpuMask(request.tracing_cpumask.clone()));
            }
            self.current_state.saved_tracing_cpumask = Some(saved);
        }

        self.current_state.exclusive_feature_active = config_has_exclusive_features;

        let events = self.resolve_requested_events(tracefs, ctx.table, request);

        if request.requires_atrace() {
            if self.secondary_instance {
                return Err(SetupError::AtraceOnSecondaryInstance);
            }
            if !ctx.atrace.supports_userspace_only() && !self.ds_configs.is_empty() {
                error!("concurrent atrace sessions need --only_userspace support");
                return Err(SetupError::ConcurrentAtraceUnsupported);
            }
            self.update_atrace(ctx.atrace, request, errors);
        }

        // Set up and enable kprobe events.
        let mut filter = EventFilter::new();
        let mut kprobes: HashMap<u16, KprobeType> = HashMap::new();
        for (group_and_name, kprobe_type) in kprobe_events_of(request) {
            if !is_valid_kprobe_name(&group_and_name.name) {
                warn!("invalid kprobe event {}", group_and_name.name);
                errors.failed_ftrace_events.push(group_and_name.to_string());
                continue;
            }
            let is_retprobe = group_and_name.group == KRETPROBE_GROUP;
            if !tracefs.create_kprobe_event(
                &group_and_name.group,
                &group_and_name.name,
                is_retprobe,
            ) {
                warn!("failed creation of kprobe event {}", group_and_name.name);
                errors.failed_ftrace_events.push(group_and_name.to_string());
                continue;
            }
            let Some(event_id) = ctx.table.create_kprobe_event(tracefs, &group_and_name) else {
                tracefs.remove_kprobe_event(&group_and_name.group, &group_and_name.name);
                warn!("can't enable kprobe {group_and_name}");
                errors.unknown_ftrace_events.push(group_and_name.to_string());
                continue;
            };
            self.current_state.installed_kprobes.insert(group_and_name.clone());
            let Some(event) = ctx.table.event_by_id(event_id).cloned() else {
                continue;
            };
            self.enable_ftrace_event(tracefs, &event, &mut filter, errors);
            kprobes.insert(event_id, kprobe_type);
        }

        // Enable regular ftrace events.
        for group_and_name in &events {
            // The kprobe groups are reserved.
            if group_and_name.group == KPROBE_GROUP || group_and_name.group == KRETPROBE_GROUP {
                continue;
            }

            let mut event_id =
                ctx.table.event(group_and_name).map(|event| event.ftrace_event_id);
            if event_id.is_none() {
                // Neither known at compile time nor already created: make a
                // generic entry with a self-describing schema.
                event_id = ctx.table.create_generic_event(tracefs, group_and_name);
            }
            let Some(event) = event_id.and_then(|eid| ctx.table.event_by_id(eid)) else {
                debug!("can't enable {group_and_name}, event not known");
                errors.unknown_ftrace_events.push(group_and_name.to_string());
                continue;
            };
            // Niche option to skip generic events (the created entry still
            // distinguishes skipped from unknown).
            if request.disable_generic_events
                && TranslationTable::is_generic_event_output_id(event.output_id)
            {
                errors.failed_ftrace_events.push(group_and_name.to_string());
                continue;
            }
            let event = event.clone();
            self.enable_ftrace_event(tracefs, &event, &mut filter, errors);
        }

        // Syscall tracing via the kernel-filtered raw_syscalls tracepoints.
        let syscall_filter = self.build_syscall_filter(ctx.table, &filter, request);
        if !self.set_syscall_event_filter(tracefs, &syscall_filter) {
            error!("failed to set raw_syscalls filter");
            return Err(SetupError::SyscallFilter);
        }

        // Kernel function tracing. There is no cleanup in remove_config:
        // tracers cannot be changed while tracing pipes are open, so the
        // controller calls reset_current_tracer once all readers are gone.
        // Filters are collated statefully by the kernel (append, not set):
        // concurrent funcgraph sessions see the union of enabled functions,
        // and functions are never removed mid-trace.
        if request.enable_function_graph {
            if !self.current_state.funcgraph_on && !tracefs.clear_function_filters() {
                return Err(SetupError::FunctionGraph { file: "set_ftrace_filter" });
            }
            if !self.current_state.funcgraph_on && !tracefs.clear_function_graph_filters() {
                return Err(SetupError::FunctionGraph { file: "set_graph_function" });
            }
            if !self.current_state.funcgraph_on && !tracefs.clear_max_graph_depth() {
                return Err(SetupError::FunctionGraph { file: "max_graph_depth" });
            }
            if !tracefs.append_function_filters(&request.function_filters) {
                return Err(SetupError::FunctionGraph { file: "set_ftrace_filter" });
            }
            if !tracefs.append_function_graph_filters(&request.function_graph_roots) {
                return Err(SetupError::FunctionGraph { file: "set_graph_function" });
            }
            if request.function_graph_max_depth > 0
                && !tracefs.set_max_graph_depth(request.function_graph_max_depth)
            {
                return Err(SetupError::FunctionGraph { file: "max_graph_depth" });
            }
            if !self.current_state.funcgraph_on
                && !tracefs.set_current_tracer("function_graph")
            {
                info!("cannot enable function_graph: a concurrent session is using a different tracer");
                return Err(SetupError::TracerConflict);
            }
            self.current_state.funcgraph_on = true;
        }

        let compact_format = ctx.table.compact_sched_format();
        let compact_sched = CompactSchedConfig {
            enabled: request.compact_sched
                && compact_format.format_valid
                && filter.is_event_enabled(usize::from(compact_format.sched_switch.event_id)),
        };
        if request.compact_sched && !compact_format.format_valid {
            errors
                .failed_ftrace_events
                .push("compact_sched (unexpected sched event format)".to_string());
        }

        let print_filter = request.print_filter.as_ref().and_then(|config| {
            let binding = PrintFilterBinding::create(config, ctx.table);
            if binding.is_none() {
                errors
                    .failed_ftrace_events
                    .push("ftrace/print (unexpected format for filtering)".to_string());
            }
            binding
        });

        let categories_sdk_optout =
            subtract(&request.atrace_categories, &request.atrace_categories_prefer_sdk);
        self.ds_configs.insert(
            id,
            DataSourceConfig {
                event_filter: filter,
                syscall_filter,
                compact_sched,
                print_filter,
                atrace_apps: request.atrace_apps.clone(),
                atrace_categories: request.atrace_categories.clone(),
                atrace_categories_sdk_optout: categories_sdk_optout,
                symbolize_ksyms: request.symbolize_ksyms,
                buffer_percent: request.drain_buffer_percent,
                syscalls_returning_fd: self.syscalls.syscalls_returning_fd().into_iter().collect(),
                kprobes,
                debug_ftrace_abi: request.debug_ftrace_abi,
                write_generic_evt_descriptors: request.write_generic_event_descriptors(),
            },
        );
        Ok(())
    }

    /// Add the session to the recording set; the first activation turns the
    /// kernel event writer on.
    pub fn activate_config(
        &mut self,
        tracefs: &dyn TracefsOps,
        id: SessionId,
    ) -> Result<(), SetupError> {
        if !self.ds_configs.contains_key(&id) {
            return Err(SetupError::NotConfigured(id));
        }
        let first_config = self.active_configs.is_empty();
        self.active_configs.insert(id);

        // Pick the lowest buffer_percent across the new set of active
        // configs. Non-critical on failure.
        if !self.update_buffer_percent(tracefs) {
            warn!("invalid drain_buffer_percent or buffer_percent file permissions");
        }

        if first_config && !tracefs.set_tracing_on(true) {
            error!("failed to enable ftrace");
            self.active_configs.remove(&id);
            return Err(SetupError::Io(std::io::Error::other("tracing_on")));
        }
        Ok(())
    }

    /// Remove the session from both sets; returns false if it was never
    /// configured. The last remover tears down all tracefs state.
    pub fn remove_config(&mut self, ctx: &mut MuxerContext, id: SessionId) -> bool {
        if self.ds_configs.remove(&id).is_none() {
            return false;
        }
        let tracefs = ctx.tracefs;

        let mut expected_ftrace_events = EventFilter::new();
        let mut expected_apps = Vec::new();
        let mut expected_categories = Vec::new();
        let mut expected_categories_sdk_optout = Vec::new();
        for config in self.ds_configs.values() {
            expected_ftrace_events.enable_events_from(&config.event_filter);
            expected_apps = union(&expected_apps, &config.atrace_apps);
            expected_categories = union(&expected_categories, &config.atrace_categories);
            expected_categories_sdk_optout =
                union(&expected_categories_sdk_optout, &config.atrace_categories_sdk_optout);
        }
        let expected_categories_prefer_sdk =
            subtract(&expected_categories, &expected_categories_sdk_optout);

        // The leftover unions may include apps/categories we never managed
        // to turn on; aim only for what we actually did.
        let expected_apps = intersect(&self.current_state.atrace_apps, &expected_apps);
        let expected_categories =
            intersect(&self.current_state.atrace_categories, &expected_categories);
        let atrace_changed = self.current_state.atrace_apps.len() != expected_apps.len()
            || self.current_state.atrace_categories.len() != expected_categories.len();
        let atrace_prefer_sdk_changed =
            self.current_state.atrace_categories_prefer_sdk != expected_categories_prefer_sdk;

        if !self.set_syscall_event_filter(tracefs, &EventFilter::new()) {
            error!("failed to set raw_syscalls filter during removal");
        }

        // Disable any events that are enabled but no longer needed by any
        // config.
        for event_id in self.current_state.ftrace_events.enabled_events() {
            if expected_ftrace_events.is_event_enabled(event_id) {
                continue;
            }
            let Some(event) = ctx.table.event_by_id(event_id as u16) else {
                continue;
            };
            if tracefs.disable_event(&event.group, &event.name) {
                self.current_state.ftrace_events.disable_event(event_id);
            }
        }

        if self.active_configs.remove(&id) && self.active_configs.is_empty() {
            // Last active config, though dormant configured ones may remain;
            // nobody is reading, so stop the kernel writer.
            tracefs.set_tracing_on(false);
        }

        self.update_buffer_percent(tracefs);

        // Tear down the rest only when every config is gone.
        if self.ds_configs.is_empty() {
            if tracefs.set_cpu_buffer_size_pages(1) {
                self.current_state.cpu_buffer_size_pages = 1;
            }
            tracefs.set_buffer_percent(DEFAULT_BUFFER_PERCENT);
            tracefs.disable_all_events();
            tracefs.clear_trace();
            tracefs.set_tracing_on(self.current_state.saved_tracing_on);

            // Kprobe cleanup cannot happen while pipes are open: removing a
            // kprobe clears all kernel tracing buffers. The controller has
            // closed all readers by the time the last config is removed.
            for probe in std::mem::take(&mut self.current_state.installed_kprobes) {
                tracefs.remove_kprobe_event(&probe.group, &probe.name);
                ctx.table.remove_event(&probe);
            }

            if self.current_state.exclusive_feature_active {
                tracefs.clear_event_tid_filter();
                if let Some(cpumask) = self.current_state.saved_tracing_cpumask.take() {
                    tracefs.set_tracing_cpumask(&cpumask);
                }
                for (option, value) in
                    std::mem::take(&mut self.current_state.saved_tracefs_options)
                {
                    tracefs.set_tracefs_option(&option, value);
                }
                self.current_state.exclusive_feature_active = false;
            }
        }

        if self.current_state.atrace_on {
            if expected_apps.is_empty() && expected_categories.is_empty() {
                self.disable_atrace(ctx.atrace);
            } else if atrace_changed
                && self
                    .start_atrace(ctx.atrace, &expected_apps, &expected_categories, None)
            {
                self.current_state.atrace_apps = expected_apps;
                self.current_state.atrace_categories = expected_categories;
            }
        }

        if atrace_prefer_sdk_changed
            && self.set_atrace_prefer_sdk(ctx.atrace, &expected_categories_prefer_sdk, None)
        {
            self.current_state.atrace_categories_prefer_sdk = expected_categories_prefer_sdk;
        }

        true
    }

    /// Reset `current_tracer` to nop. Separate from `remove_config` because
    /// it requires all tracing pipes to be closed first, which only the
    /// controller can guarantee.
    pub fn reset_current_tracer(&mut self, tracefs: &dyn TracefsOps) -> bool {
        if !self.current_state.funcgraph_on {
            return true;
        }
        if !tracefs.reset_current_tracer() {
            warn!("failed to reset current_tracer to nop");
            return false;
        }
        self.current_state.funcgraph_on = false;
        if !tracefs.clear_function_filters() {
            warn!("failed to reset set_ftrace_filter");
            return false;
        }
        if !tracefs.clear_function_graph_filters() {
            warn!("failed to reset set_graph_function");
            return false;
        }
        true
    }

    #[must_use]
    pub fn data_source_config(&self, id: SessionId) -> Option<&DataSourceConfig> {
        self.ds_configs.get(&id)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.ds_configs.len()
    }

    #[must_use]
    pub fn active_session_count(&self) -> usize {
        self.active_configs.len()
    }

    /// The per-cpu buffer size as configured by this muxer, without
    /// consulting tracefs. With concurrent sessions the first session's size
    /// wins for all of them.
    #[must_use]
    pub fn per_cpu_buffer_size_pages(&self) -> usize {
        self.current_state.cpu_buffer_size_pages.max(1)
    }

    #[must_use]
    pub fn trace_clock(&self) -> TraceClock {
        self.current_state.trace_clock
    }

    #[cfg(test)]
    pub(crate) fn central_event_filter(&self) -> &EventFilter {
        &self.current_state.ftrace_events
    }

    #[cfg(test)]
    pub(crate) fn syscall_filter_set(&self) -> &BTreeSet<usize> {
        &self.current_state.syscall_filter
    }

    // Resolve the config's requested events into concrete tracepoints:
    // explicit entries (with `group/*` and bare-name forms), implicit events
    // for atrace categories, syscall and funcgraph backing events, and the
    // throttled rss_stat substitution.
    fn resolve_requested_events(
        &self,
        tracefs: &dyn TracefsOps,
        table: &TranslationTable,
        request: &FtraceConfig,
    ) -> BTreeSet<GroupAndName> {
        let mut events = BTreeSet::new();
        for config_value in &request.ftrace_events {
            let (group, name) = split_group_and_name(config_value);
            if name == "*" {
                for event_name in tracefs.event_names_for_group(group) {
                    events.insert(GroupAndName::new(group, event_name));
                }
            } else if group.is_empty() {
                // Find an event with that name and use its group.
                let Some(event) = table.event_by_name(name) else {
                    debug!(
                        "event doesn't exist: {name}; include the group in the config \
                         to record it as a generic event"
                    );
                    continue;
                };
                events.insert(GroupAndName::new(event.group.clone(), event.name.clone()));
            } else {
                events.insert(GroupAndName::new(group, name));
            }
        }

        if request.requires_atrace() {
            events.insert(GroupAndName::new("ftrace", "print"));
        }
        if !request.atrace_userspace_only {
            // Legacy: some atrace categories enable a predefined set of
            // kernel tracepoints, as the original atrace binary did.
            for category in &request.atrace_categories {
                if let Some(predefined) = self.predefined_events.get(category) {
                    events.extend(predefined.iter().cloned());
                }
            }
        }

        // Recording a subset of syscalls -> enable the backing events.
        if !request.syscall_events.is_empty() {
            events.insert(GroupAndName::new("raw_syscalls", "sys_enter"));
            events.insert(GroupAndName::new("raw_syscalls", "sys_exit"));
        }

        // The function_graph tracer emits two builtin ftrace events.
        if request.enable_function_graph {
            events.insert(GroupAndName::new("ftrace", "funcgraph_entry"));
            events.insert(GroupAndName::new("ftrace", "funcgraph_exit"));
        }

        if request.throttle_rss_stat && tracefs.supports_rss_stat_throttled() {
            let plain = GroupAndName::new("kmem", "rss_stat");
            if events.remove(&plain) {
                events.insert(GroupAndName::new("synthetic", "rss_stat_throttled"));
            }
        }

        events
    }

    fn enable_ftrace_event(
        &mut self,
        tracefs: &dyn TracefsOps,
        event: &Event,
        filter: &mut EventFilter,
        errors: &mut SetupDiagnostics,
    ) {
        let event_id = usize::from(event.ftrace_event_id);
        // "ftrace" group events are always implicitly enabled and have no
        // enable file; they are tracked per session only.
        if self.current_state.ftrace_events.is_event_enabled(event_id) || event.group == "ftrace" {
            filter.add_enabled_event(event_id);
            return;
        }
        if tracefs.enable_event(&event.group, &event.name) {
            self.current_state.ftrace_events.add_enabled_event(event_id);
            filter.add_enabled_event(event_id);
        } else {
            debug!("failed to enable {}/{}", event.group, event.name);
            errors.failed_ftrace_events.push(format!("{}/{}", event.group, event.name));
        }
    }

    // Sessions come in three shapes: no raw_syscalls events (empty filter),
    // raw_syscalls with an explicit syscall list, or raw_syscalls with an
    // empty list (the all-syscalls sentinel).
    fn build_syscall_filter(
        &self,
        table: &TranslationTable,
        ftrace_filter: &EventFilter,
        request: &FtraceConfig,
    ) -> EventFilter {
        let mut output = EventFilter::new();
        let has_raw_syscalls = table
            .events_by_group("raw_syscalls")
            .iter()
            .any(|event| ftrace_filter.is_event_enabled(usize::from(event.ftrace_event_id)));
        if !has_raw_syscalls {
            return output;
        }
        if request.syscall_events.is_empty() {
            output.add_enabled_event(ALL_SYSCALLS_ID);
            return output;
        }
        for syscall in &request.syscall_events {
            let Some(id) = self.syscalls.get_by_name(syscall) else {
                warn!("can't enable {syscall}, syscall not known");
                continue;
            };
            output.add_enabled_event(id);
        }
        output
    }

    /// Update the kernel filter to the union across all sessions plus
    /// `extra_syscalls` (the session being set up, whose config isn't in
    /// `ds_configs` yet). No session loses events; concurrent sessions may
    /// see extra ones.
    fn set_syscall_event_filter(
        &mut self,
        tracefs: &dyn TracefsOps,
        extra_syscalls: &EventFilter,
    ) -> bool {
        let mut syscall_filter = EventFilter::new();
        syscall_filter.enable_events_from(extra_syscalls);
        for config in self.ds_configs.values() {
            syscall_filter.enable_events_from(&config.syscall_filter);
        }

        let mut filter_set: BTreeSet<usize> =
            syscall_filter.enabled_events().into_iter().collect();
        if syscall_filter.is_event_enabled(ALL_SYSCALLS_ID) {
            filter_set.clear();
        }

        if self.current_state.syscall_filter != filter_set {
            if !tracefs.set_syscall_filter(&filter_set) {
                return false;
            }
            self.current_state.syscall_filter = filter_set;
        }
        true
    }

    fn setup_clock(&mut self, tracefs: &dyn TracefsOps, request: &FtraceConfig) {
        let clocks = tracefs.available_clocks();
        if request.use_monotonic_raw_clock && clocks.contains(CLOCK_MONO_RAW) {
            tracefs.set_clock(CLOCK_MONO_RAW);
        } else {
            let current_clock = tracefs.clock();
            for (clock, _) in CLOCKS {
                if !clocks.contains(*clock) {
                    continue;
                }
                if current_clock != *clock {
                    tracefs.set_clock(clock);
                }
                break;
            }
        }
        self.remember_active_clock(tracefs);
    }

    fn remember_active_clock(&mut self, tracefs: &dyn TracefsOps) {
        let current_clock = tracefs.clock();
        self.current_state.trace_clock = if current_clock == CLOCK_MONO_RAW {
            TraceClock::MonoRaw
        } else {
            CLOCKS
                .iter()
                .find(|(name, _)| *name == current_clock)
                .map_or(TraceClock::Unknown, |(_, clock)| *clock)
        };
    }

    fn setup_buffer_size(&mut self, tracefs: &dyn TracefsOps, request: &FtraceConfig) {
        let pages = compute_cpu_buffer_size_pages(
            request.buffer_size_kb,
            request.buffer_size_lower_bound,
            phys_ram_pages(),
        );
        tracefs.set_cpu_buffer_size_pages(pages);
        self.current_state.cpu_buffer_size_pages = pages;
    }

    fn update_buffer_percent(&mut self, tracefs: &dyn TracefsOps) -> bool {
        let min_percent = self
            .active_configs
            .iter()
            .filter_map(|id| self.ds_configs.get(id))
            .map(|config| config.buffer_percent)
            .filter(|percent| *percent > 0)
            .min();
        match min_percent {
            // Let the kernel ignore values > 100.
            Some(percent) => tracefs.set_buffer_percent(percent),
            None => true,
        }
    }

    fn update_atrace(
        &mut self,
        atrace: &mut dyn AtraceRunner,
        request: &FtraceConfig,
        errors: &mut SetupDiagnostics,
    ) {
        // Stash the unions in temps and only update current_state on a
        // successful helper run, so a failing atrace doesn't poison the
        // cached state.
        let combined_categories =
            union(&self.current_state.atrace_categories, &request.atrace_categories);
        let combined_apps = union(&self.current_state.atrace_apps, &request.atrace_apps);

        // Each session lists categories preferring the SDK; the rest opt
        // out, and opting out wins across sessions.
        let request_optout =
            subtract(&request.atrace_categories, &request.atrace_categories_prefer_sdk);
        let current_optout = subtract(
            &self.current_state.atrace_categories,
            &self.current_state.atrace_categories_prefer_sdk,
        );
        let combined_optout = union(&current_optout, &request_optout);
        let combined_prefer_sdk = subtract(&combined_categories, &combined_optout);

        if combined_prefer_sdk != self.current_state.atrace_categories_prefer_sdk
            && self.set_atrace_prefer_sdk(atrace, &combined_prefer_sdk, Some(errors))
        {
            self.current_state.atrace_categories_prefer_sdk = combined_prefer_sdk;
        }

        if !self.current_state.atrace_on
            || combined_apps.len() != self.current_state.atrace_apps.len()
            || combined_categories.len() != self.current_state.atrace_categories.len()
        {
            if self.start_atrace(atrace, &combined_apps, &combined_categories, Some(errors)) {
                self.current_state.atrace_categories = combined_categories;
                self.current_state.atrace_apps = combined_apps;
                self.current_state.atrace_on = true;
            }
        }
    }

    fn start_atrace(
        &self,
        atrace: &mut dyn AtraceRunner,
        apps: &[String],
        categories: &[String],
        errors: Option<&mut SetupDiagnostics>,
    ) -> bool {
        debug!("updating atrace config");
        let mut args = vec!["--async_start".to_string()];
        if atrace.supports_userspace_only() {
            args.push("--only_userspace".to_string());
        }
        args.extend(categories.iter().cloned());
        if !apps.is_empty() {
            args.push("-a".to_string());
            args.push(apps.join(","));
        }
        run_atrace(atrace, &args, errors)
    }

    fn set_atrace_prefer_sdk(
        &self,
        atrace: &mut dyn AtraceRunner,
        prefer_sdk_categories: &[String],
        errors: Option<&mut SetupDiagnostics>,
    ) -> bool {
        if !atrace.supports_prefer_sdk() {
            return false;
        }
        debug!("updating atrace prefer sdk categories");
        let mut args = vec!["--prefer_sdk".to_string()];
        args.extend(prefer_sdk_categories.iter().cloned());
        run_atrace(atrace, &args, errors)
    }

    fn disable_atrace(&mut self, atrace: &mut dyn AtraceRunner) {
        debug!("stopping atrace");
        let mut args = vec!["--async_stop".to_string()];
        if atrace.supports_userspace_only() {
            args.push("--only_userspace".to_string());
        }
        if run_atrace(atrace, &args, None) {
            self.current_state.atrace_categories.clear();
            self.current_state.atrace_apps.clear();
            self.current_state.atrace_on = false;
        }
    }
}

fn run_atrace(
    atrace: &mut dyn AtraceRunner,
    args: &[String],
    errors: Option<&mut SetupDiagnostics>,
) -> bool {
    match atrace.run_atrace(args) {
        Ok(()) => true,
        Err(message) => {
            warn!("atrace failed: {message}");
            if let Some(errors) = errors {
                errors.atrace_errors.push(message);
            }
            false
        }
    }
}

fn kprobe_events_of(request: &FtraceConfig) -> Vec<(GroupAndName, KprobeType)> {
    let mut events = Vec::new();
    for kprobe in &request.kprobe_events {
        match kprobe.kind {
            KprobeKind::Kprobe => {
                events.push((GroupAndName::new(KPROBE_GROUP, &kprobe.probe), KprobeType::Instant));
            }
            KprobeKind::Kretprobe => {
                events
                    .push((GroupAndName::new(KRETPROBE_GROUP, &kprobe.probe), KprobeType::Instant));
            }
            KprobeKind::Both => {
                events.push((GroupAndName::new(KPROBE_GROUP, &kprobe.probe), KprobeType::Begin));
                events.push((GroupAndName::new(KRETPROBE_GROUP, &kprobe.probe), KprobeType::End));
            }
        }
    }
    events
}

fn union(a: &[String], b: &[String]) -> Vec<String> {
    let set: BTreeSet<&String> = a.iter().chain(b.iter()).collect();
    set.into_iter().cloned().collect()
}

fn intersect(a: &[String], b: &[String]) -> Vec<String> {
    let b_set: BTreeSet<&String> = b.iter().collect();
    let set: BTreeSet<&String> = a.iter().filter(|s| b_set.contains(s)).collect();
    set.into_iter().cloned().collect()
}

fn subtract(a: &[String], b: &[String]) -> Vec<String> {
    let b_set: BTreeSet<&String> = b.iter().collect();
    let set: BTreeSet<&String> = a.iter().filter(|s| !b_set.contains(s)).collect();
    set.into_iter().cloned().collect()
}

/// Requested size -> concrete page count. Zero requests pick a default by
/// physical RAM size; the result is always at least one page.
#[must_use]
pub fn compute_cpu_buffer_size_pages(
    requested_kb: u64,
    buffer_size_lower_bound: bool,
    phys_ram_pages: i64,
) -> usize {
    let page_kb = (sys_page_size() / 1024) as u64;
    let high_ram = phys_ram_pages > 0
        && phys_ram_pages as u64 >= HIGH_MEM_BYTES / (page_kb * 1024);
    let default_size_kb = if high_ram {
        DEFAULT_HIGH_RAM_PER_CPU_BUFFER_SIZE_KB
    } else {
        DEFAULT_LOW_RAM_PER_CPU_BUFFER_SIZE_KB
    };

    let mut actual_size_kb = requested_kb;
    if requested_kb == 0 || (buffer_size_lower_bound && default_size_kb > requested_kb) {
        actual_size_kb = default_size_kb;
    }

    ((actual_size_kb / page_kb) as usize).max(1)
}

#[allow(unsafe_code)] // sysconf requires unsafe
fn phys_ram_pages() -> i64 {
    unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftrace::atrace::testing::FakeAtrace;
    use crate::ftrace::config::accessible_predefined_tracepoints;
    use crate::ftrace::tracefs::tests::add_fake_event;
    use crate::ftrace::tracefs::Tracefs;
    use crate::ftrace::translation::tests::fake_tracefs_with_events;
    use std::fs;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        tracefs: Tracefs,
        table: TranslationTable,
        atrace: FakeAtrace,
        muxer: ConfigMuxer,
    }

    impl Harness {
        fn new() -> Harness {
            let (dir, tracefs) = fake_tracefs_with_events(2);
            add_fake_event(
                dir.path(),
                "kmem",
                "rss_stat",
                "name: rss_stat\nID: 400\nformat:\n\
                 \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
                 \tfield:int member;\toffset:8;\tsize:4;\tsigned:1;\n\
                 \tfield:long size;\toffset:16;\tsize:8;\tsigned:1;\n",
            );
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
            for evt in ["sys_enter", "sys_exit"] {
                fs::write(dir.path().join(format!("events/raw_syscalls/{evt}/filter")), "")
                    .unwrap();
            }
            let table = TranslationTable::build(&tracefs);
            let predefined = accessible_predefined_tracepoints(&tracefs);
            let muxer = ConfigMuxer::new(SyscallTable::for_current_arch(), predefined, false);
            Harness { dir, tracefs, table, atrace: FakeAtrace::default(), muxer }
        }

        fn setup(
            &mut self,
            id: u64,
            request: &FtraceConfig,
        ) -> (Result<(), SetupError>, SetupDiagnostics) {
            let mut errors = SetupDiagnostics::default();
            let mut ctx = MuxerContext {
                tracefs: &self.tracefs,
                table: &mut self.table,
                atrace: &mut self.atrace,
            };
            let result = self.muxer.setup_config(&mut ctx, SessionId(id), request, &mut errors);
            (result, errors)
        }

        fn remove(&mut self, id: u64) -> bool {
            let mut ctx = MuxerContext {
                tracefs: &self.tracefs,
                table: &mut self.table,
                atrace: &mut self.atrace,
            };
            self.muxer.remove_config(&mut ctx, SessionId(id))
        }

        fn enable_file(&self, group: &str, name: &str) -> String {
            fs::read_to_string(
                self.dir.path().join(format!("events/{group}/{name}/enable")),
            )
            .unwrap_or_default()
        }
    }

    fn switch_config() -> FtraceConfig {
        FtraceConfig {
            ftrace_events: vec!["sched/sched_switch".to_string()],
            ..FtraceConfig::default()
        }
    }

    #[test]
    fn test_setup_enables_requested_event() {
        let mut harness = Harness::new();
        let (result, errors) = harness.setup(1, &switch_config());
        result.unwrap();
        assert!(errors.is_empty());
        assert_eq!(harness.enable_file("sched", "sched_switch"), "1");

        let config = harness.muxer.data_source_config(SessionId(1)).unwrap();
        assert!(config.event_filter.is_event_enabled(316));
        assert!(!config.event_filter.is_event_enabled(320));
    }

    #[test]
    fn test_activation_toggles_tracing_on() {
        let mut harness = Harness::new();
        harness.setup(1, &switch_config()).0.unwrap();
        assert!(!harness.tracefs.tracing_on());

        harness.muxer.activate_config(&harness.tracefs, SessionId(1)).unwrap();
        assert!(harness.tracefs.tracing_on());

        assert!(harness.remove(1));
        assert!(!harness.tracefs.tracing_on());
    }

    #[test]
    fn test_activate_requires_setup() {
        let mut harness = Harness::new();
        let err = harness.muxer.activate_config(&harness.tracefs, SessionId(7));
        assert!(matches!(err, Err(SetupError::NotConfigured(_))));
    }

    #[test]
    fn test_overlapping_sessions_keep_shared_events() {
        let mut harness = Harness::new();
        harness.setup(1, &switch_config()).0.unwrap();
        let config_b = FtraceConfig {
            ftrace_events: vec![
                "sched/sched_switch".to_string(),
                "kmem/rss_stat".to_string(),
            ],
            ..FtraceConfig::default()
        };
        harness.setup(2, &config_b).0.unwrap();
        assert_eq!(harness.enable_file("sched", "sched_switch"), "1");
        assert_eq!(harness.enable_file("kmem", "rss_stat"), "1");

        // Session A's removal must not disable the still-needed event.
        assert!(harness.remove(1));
        assert_eq!(harness.enable_file("sched", "sched_switch"), "1");
        assert!(harness.muxer.central_event_filter().is_event_enabled(316));

        // Last session out restores everything.
        assert!(harness.remove(2));
        assert_eq!(harness.enable_file("sched", "sched_switch"), "0");
        assert_eq!(harness.enable_file("kmem", "rss_stat"), "0");
        assert!(!harness.muxer.central_event_filter().is_event_enabled(316));
        assert_eq!(harness.muxer.per_cpu_buffer_size_pages(), 1);
    }

    #[test]
    fn test_unknown_event_is_reported_not_fatal() {
        let mut harness = Harness::new();
        let config = FtraceConfig {
            ftrace_events: vec!["bogus/not_here".to_string(), "sched/sched_switch".to_string()],
            ..FtraceConfig::default()
        };
        let (result, errors) = harness.setup(1, &config);
        result.unwrap();
        assert_eq!(errors.unknown_ftrace_events, vec!["bogus/not_here".to_string()]);
        assert_eq!(harness.enable_file("sched", "sched_switch"), "1");
    }

    #[test]
    fn test_group_glob_expands() {
        let mut harness = Harness::new();
        let config = FtraceConfig {
            ftrace_events: vec!["sched/*".to_string()],
            ..FtraceConfig::default()
        };
        harness.setup(1, &config).0.unwrap();
        assert_eq!(harness.enable_file("sched", "sched_switch"), "1");
        assert_eq!(harness.enable_file("sched", "sched_waking"), "1");
    }

    #[test]
    fn test_bare_event_name_resolves_group() {
        let mut harness = Harness::new();
        let config = FtraceConfig {
            ftrace_events: vec!["sched_switch".to_string()],
            ..FtraceConfig::default()
        };
        harness.setup(1, &config).0.unwrap();
        assert_eq!(harness.enable_file("sched", "sched_switch"), "1");
    }

    #[test]
    fn test_exclusive_feature_conflicts() {
        let mut harness = Harness::new();
        harness.setup(1, &switch_config()).0.unwrap();

        let exclusive = FtraceConfig {
            tracing_cpumask: "3".to_string(),
            ..switch_config()
        };
        let (result, _) = harness.setup(2, &exclusive);
        assert!(matches!(result, Err(SetupError::ExclusiveFeatureConflict)));

        // And the mirror image: exclusive first, plain second.
        assert!(harness.remove(1));
        harness.setup(3, &exclusive).0.unwrap();
        let (result, _) = harness.setup(4, &switch_config());
        assert!(matches!(result, Err(SetupError::ExclusiveFeatureConflict)));
    }

    #[test]
    fn test_exclusive_state_saved_and_restored() {
        let mut harness = Harness::new();
        fs::write(harness.dir.path().join("options/overwrite"), "1").unwrap();
        let config = FtraceConfig {
            tracing_cpumask: "1".to_string(),
            tracefs_options: vec![crate::ftrace::config::TracefsOption {
                name: "overwrite".to_string(),
                state: Some(false),
            }],
            ..switch_config()
        };
        harness.setup(1, &config).0.unwrap();
        assert_eq!(
            fs::read_to_string(harness.dir.path().join("tracing_cpumask")).unwrap(),
            "1"
        );
        assert_eq!(
            fs::read_to_string(harness.dir.path().join("options/overwrite")).unwrap(),
            "0"
        );

        assert!(harness.remove(1));
        assert_eq!(
            fs::read_to_string(harness.dir.path().join("tracing_cpumask")).unwrap(),
            "f"
        );
        assert_eq!(
            fs::read_to_string(harness.dir.path().join("options/overwrite")).unwrap(),
            "1"
        );
    }

    #[test]
    fn test_invalid_tracefs_option_name_rejected() {
        let mut harness = Harness::new();
        let config = FtraceConfig {
            tracefs_options: vec![crate::ftrace::config::TracefsOption {
                name: "../escape".to_string(),
                state: Some(true),
            }],
            ..FtraceConfig::default()
        };
        let (result, _) = harness.setup(1, &config);
        assert!(matches!(result, Err(SetupError::InvalidTracefsOption(_))));
    }

    #[test]
    fn test_syscall_filter_union_across_sessions() {
        let mut harness = Harness::new();
        let table = SyscallTable::for_current_arch();
        let Some(openat) = table.get_by_name("sys_openat") else {
            return; // arch without a table
        };
        let config_a = FtraceConfig {
            ftrace_events: vec!["raw_syscalls/sys_enter".to_string()],
            syscall_events: vec!["sys_openat".to_string()],
            ..FtraceConfig::default()
        };
        harness.setup(1, &config_a).0.unwrap();
        assert_eq!(
            harness.muxer.syscall_filter_set().iter().copied().collect::<Vec<_>>(),
            vec![openat]
        );

        // A second session recording all syscalls clears the kernel filter.
        let config_b = FtraceConfig {
            ftrace_events: vec!["raw_syscalls/sys_enter".to_string()],
            ..FtraceConfig::default()
        };
        harness.setup(2, &config_b).0.unwrap();
        assert!(harness.muxer.syscall_filter_set().is_empty());

        assert!(harness.remove(2));
        assert_eq!(
            harness.muxer.syscall_filter_set().iter().copied().collect::<Vec<_>>(),
            vec![openat]
        );
        assert!(harness.remove(1));
    }

    #[test]
    fn test_kprobe_lifecycle() {
        let mut harness = Harness::new();
        add_fake_event(
            harness.dir.path(),
            KPROBE_GROUP,
            "do_sys_open",
            "name: do_sys_open\nID: 600\nformat:\n\
             \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
             \tfield:unsigned long __probe_ip;\toffset:8;\tsize:8;\tsigned:0;\n",
        );
        let config = FtraceConfig {
            kprobe_events: vec![crate::ftrace::config::KprobeConfig {
                probe: "do_sys_open".to_string(),
                kind: KprobeKind::Kprobe,
            }],
            ..FtraceConfig::default()
        };
        let (result, errors) = harness.setup(1, &config);
        result.unwrap();
        assert!(errors.is_empty());

        let kprobe_events =
            fs::read_to_string(harness.dir.path().join("kprobe_events")).unwrap();
        assert_eq!(kprobe_events, format!("p:{KPROBE_GROUP}/do_sys_open do_sys_open"));
        let ds = harness.muxer.data_source_config(SessionId(1)).unwrap();
        assert_eq!(ds.kprobes.get(&600), Some(&KprobeType::Instant));
        assert!(harness
            .table
            .event(&GroupAndName::new(KPROBE_GROUP, "do_sys_open"))
            .is_some());

        assert!(harness.remove(1));
        let kprobe_events =
            fs::read_to_string(harness.dir.path().join("kprobe_events")).unwrap();
        assert!(kprobe_events.ends_with(&format!("-:{KPROBE_GROUP}/do_sys_open")));
        assert!(harness
            .table
            .event(&GroupAndName::new(KPROBE_GROUP, "do_sys_open"))
            .is_none());
    }

    #[test]
    fn test_invalid_kprobe_name_is_reported() {
        let mut harness = Harness::new();
        let config = FtraceConfig {
            kprobe_events: vec![crate::ftrace::config::KprobeConfig {
                probe: "bad name".to_string(),
                kind: KprobeKind::Kprobe,
            }],
            ..FtraceConfig::default()
        };
        let (result, errors) = harness.setup(1, &config);
        result.unwrap();
        assert_eq!(errors.failed_ftrace_events.len(), 1);
    }

    #[test]
    fn test_atrace_union_and_stop() {
        let mut harness = Harness::new();
        harness.atrace.userspace_only = true;
        let config_a = FtraceConfig {
            atrace_categories: vec!["gfx".to_string()],
            ..FtraceConfig::default()
        };
        harness.setup(1, &config_a).0.unwrap();
        assert_eq!(harness.atrace.calls.len(), 1);
        assert_eq!(
            harness.atrace.calls[0],
            vec!["--async_start".to_string(), "--only_userspace".to_string(), "gfx".to_string()]
        );

        let config_b = FtraceConfig {
            atrace_categories: vec!["gfx".to_string(), "input".to_string()],
            atrace_apps: vec!["com.example".to_string()],
            ..FtraceConfig::default()
        };
        harness.setup(2, &config_b).0.unwrap();
        let last = harness.atrace.calls.last().unwrap();
        assert!(last.contains(&"input".to_string()));
        assert!(last.contains(&"-a".to_string()));
        assert!(last.contains(&"com.example".to_string()));

        assert!(harness.remove(2));
        // Union shrank back to just gfx.
        let last = harness.atrace.calls.last().unwrap();
        assert_eq!(
            last,
            &vec!["--async_start".to_string(), "--only_userspace".to_string(), "gfx".to_string()]
        );

        assert!(harness.remove(1));
        let last = harness.atrace.calls.last().unwrap();
        assert_eq!(last[0], "--async_stop");
    }

    #[test]
    fn test_atrace_failure_is_diagnostic_not_error() {
        let mut harness = Harness::new();
        harness.atrace.fail = true;
        let config = FtraceConfig {
            atrace_categories: vec!["gfx".to_string()],
            ..FtraceConfig::default()
        };
        let (result, errors) = harness.setup(1, &config);
        result.unwrap();
        assert_eq!(errors.atrace_errors.len(), 1);
    }

    #[test]
    fn test_buffer_size_computation() {
        let page_kb = (sys_page_size() / 1024) as u64;
        // Explicit request is respected.
        assert_eq!(compute_cpu_buffer_size_pages(128, false, 0), (128 / page_kb) as usize);
        // Zero request picks the low-ram default.
        assert_eq!(
            compute_cpu_buffer_size_pages(0, false, 1),
            (DEFAULT_LOW_RAM_PER_CPU_BUFFER_SIZE_KB / page_kb) as usize
        );
        // Lower-bound raises small requests on high-ram machines.
        let high_ram_pages = (8u64 * (1 << 30) / (page_kb * 1024)) as i64;
        assert_eq!(
            compute_cpu_buffer_size_pages(128, true, high_ram_pages),
            (DEFAULT_HIGH_RAM_PER_CPU_BUFFER_SIZE_KB / page_kb) as usize
        );
        // Never below one page.
        assert_eq!(compute_cpu_buffer_size_pages(1, false, 0), 1);
    }

    #[test]
    fn test_tracing_in_use_rejected() {
        let mut harness = Harness::new();
        fs::write(harness.dir.path().join("current_tracer"), "function_graph\n").unwrap();
        let (result, _) = harness.setup(1, &switch_config());
        assert!(matches!(result, Err(SetupError::TracingInUse)));
    }

    #[test]
    fn test_buffer_percent_minimum_of_active() {
        let mut harness = Harness::new();
        let mut config_a = switch_config();
        config_a.drain_buffer_percent = 50;
        let mut config_b = switch_config();
        config_b.drain_buffer_percent = 25;
        harness.setup(1, &config_a).0.unwrap();
        harness.setup(2, &config_b).0.unwrap();
        harness.muxer.activate_config(&harness.tracefs, SessionId(1)).unwrap();
        assert_eq!(harness.tracefs.buffer_percent(), 50);
        harness.muxer.activate_config(&harness.tracefs, SessionId(2)).unwrap();
        assert_eq!(harness.tracefs.buffer_percent(), 25);
    }
}
