//! Per-session ftrace configuration
//!
//! The structured message an external session hands to the muxer. The daemon
//! deserializes these from JSON; embedders can construct them directly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::tracefs::TracefsOps;
use crate::domain::types::GroupAndName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KprobeKind {
    /// Instantaneous probe at function entry.
    Kprobe,
    /// Instantaneous probe at function return.
    Kretprobe,
    /// Entry/return pair, emitted as begin/end records.
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KprobeConfig {
    pub probe: String,
    pub kind: KprobeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracefsOption {
    pub name: String,
    /// `None` leaves the option untouched.
    pub state: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtraceMessageRule {
    /// Message type preceding the pid, e.g. `B` or `C`.
    pub kind: String,
    /// Prefix matched after the `|pid|` part.
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintFilterRule {
    pub allow: bool,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub atrace_msg: Option<AtraceMessageRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrintFilterConfig {
    pub rules: Vec<PrintFilterRule>,
}

/// One session's requested tracing setup. All fields are optional with
/// conservative defaults, so configs stay short.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FtraceConfig {
    /// Events as `group/name`, `group/*` or a bare event name.
    pub ftrace_events: Vec<String>,
    pub atrace_categories: Vec<String>,
    pub atrace_apps: Vec<String>,
    pub atrace_categories_prefer_sdk: Vec<String>,
    /// Suppress the kernel-tracepoint side of atrace categories.
    pub atrace_userspace_only: bool,

    /// Syscall names to record; empty means all syscalls once any
    /// raw_syscalls event is enabled.
    pub syscall_events: Vec<String>,
    pub kprobe_events: Vec<KprobeConfig>,

    pub enable_function_graph: bool,
    pub function_filters: Vec<String>,
    pub function_graph_roots: Vec<String>,
    pub function_graph_max_depth: u32,

    /// Requested per-cpu kernel buffer size; 0 picks a default by RAM size.
    pub buffer_size_kb: u64,
    /// Treat `buffer_size_kb` as a lower bound rather than an exact request.
    pub buffer_size_lower_bound: bool,
    /// How often the readers drain the buffers; 0 picks the default.
    pub drain_period_ms: u32,
    /// Kernel wakeup watermark for poll-based draining; 0 disables.
    pub drain_buffer_percent: u32,

    pub compact_sched: bool,
    pub symbolize_ksyms: bool,
    pub throttle_rss_stat: bool,
    pub disable_generic_events: bool,
    /// Self-describing generic event schemas; defaults on.
    pub denser_generic_event_encoding: Option<bool>,
    pub use_monotonic_raw_clock: bool,
    /// Keep pre-existing buffer contents (frozen/persistent setups).
    pub preserve_ftrace_buffer: bool,
    /// Attach raw page bytes to ABI error records.
    pub debug_ftrace_abi: bool,

    // Exclusive single-tenant features: any of these forbids concurrent
    // sessions on the same instance.
    pub tids_to_trace: Vec<i32>,
    pub tracefs_options: Vec<TracefsOption>,
    pub tracing_cpumask: String,

    pub print_filter: Option<PrintFilterConfig>,

    /// Secondary tracefs instance to record from; `None` is the root.
    pub instance_name: Option<String>,
    /// Output buffer the session's records are routed to.
    pub target_buffer: u32,
}

impl FtraceConfig {
    #[must_use]
    pub fn requires_atrace(&self) -> bool {
        !self.atrace_apps.is_empty() || !self.atrace_categories.is_empty()
    }

    /// See "Exclusive single-tenant features": these knobs mutate state that
    /// cannot be unioned across sessions.
    #[must_use]
    pub fn has_exclusive_features(&self) -> bool {
        !self.tids_to_trace.is_empty()
            || !self.tracefs_options.is_empty()
            || !self.tracing_cpumask.is_empty()
    }

    #[must_use]
    pub fn write_generic_event_descriptors(&self) -> bool {
        self.denser_generic_event_encoding.unwrap_or(true)
    }
}

#[must_use]
pub fn is_valid_kprobe_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[must_use]
pub fn is_valid_tracefs_option_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Split an `ftrace_events` entry into (group, name); the group is empty for
/// bare names.
#[must_use]
pub fn split_group_and_name(event: &str) -> (&str, &str) {
    match event.split_once('/') {
        Some((group, name)) => (group, name),
        None => ("", event),
    }
}

/// Kernel tracepoints implied by the legacy atrace categories. Userspace-only
/// categories (`am`, `view`, ...) map to no tracepoints here; they only need
/// `ftrace/print`, which `requires_atrace` already pulls in.
#[must_use]
pub fn predefined_tracepoints() -> HashMap<String, Vec<GroupAndName>> {
    let gn = GroupAndName::new;
    let mut map = HashMap::new();
    map.insert(
        "sched".to_string(),
        vec![
            gn("sched", "sched_switch"),
            gn("sched", "sched_waking"),
            gn("sched", "sched_wakeup"),
            gn("task", "task_newtask"),
            gn("task", "task_rename"),
        ],
    );
    map.insert(
        "freq".to_string(),
        vec![gn("power", "cpu_frequency"), gn("power", "clock_set_rate")],
    );
    map.insert("idle".to_string(), vec![gn("power", "cpu_idle")]);
    map.insert(
        "memory".to_string(),
        vec![gn("kmem", "rss_stat"), gn("oom", "oom_score_adj_update")],
    );
    map.insert(
        "workq".to_string(),
        vec![
            gn("workqueue", "workqueue_execute_start"),
            gn("workqueue", "workqueue_execute_end"),
        ],
    );
    map
}

/// The predefined map filtered down to tracepoints this kernel actually
/// exposes, determined once at startup by probing the format files.
#[must_use]
pub fn accessible_predefined_tracepoints(
    tracefs: &dyn TracefsOps,
) -> HashMap<String, Vec<GroupAndName>> {
    let mut map = predefined_tracepoints();
    for events in map.values_mut() {
        events.retain(|event| !tracefs.read_event_format(&event.group, &event.name).is_empty());
    }
    map.retain(|_, events| !events.is_empty());
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal_config() {
        let config: FtraceConfig = serde_json::from_str(
            r#"{"ftrace_events": ["sched/sched_switch"], "drain_period_ms": 100}"#,
        )
        .unwrap();
        assert_eq!(config.ftrace_events, vec!["sched/sched_switch"]);
        assert_eq!(config.drain_period_ms, 100);
        assert!(!config.requires_atrace());
        assert!(!config.has_exclusive_features());
        assert!(config.write_generic_event_descriptors());
    }

    #[test]
    fn test_exclusive_features_detection() {
        let mut config = FtraceConfig::default();
        assert!(!config.has_exclusive_features());
        config.tracing_cpumask = "3".to_string();
        assert!(config.has_exclusive_features());

        let mut config = FtraceConfig::default();
        config.tids_to_trace = vec![42];
        assert!(config.has_exclusive_features());
    }

    #[test]
    fn test_kprobe_name_validation() {
        assert!(is_valid_kprobe_name("do_sys_open"));
        assert!(!is_valid_kprobe_name("do sys open"));
        assert!(!is_valid_kprobe_name("rm -rf"));
        assert!(!is_valid_kprobe_name(""));
    }

    #[test]
    fn test_tracefs_option_name_validation() {
        assert!(is_valid_tracefs_option_name("funcgraph-proc"));
        assert!(is_valid_tracefs_option_name("trace_printk"));
        assert!(!is_valid_tracefs_option_name("../escape"));
        assert!(!is_valid_tracefs_option_name(""));
    }

    #[test]
    fn test_split_group_and_name() {
        assert_eq!(split_group_and_name("sched/sched_switch"), ("sched", "sched_switch"));
        assert_eq!(split_group_and_name("sched_switch"), ("", "sched_switch"));
        assert_eq!(split_group_and_name("sched/*"), ("sched", "*"));
    }
}
