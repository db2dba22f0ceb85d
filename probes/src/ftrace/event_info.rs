//! Compile-time-known event descriptors
//!
//! Each entry names a tracepoint we can decode into a strongly-typed output
//! record, the stable output field id for the event, and the expected fields
//! by name with their target output types. Offsets, sizes and kernel event
//! ids are merged in at startup from the runtime `format` files; fields the
//! running kernel does not declare are dropped.

use probes_common::OutputKind;

/// Output field id of the common header pid, present on every event.
pub const COMMON_PID_FIELD_ID: u32 = 2;
/// Output field id of the common flags byte (consumed by compact sched).
pub const COMMON_FLAGS_FIELD_ID: u32 = 5;

pub const PRINT_FIELD_ID: u32 = 3;
pub const SCHED_SWITCH_FIELD_ID: u32 = 4;
pub const SCHED_WAKING_FIELD_ID: u32 = 6;
pub const SCHED_WAKEUP_FIELD_ID: u32 = 7;
pub const TASK_NEWTASK_FIELD_ID: u32 = 8;
pub const TASK_RENAME_FIELD_ID: u32 = 9;
pub const RSS_STAT_FIELD_ID: u32 = 10;
pub const RSS_STAT_THROTTLED_FIELD_ID: u32 = 11;
pub const SYS_ENTER_FIELD_ID: u32 = 12;
pub const SYS_EXIT_FIELD_ID: u32 = 13;
pub const FUNCGRAPH_ENTRY_FIELD_ID: u32 = 14;
pub const FUNCGRAPH_EXIT_FIELD_ID: u32 = 15;
pub const OOM_SCORE_ADJ_UPDATE_FIELD_ID: u32 = 16;
pub const MM_FILEMAP_ADD_FIELD_ID: u32 = 17;

/// Fixed output field id for all kprobe/kretprobe records.
pub const KPROBE_EVENT_FIELD_ID: u32 = 18;
/// Output field id used by the legacy `(name, value)` generic encoding.
pub const GENERIC_EVENT_LEGACY_ID: u32 = 19;

/// A field of a compile-time-known event, before runtime merging.
#[derive(Debug, Clone, Copy)]
pub struct StaticField {
    pub name: &'static str,
    pub id: u32,
    pub kind: OutputKind,
}

/// A compile-time-known event, before runtime merging.
#[derive(Debug, Clone, Copy)]
pub struct StaticEvent {
    pub group: &'static str,
    pub name: &'static str,
    pub output_id: u32,
    pub fields: &'static [StaticField],
}

const fn f(name: &'static str, id: u32, kind: OutputKind) -> StaticField {
    StaticField { name, id, kind }
}

use OutputKind::{Int64, String as Str, Uint64};

pub static COMMON_FIELDS: &[StaticField] = &[
    f("common_pid", COMMON_PID_FIELD_ID, Int64),
    f("common_flags", COMMON_FLAGS_FIELD_ID, Uint64),
];

pub static STATIC_EVENTS: &[StaticEvent] = &[
    StaticEvent {
        group: "ftrace",
        name: "print",
        output_id: PRINT_FIELD_ID,
        fields: &[f("ip", 1, Uint64), f("buf", 2, Str)],
    },
    StaticEvent {
        group: "sched",
        name: "sched_switch",
        output_id: SCHED_SWITCH_FIELD_ID,
        fields: &[
            f("prev_comm", 1, Str),
            f("prev_pid", 2, Int64),
            f("prev_prio", 3, Int64),
            f("prev_state", 4, Int64),
            f("next_comm", 5, Str),
            f("next_pid", 6, Int64),
            f("next_prio", 7, Int64),
        ],
    },
    StaticEvent {
        group: "sched",
        name: "sched_waking",
        output_id: SCHED_WAKING_FIELD_ID,
        fields: &[
            f("comm", 1, Str),
            f("pid", 2, Int64),
            f("prio", 3, Int64),
            f("success", 4, Int64),
            f("target_cpu", 5, Int64),
        ],
    },
    StaticEvent {
        group: "sched",
        name: "sched_wakeup",
        output_id: SCHED_WAKEUP_FIELD_ID,
        fields: &[
            f("comm", 1, Str),
            f("pid", 2, Int64),
            f("prio", 3, Int64),
            f("success", 4, Int64),
            f("target_cpu", 5, Int64),
        ],
    },
    StaticEvent {
        group: "task",
        name: "task_newtask",
        output_id: TASK_NEWTASK_FIELD_ID,
        fields: &[
            f("pid", 1, Int64),
            f("comm", 2, Str),
            f("clone_flags", 3, Uint64),
            f("oom_score_adj", 4, Int64),
        ],
    },
    StaticEvent {
        group: "task",
        name: "task_rename",
        output_id: TASK_RENAME_FIELD_ID,
        fields: &[
            f("pid", 1, Int64),
            f("oldcomm", 2, Str),
            f("newcomm", 3, Str),
            f("oom_score_adj", 4, Int64),
        ],
    },
    StaticEvent {
        group: "kmem",
        name: "rss_stat",
        output_id: RSS_STAT_FIELD_ID,
        fields: &[
            f("member", 1, Int64),
            f("size", 2, Int64),
            f("curr", 3, Uint64),
            f("mm_id", 4, Uint64),
        ],
    },
    StaticEvent {
        group: "synthetic",
        name: "rss_stat_throttled",
        output_id: RSS_STAT_THROTTLED_FIELD_ID,
        fields: &[
            f("member", 1, Int64),
            f("size", 2, Int64),
            f("curr", 3, Uint64),
            f("mm_id", 4, Uint64),
        ],
    },
    StaticEvent {
        group: "raw_syscalls",
        name: "sys_enter",
        output_id: SYS_ENTER_FIELD_ID,
        fields: &[f("id", 1, Int64), f("args", 2, Uint64)],
    },
    StaticEvent {
        group: "raw_syscalls",
        name: "sys_exit",
        output_id: SYS_EXIT_FIELD_ID,
        fields: &[f("id", 1, Int64), f("ret", 2, Int64)],
    },
    StaticEvent {
        group: "ftrace",
        name: "funcgraph_entry",
        output_id: FUNCGRAPH_ENTRY_FIELD_ID,
        fields: &[f("func", 1, Uint64), f("depth", 2, Int64)],
    },
    StaticEvent {
        group: "ftrace",
        name: "funcgraph_exit",
        output_id: FUNCGRAPH_EXIT_FIELD_ID,
        fields: &[
            f("func", 1, Uint64),
            f("depth", 2, Int64),
            f("calltime", 3, Uint64),
            f("rettime", 4, Uint64),
            f("overrun", 5, Uint64),
        ],
    },
    StaticEvent {
        group: "oom",
        name: "oom_score_adj_update",
        output_id: OOM_SCORE_ADJ_UPDATE_FIELD_ID,
        fields: &[f("comm", 1, Str), f("pid", 2, Int64), f("oom_score_adj", 3, Int64)],
    },
    StaticEvent {
        group: "filemap",
        name: "mm_filemap_add_to_page_cache",
        output_id: MM_FILEMAP_ADD_FIELD_ID,
        fields: &[
            f("pfn", 1, Uint64),
            f("i_ino", 2, Uint64),
            f("index", 3, Uint64),
            f("s_dev", 4, Uint64),
            f("page", 5, Uint64),
        ],
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_output_ids_are_unique() {
        let mut seen = HashSet::new();
        for event in STATIC_EVENTS {
            assert!(seen.insert(event.output_id), "duplicate id for {}", event.name);
        }
        assert!(!seen.contains(&KPROBE_EVENT_FIELD_ID));
        assert!(!seen.contains(&GENERIC_EVENT_LEGACY_ID));
    }

    #[test]
    fn test_field_ids_are_unique_within_event() {
        for event in STATIC_EVENTS {
            let mut seen = HashSet::new();
            for field in event.fields {
                assert!(seen.insert(field.id), "duplicate field id in {}", event.name);
            }
        }
    }
}
