//! Columnar ("compact") encoding of scheduling events
//!
//! `sched_switch` and `sched_waking` dominate most traces, so instead of one
//! record per event they can be batched into per-bundle column arrays with
//! interned comm strings. The layout assumptions are validated against the
//! runtime formats once at table build time; if the kernel's format deviates,
//! compact encoding is disabled without failing session setup.

use probes_common::CompactSched;
use std::collections::HashMap;

use super::event_info::COMMON_FLAGS_FIELD_ID;
use super::translation::{Event, Field, FtraceFieldType};

/// If the interner accumulates more unique comms within one bundle, the
/// reader finalizes the bundle to reset the interning state (and make it
/// cheap again). Checked only at page boundaries, so not an exact cap.
pub const COMPACT_SCHED_INTERNER_THRESHOLD: usize = 64;

/// Pre-validated layout of `sched_switch` for direct field reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactSchedSwitchFormat {
    pub event_id: u16,
    pub size: u16,
    pub next_pid_offset: u16,
    pub next_prio_offset: u16,
    pub prev_state_offset: u16,
    pub prev_state_size: u16,
    pub next_comm_offset: u16,
}

/// Pre-validated layout of `sched_waking` for direct field reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactSchedWakingFormat {
    pub event_id: u16,
    pub size: u16,
    pub pid_offset: u16,
    pub prio_offset: u16,
    pub target_cpu_offset: u16,
    pub comm_offset: u16,
    pub common_flags_offset: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompactSchedFormat {
    pub format_valid: bool,
    pub sched_switch: CompactSchedSwitchFormat,
    pub sched_waking: CompactSchedWakingFormat,
}

fn find_field<'a>(event: &'a Event, name: &str) -> Option<&'a Field> {
    event.fields.iter().find(|f| f.ftrace_name == name)
}

impl CompactSchedFormat {
    /// Check that the runtime formats carry the fields the compact encoder
    /// reads at fixed offsets. Any mismatch yields `format_valid == false`.
    #[must_use]
    pub fn validate(
        sched_switch: Option<&Event>,
        sched_waking: Option<&Event>,
        common_fields: &[Field],
    ) -> CompactSchedFormat {
        let mut format = CompactSchedFormat::default();

        let (Some(switch_event), Some(waking_event)) = (sched_switch, sched_waking) else {
            return format;
        };

        let valid_switch = (|| {
            let prev_state = find_field(switch_event, "prev_state")?;
            if prev_state.ftrace_type != FtraceFieldType::Int32
                && prev_state.ftrace_type != FtraceFieldType::Int64
            {
                return None;
            }
            let next_pid = find_field(switch_event, "next_pid")?;
            if next_pid.ftrace_type != FtraceFieldType::Pid32 {
                return None;
            }
            let next_prio = find_field(switch_event, "next_prio")?;
            if next_prio.ftrace_type != FtraceFieldType::Int32 {
                return None;
            }
            let next_comm = find_field(switch_event, "next_comm")?;
            if next_comm.ftrace_type != FtraceFieldType::FixedCString {
                return None;
            }
            format.sched_switch = CompactSchedSwitchFormat {
                event_id: switch_event.ftrace_event_id,
                size: switch_event.size,
                next_pid_offset: next_pid.ftrace_offset,
                next_prio_offset: next_prio.ftrace_offset,
                prev_state_offset: prev_state.ftrace_offset,
                prev_state_size: prev_state.ftrace_size,
                next_comm_offset: next_comm.ftrace_offset,
            };
            Some(())
        })();

        let valid_waking = (|| {
            let pid = find_field(waking_event, "pid")?;
            if pid.ftrace_type != FtraceFieldType::Pid32 {
                return None;
            }
            let prio = find_field(waking_event, "prio")?;
            if prio.ftrace_type != FtraceFieldType::Int32 {
                return None;
            }
            let target_cpu = find_field(waking_event, "target_cpu")?;
            if target_cpu.ftrace_type != FtraceFieldType::Int32 {
                return None;
            }
            let comm = find_field(waking_event, "comm")?;
            if comm.ftrace_type != FtraceFieldType::FixedCString {
                return None;
            }
            let common_flags = common_fields
                .iter()
                .find(|f| f.output_id == COMMON_FLAGS_FIELD_ID)?;
            if common_flags.ftrace_type != FtraceFieldType::Uint8 {
                return None;
            }
            format.sched_waking = CompactSchedWakingFormat {
                event_id: waking_event.ftrace_event_id,
                size: waking_event.size,
                pid_offset: pid.ftrace_offset,
                prio_offset: prio.ftrace_offset,
                target_cpu_offset: target_cpu.ftrace_offset,
                comm_offset: comm.ftrace_offset,
                common_flags_offset: common_flags.ftrace_offset,
            };
            Some(())
        })();

        format.format_valid = valid_switch.is_some() && valid_waking.is_some();
        if !format.format_valid {
            format.sched_switch = CompactSchedSwitchFormat::default();
            format.sched_waking = CompactSchedWakingFormat::default();
        }
        format
    }
}

/// Per-session choice of whether scheduling events use the compact encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactSchedConfig {
    pub enabled: bool,
}

/// Interns comm strings within one bundle; indices are dense and reference
/// the bundle's `intern_table`.
#[derive(Debug, Default)]
pub struct CommInterner {
    table: Vec<String>,
    indices: HashMap<String, u32>,
}

impl CommInterner {
    pub fn intern(&mut self, comm: &str) -> u32 {
        if let Some(&index) = self.indices.get(comm) {
            return index;
        }
        let index = self.table.len() as u32;
        self.table.push(comm.to_string());
        self.indices.insert(comm.to_string(), index);
        index
    }

    #[must_use]
    pub fn interned_comms_size(&self) -> usize {
        self.table.len()
    }

    fn take_table(&mut self) -> Vec<String> {
        self.indices.clear();
        std::mem::take(&mut self.table)
    }
}

/// Accumulates compact scheduling rows for the current bundle.
#[derive(Debug, Default)]
pub struct CompactSchedBuffer {
    interner: CommInterner,
    sched: CompactSched,
}

impl CompactSchedBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_switch(
        &mut self,
        timestamp: u64,
        prev_state: i64,
        next_pid: i32,
        next_prio: i32,
        next_comm: &str,
    ) {
        let comm_index = self.interner.intern(next_comm);
        self.sched.switch_timestamp.push(timestamp);
        self.sched.switch_prev_state.push(prev_state);
        self.sched.switch_next_pid.push(next_pid);
        self.sched.switch_next_prio.push(next_prio);
        self.sched.switch_next_comm_index.push(comm_index);
    }

    pub fn append_waking(
        &mut self,
        timestamp: u64,
        pid: i32,
        target_cpu: i32,
        prio: i32,
        comm: &str,
        common_flags: u32,
    ) {
        let comm_index = self.interner.intern(comm);
        self.sched.waking_timestamp.push(timestamp);
        self.sched.waking_pid.push(pid);
        self.sched.waking_target_cpu.push(target_cpu);
        self.sched.waking_prio.push(prio);
        self.sched.waking_comm_index.push(comm_index);
        self.sched.waking_common_flags.push(common_flags);
    }

    #[must_use]
    pub fn interner(&self) -> &CommInterner {
        &self.interner
    }

    /// Hand the accumulated columns to the bundle and reset for the next one.
    pub fn write_and_reset(&mut self) -> Option<CompactSched> {
        if self.sched.is_empty() {
            self.interner.take_table();
            return None;
        }
        let mut out = std::mem::take(&mut self.sched);
        out.intern_table = self.interner.take_table();
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interner_deduplicates() {
        let mut interner = CommInterner::default();
        assert_eq!(interner.intern("worker"), 0);
        assert_eq!(interner.intern("kswapd0"), 1);
        assert_eq!(interner.intern("worker"), 0);
        assert_eq!(interner.interned_comms_size(), 2);
    }

    #[test]
    fn test_buffer_write_and_reset() {
        let mut buf = CompactSchedBuffer::new();
        buf.append_switch(1050, 1, 42, 120, "worker");
        buf.append_waking(1060, 43, 0, 100, "kswapd0", 1);
        buf.append_switch(1070, 0, 43, 100, "kswapd0");

        let sched = buf.write_and_reset().unwrap();
        assert_eq!(sched.switch_timestamp, vec![1050, 1070]);
        assert_eq!(sched.switch_next_pid, vec![42, 43]);
        assert_eq!(sched.switch_next_comm_index, vec![0, 1]);
        assert_eq!(sched.waking_pid, vec![43]);
        assert_eq!(sched.intern_table, vec!["worker".to_string(), "kswapd0".to_string()]);

        // Reset: interning restarts from zero.
        assert!(buf.write_and_reset().is_none());
        buf.append_switch(2000, 0, 1, 1, "other");
        let sched2 = buf.write_and_reset().unwrap();
        assert_eq!(sched2.switch_next_comm_index, vec![0]);
        assert_eq!(sched2.intern_table, vec!["other".to_string()]);
    }
}
