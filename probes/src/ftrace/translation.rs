//! Runtime event layout -> fixed decoder plan
//!
//! Built once per tracing instance at startup: for every compile-time-known
//! event the kernel's `format` file is parsed and merged with our static
//! descriptor, producing per-field `(offset, size, type, strategy)` tuples
//! the per-cpu readers decode with. Events requested at runtime but unknown
//! at compile time get "generic" entries with freshly assigned output ids and
//! a self-describing schema.

use log::{debug, warn};
use std::collections::HashMap;

use probes_common::{FieldDescriptor, GenericEventDescriptor, OutputKind, GENERIC_EVENT_FIRST_ID};

use super::event_info::{
    StaticField, COMMON_PID_FIELD_ID, KPROBE_EVENT_FIELD_ID, STATIC_EVENTS,
};
use super::format::{
    fallback_page_header_spec, name_from_type_and_name, parse_event_format,
    parse_page_header_spec, EventFormat, FormatField, PageHeaderSpec,
};
use super::printk::{parse_printk_formats, PrintkMap};
use super::tracefs::TracefsOps;
use crate::domain::types::GroupAndName;
use crate::ftrace::compact_sched::CompactSchedFormat;
use crate::ftrace::event_info;

/// Inferred kernel-side type of a recorded field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtraceFieldType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Bool,
    FixedCString,
    CString,
    StringPtr,
    DataLoc,
    Pid32,
    CommonPid32,
    Inode32,
    Inode64,
    DevId32,
    DevId64,
    SymAddr32,
    SymAddr64,
}

/// How to turn the recorded bytes into the target output value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TranslationStrategy {
    #[default]
    Invalid,
    Uint8ToUint64,
    Uint16ToUint64,
    Uint32ToUint64,
    Uint64ToUint64,
    Int8ToInt64,
    Int16ToInt64,
    Int32ToInt64,
    Int64ToInt64,
    BoolToUint64,
    FixedCStringToString,
    CStringToString,
    StringPtrToString,
    DataLocToString,
    Pid32ToInt64,
    CommonPid32ToInt64,
    Inode32ToUint64,
    Inode64ToUint64,
    DevId32ToUint64,
    DevId64ToUint64,
    SymAddr32ToUint64,
    SymAddr64ToUint64,
}

/// A decodable field of an event.
#[derive(Debug, Clone)]
pub struct Field {
    pub ftrace_name: String,
    pub output_id: u32,
    pub output_kind: OutputKind,
    pub ftrace_offset: u16,
    pub ftrace_size: u16,
    pub ftrace_type: FtraceFieldType,
    pub strategy: TranslationStrategy,
}

/// A decodable event.
#[derive(Debug, Clone)]
pub struct Event {
    pub ftrace_event_id: u16,
    pub group: String,
    pub name: String,
    pub output_id: u32,
    /// Recorded byte size: the maximum `offset + size` across surviving
    /// fields, including common fields. Records shorter than this are
    /// rejected by the decoder.
    pub size: u16,
    pub fields: Vec<Field>,
}

/// Infer the kernel field type from its C declaration, recorded size and
/// signedness.
#[must_use]
pub fn infer_ftrace_type(
    type_and_name: &str,
    size: u16,
    is_signed: bool,
) -> Option<FtraceFieldType> {
    // Fixed length strings, e.g. "char foo[16]". The length can be a symbolic
    // constant, so the size field is authoritative. These are both fixed-size
    // and null terminated (and in rare kernel bugs, not terminated at all).
    if is_fixed_cstring_decl(type_and_name) {
        return Some(FtraceFieldType::FixedCString);
    }

    if type_and_name.contains("__data_loc char[] ") {
        if size != 4 {
            warn!("__data_loc with incorrect size: {type_and_name} ({size})");
            return None;
        }
        return Some(FtraceFieldType::DataLoc);
    }

    // sys_enter's argument array; element width follows from the total size.
    if type_and_name == "unsigned long args[6]" {
        match size {
            24 => return Some(FtraceFieldType::Uint32),
            48 => return Some(FtraceFieldType::Uint64),
            _ => {}
        }
    }

    if type_and_name.contains("char[] ") || type_and_name.contains("char * ") {
        return Some(FtraceFieldType::StringPtr);
    }

    // Kernel addresses that need symbolization.
    if type_and_name.starts_with("void*") || type_and_name.starts_with("void *") {
        match size {
            4 => return Some(FtraceFieldType::SymAddr32),
            8 => return Some(FtraceFieldType::SymAddr64),
            _ => {}
        }
    }

    // Variable length strings: "char foo" + size 0 (as in ftrace/print).
    if type_and_name.starts_with("char ") && size == 0 {
        return Some(FtraceFieldType::CString);
    }

    if type_and_name.starts_with("bool ") {
        return Some(FtraceFieldType::Bool);
    }

    if type_and_name.starts_with("ino_t ") || type_and_name.starts_with("i_ino ") {
        match size {
            4 => return Some(FtraceFieldType::Inode32),
            8 => return Some(FtraceFieldType::Inode64),
            _ => {}
        }
    }

    if type_and_name.starts_with("dev_t ") {
        match size {
            4 => return Some(FtraceFieldType::DevId32),
            8 => return Some(FtraceFieldType::DevId64),
            _ => {}
        }
    }

    if type_and_name.starts_with("pid_t ") && size == 4 {
        return Some(FtraceFieldType::Pid32);
    }

    if type_and_name.contains("common_pid") && size == 4 {
        return Some(FtraceFieldType::CommonPid32);
    }

    match (size, is_signed) {
        (1, true) => Some(FtraceFieldType::Int8),
        (1, false) => Some(FtraceFieldType::Uint8),
        (2, true) => Some(FtraceFieldType::Int16),
        (2, false) => Some(FtraceFieldType::Uint16),
        (4, true) => Some(FtraceFieldType::Int32),
        (4, false) => Some(FtraceFieldType::Uint32),
        (8, true) => Some(FtraceFieldType::Int64),
        (8, false) => Some(FtraceFieldType::Uint64),
        _ => {
            debug!("could not infer ftrace type for '{type_and_name}'");
            None
        }
    }
}

/// Matches `char <ident>[<ident-or-number>]`.
fn is_fixed_cstring_decl(type_and_name: &str) -> bool {
    let Some(rest) = type_and_name.strip_prefix("char ") else { return false };
    let rest = rest.trim_end();
    let Some(open) = rest.find('[') else { return false };
    let Some(close) = rest.strip_suffix(']') else { return false };
    let ident = &rest[..open];
    let len = &close[open + 1..];
    !ident.is_empty()
        && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && ident.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && !len.is_empty()
        && len.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Pick a decode strategy for the `(kernel type, output type)` pair. `None`
/// drops the field.
#[must_use]
pub fn translation_strategy(
    ftrace_type: FtraceFieldType,
    output: OutputKind,
) -> Option<TranslationStrategy> {
    use FtraceFieldType as F;
    use OutputKind as O;
    use TranslationStrategy as S;
    match (ftrace_type, output) {
        (F::Uint8, O::Uint64) => Some(S::Uint8ToUint64),
        (F::Uint16, O::Uint64) => Some(S::Uint16ToUint64),
        (F::Uint32, O::Uint64) => Some(S::Uint32ToUint64),
        (F::Uint64, O::Uint64) => Some(S::Uint64ToUint64),
        (F::Int8, O::Int64) => Some(S::Int8ToInt64),
        (F::Int16, O::Int64) => Some(S::Int16ToInt64),
        (F::Int32, O::Int64) => Some(S::Int32ToInt64),
        (F::Int64, O::Int64) => Some(S::Int64ToInt64),
        (F::Bool, O::Uint64) => Some(S::BoolToUint64),
        (F::FixedCString, O::String) => Some(S::FixedCStringToString),
        (F::CString, O::String) => Some(S::CStringToString),
        (F::StringPtr, O::String) => Some(S::StringPtrToString),
        (F::DataLoc, O::String) => Some(S::DataLocToString),
        (F::Pid32, O::Int64) => Some(S::Pid32ToInt64),
        (F::CommonPid32, O::Int64) => Some(S::CommonPid32ToInt64),
        (F::Inode32, O::Uint64) => Some(S::Inode32ToUint64),
        (F::Inode64, O::Uint64) => Some(S::Inode64ToUint64),
        (F::DevId32, O::Uint64) => Some(S::DevId32ToUint64),
        (F::DevId64, O::Uint64) => Some(S::DevId64ToUint64),
        (F::SymAddr32, O::Uint64) => Some(S::SymAddr32ToUint64),
        (F::SymAddr64, O::Uint64) => Some(S::SymAddr64ToUint64),
        _ => None,
    }
}

/// Output type used for generic event fields, by inferred kernel type.
fn generic_output_kind(ftrace_type: FtraceFieldType) -> OutputKind {
    use FtraceFieldType as F;
    match ftrace_type {
        F::CString | F::FixedCString | F::StringPtr | F::DataLoc => OutputKind::String,
        F::Int8 | F::Int16 | F::Int32 | F::Int64 | F::Pid32 | F::CommonPid32 => OutputKind::Int64,
        _ => OutputKind::Uint64,
    }
}

/// Dense `bit[kernel event id]` set.
#[derive(Debug, Default, Clone)]
pub struct EventFilter {
    enabled_ids: Vec<bool>,
}

impl EventFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_enabled_event(&mut self, id: usize) {
        if id >= self.enabled_ids.len() {
            self.enabled_ids.resize(id + 1, false);
        }
        self.enabled_ids[id] = true;
    }

    pub fn disable_event(&mut self, id: usize) {
        if let Some(slot) = self.enabled_ids.get_mut(id) {
            *slot = false;
        }
    }

    #[must_use]
    pub fn is_event_enabled(&self, id: usize) -> bool {
        id != 0 && self.enabled_ids.get(id).copied().unwrap_or(false)
    }

    #[must_use]
    pub fn enabled_events(&self) -> Vec<usize> {
        self.enabled_ids
            .iter()
            .enumerate()
            .filter_map(|(id, on)| on.then_some(id))
            .collect()
    }

    pub fn enable_events_from(&mut self, other: &EventFilter) {
        if other.enabled_ids.len() > self.enabled_ids.len() {
            self.enabled_ids.resize(other.enabled_ids.len(), false);
        }
        for (id, on) in other.enabled_ids.iter().enumerate() {
            if *on {
                self.enabled_ids[id] = true;
            }
        }
    }
}

/// The per-instance decoder plan.
pub struct TranslationTable {
    /// Indexed by kernel event id; `None` for ids we don't decode.
    events_by_id: Vec<Option<Event>>,
    by_group_and_name: HashMap<GroupAndName, u16>,
    by_name: HashMap<String, Vec<u16>>,
    by_group: HashMap<String, Vec<u16>>,
    common_fields: Vec<Field>,
    common_pid: Option<Field>,
    page_header: PageHeaderSpec,
    compact_sched: CompactSchedFormat,
    printk_formats: PrintkMap,
    next_generic_output_id: u32,
    generic_descriptors: HashMap<u32, GenericEventDescriptor>,
}

impl TranslationTable {
    /// Parse the instance's runtime layouts and build the table.
    pub fn build(tracefs: &dyn TracefsOps) -> TranslationTable {
        let header_text = tracefs.read_page_header_format();
        let page_header = parse_page_header_spec(&header_text).unwrap_or_else(|| {
            log::info!("failed to parse ftrace page header, using fallback layout");
            fallback_page_header_spec()
        });

        let mut events = Vec::new();
        let mut common_fields: Vec<Field> = Vec::new();
        let mut common_fields_processed = false;
        let mut common_fields_end = 0u16;

        for static_event in STATIC_EVENTS {
            let contents = tracefs.read_event_format(static_event.group, static_event.name);
            let format = match parse_event_format(&contents) {
                Some(f) => f,
                None if static_event.group == "ftrace" && static_event.name == "print" => {
                    // The print event can be unreadable on locked-down
                    // systems, but it's an always-on built-in whose layout is
                    // stable, so fall back to the well-known one.
                    hardcoded_print_format()
                }
                None => continue,
            };

            let format = fudge_funcgraph_types(static_event.group, static_event.name, format);

            if !common_fields_processed && !format.common_fields.is_empty() {
                common_fields = event_info::COMMON_FIELDS
                    .iter()
                    .map(|sf| unmerged_field(sf))
                    .collect();
                common_fields_end = merge_fields(&format.common_fields, &mut common_fields);
                common_fields_processed = true;
            }

            let mut fields: Vec<Field> =
                static_event.fields.iter().map(|sf| unmerged_field(sf)).collect();
            let fields_end = merge_fields(&format.fields, &mut fields);

            events.push(Event {
                ftrace_event_id: format.id,
                group: static_event.group.to_string(),
                name: static_event.name.to_string(),
                output_id: static_event.output_id,
                size: fields_end.max(common_fields_end),
                fields,
            });
        }

        let common_pid = common_fields
            .iter()
            .find(|field| field.output_id == COMMON_PID_FIELD_ID)
            .cloned();

        let compact_sched = CompactSchedFormat::validate(
            events.iter().find(|e| e.group == "sched" && e.name == "sched_switch"),
            events.iter().find(|e| e.group == "sched" && e.name == "sched_waking"),
            &common_fields,
        );

        let printk_formats = parse_printk_formats(&tracefs.read_printk_formats());

        let mut table = TranslationTable {
            events_by_id: Vec::new(),
            by_group_and_name: HashMap::new(),
            by_name: HashMap::new(),
            by_group: HashMap::new(),
            common_fields,
            common_pid,
            page_header,
            compact_sched,
            printk_formats,
            next_generic_output_id: GENERIC_EVENT_FIRST_ID,
            generic_descriptors: HashMap::new(),
        };
        for event in events {
            table.insert_event(event);
        }
        table
    }

    fn insert_event(&mut self, event: Event) {
        let id = event.ftrace_event_id;
        if id == 0 {
            return;
        }
        if usize::from(id) >= self.events_by_id.len() {
            self.events_by_id.resize(usize::from(id) + 1, None);
        }
        self.by_group_and_name
            .insert(GroupAndName::new(&event.group, &event.name), id);
        self.by_name.entry(event.name.clone()).or_default().push(id);
        self.by_group.entry(event.group.clone()).or_default().push(id);
        self.events_by_id[usize::from(id)] = Some(event);
    }

    #[must_use]
    pub fn event_by_id(&self, id: u16) -> Option<&Event> {
        self.events_by_id.get(usize::from(id)).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn event(&self, group_and_name: &GroupAndName) -> Option<&Event> {
        let id = *self.by_group_and_name.get(group_and_name)?;
        self.event_by_id(id)
    }

    #[must_use]
    pub fn event_by_name(&self, name: &str) -> Option<&Event> {
        let id = *self.by_name.get(name)?.first()?;
        self.event_by_id(id)
    }

    #[must_use]
    pub fn events_by_group(&self, group: &str) -> Vec<&Event> {
        self.by_group
            .get(group)
            .map(|ids| ids.iter().filter_map(|id| self.event_by_id(*id)).collect())
            .unwrap_or_default()
    }

    /// All events currently known to the table.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events_by_id.iter().filter_map(Option::as_ref)
    }

    #[must_use]
    pub fn common_fields(&self) -> &[Field] {
        &self.common_fields
    }

    #[must_use]
    pub fn common_pid(&self) -> Option<&Field> {
        self.common_pid.as_ref()
    }

    #[must_use]
    pub fn page_header(&self) -> PageHeaderSpec {
        self.page_header
    }

    #[must_use]
    pub fn compact_sched_format(&self) -> &CompactSchedFormat {
        &self.compact_sched
    }

    #[must_use]
    pub fn lookup_trace_string(&self, address: u64) -> &str {
        self.printk_formats.lookup(address)
    }

    #[must_use]
    pub fn is_generic_event_output_id(id: u32) -> bool {
        id >= GENERIC_EVENT_FIRST_ID
    }

    #[must_use]
    pub fn generic_descriptor(&self, output_id: u32) -> Option<&GenericEventDescriptor> {
        self.generic_descriptors.get(&output_id)
    }

    /// Create (or return) the entry for a runtime-requested event unknown at
    /// compile time, assigning a fresh output id and recording a
    /// self-describing schema.
    pub fn create_generic_event(
        &mut self,
        tracefs: &dyn TracefsOps,
        group_and_name: &GroupAndName,
    ) -> Option<u16> {
        if let Some(existing) = self.event(group_and_name) {
            return Some(existing.ftrace_event_id);
        }
        let output_id = self.next_generic_output_id;
        let id = self.create_dynamic_event(tracefs, group_and_name, output_id, true)?;
        self.next_generic_output_id += 1;
        Some(id)
    }

    /// Create (or return) a kprobe entry: fixed output id, no descriptor.
    pub fn create_kprobe_event(
        &mut self,
        tracefs: &dyn TracefsOps,
        group_and_name: &GroupAndName,
    ) -> Option<u16> {
        if let Some(existing) = self.event(group_and_name) {
            return Some(existing.ftrace_event_id);
        }
        self.create_dynamic_event(tracefs, group_and_name, KPROBE_EVENT_FIELD_ID, false)
    }

    fn create_dynamic_event(
        &mut self,
        tracefs: &dyn TracefsOps,
        group_and_name: &GroupAndName,
        output_id: u32,
        keep_descriptor: bool,
    ) -> Option<u16> {
        let contents = tracefs.read_event_format(&group_and_name.group, &group_and_name.name);
        let format = parse_event_format(&contents)?;

        let mut size = 0u16;
        for field in &format.common_fields {
            size = size.max(field.offset + field.size);
        }

        let mut descriptor = GenericEventDescriptor {
            event: output_id,
            group: group_and_name.group.clone(),
            name: group_and_name.name.clone(),
            fields: Vec::new(),
        };

        let mut fields = Vec::new();
        let mut next_field_id = 1u32;
        for runtime_field in &format.fields {
            size = size.max(runtime_field.offset + runtime_field.size);

            let Some(field_name) = name_from_type_and_name(&runtime_field.type_and_name) else {
                debug!(
                    "couldn't extract name from {group_and_name}.{{{}}}",
                    runtime_field.type_and_name
                );
                continue;
            };
            let Some(ftrace_type) = infer_ftrace_type(
                &runtime_field.type_and_name,
                runtime_field.size,
                runtime_field.is_signed,
            ) else {
                debug!(
                    "couldn't extract type from {group_and_name}.{{{}}}",
                    runtime_field.type_and_name
                );
                continue;
            };

            let output_kind = generic_output_kind(ftrace_type);
            let Some(strategy) = translation_strategy(ftrace_type, output_kind) else {
                continue;
            };
            let field_id = next_field_id;
            next_field_id += 1;
            descriptor.fields.push(FieldDescriptor {
                id: field_id,
                name: field_name.to_string(),
                kind: output_kind,
            });
            fields.push(Field {
                ftrace_name: field_name.to_string(),
                output_id: field_id,
                output_kind,
                ftrace_offset: runtime_field.offset,
                ftrace_size: runtime_field.size,
                ftrace_type,
                strategy,
            });
        }

        if keep_descriptor {
            self.generic_descriptors.insert(output_id, descriptor);
        }

        let event = Event {
            ftrace_event_id: format.id,
            group: group_and_name.group.clone(),
            name: group_and_name.name.clone(),
            output_id,
            size,
            fields,
        };
        let id = event.ftrace_event_id;
        self.insert_event(event);
        Some(id)
    }

    /// Remove a dynamically created event, e.g. an uninstalled kprobe.
    pub fn remove_event(&mut self, group_and_name: &GroupAndName) {
        let Some(id) = self.by_group_and_name.remove(group_and_name) else {
            return;
        };
        if let Some(slot) = self.events_by_id.get_mut(usize::from(id)) {
            *slot = None;
        }
        for map_entry in [
            self.by_name.get_mut(&group_and_name.name),
            self.by_group.get_mut(&group_and_name.group),
        ]
        .into_iter()
        .flatten()
        {
            map_entry.retain(|eid| *eid != id);
        }
        self.by_name.retain(|_, ids| !ids.is_empty());
        self.by_group.retain(|_, ids| !ids.is_empty());
    }
}

fn unmerged_field(sf: &StaticField) -> Field {
    Field {
        ftrace_name: sf.name.to_string(),
        output_id: sf.id,
        output_kind: sf.kind,
        ftrace_offset: 0,
        ftrace_size: 0,
        ftrace_type: FtraceFieldType::Uint8,
        strategy: TranslationStrategy::Invalid,
    }
}

/// For each expected field find the runtime declaration by name and fill in
/// offset/size/type/strategy; drop expected fields the kernel omits. Returns
/// the maximum observed field end.
fn merge_fields(runtime_fields: &[FormatField], fields: &mut Vec<Field>) -> u16 {
    let mut fields_end = 0u16;
    fields.retain_mut(|field| {
        let Some(runtime) = runtime_fields
            .iter()
            .find(|rf| name_from_type_and_name(&rf.type_and_name) == Some(field.ftrace_name.as_str()))
        else {
            return false;
        };
        fields_end = fields_end.max(runtime.offset + runtime.size);

        let Some(ftrace_type) =
            infer_ftrace_type(&runtime.type_and_name, runtime.size, runtime.is_signed)
        else {
            return false;
        };
        let Some(strategy) = translation_strategy(ftrace_type, field.output_kind) else {
            debug!(
                "no translation strategy for field \"{}\" ({:?} -> {:?})",
                field.ftrace_name, ftrace_type, field.output_kind
            );
            return false;
        };
        field.ftrace_offset = runtime.offset;
        field.ftrace_size = runtime.size;
        field.ftrace_type = ftrace_type;
        field.strategy = strategy;
        true
    });
    fields_end
}

/// The funcgraph events declare their function pointer as a plain integer;
/// retag it so the decoder symbolizes it like any other kernel address.
fn fudge_funcgraph_types(group: &str, name: &str, mut format: EventFormat) -> EventFormat {
    if group == "ftrace" && (name == "funcgraph_entry" || name == "funcgraph_exit") {
        for field in &mut format.fields {
            if name_from_type_and_name(&field.type_and_name) == Some("func") {
                field.type_and_name = "void * func".to_string();
                break;
            }
        }
    }
    format
}

fn hardcoded_print_format() -> EventFormat {
    EventFormat {
        id: 5, // stable across kernels
        name: "print".to_string(),
        common_fields: Vec::new(),
        fields: vec![
            FormatField {
                type_and_name: "unsigned long ip".to_string(),
                offset: 8,
                size: 8,
                is_signed: false,
            },
            FormatField {
                type_and_name: "char buf".to_string(),
                offset: 16,
                size: 0,
                is_signed: false,
            },
        ],
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ftrace::tracefs::tests::{add_fake_event, fake_tracefs};
    use crate::ftrace::tracefs::Tracefs;
    use tempfile::TempDir;

    pub(crate) const SCHED_SWITCH_FORMAT: &str = r#"name: sched_switch
ID: 316
format:
	field:unsigned short common_type;	offset:0;	size:2;	signed:0;
	field:unsigned char common_flags;	offset:2;	size:1;	signed:0;
	field:unsigned char common_preempt_count;	offset:3;	size:1;	signed:0;
	field:int common_pid;	offset:4;	size:4;	signed:1;

	field:char prev_comm[16];	offset:8;	size:16;	signed:0;
	field:pid_t prev_pid;	offset:24;	size:4;	signed:1;
	field:int prev_prio;	offset:28;	size:4;	signed:1;
	field:long prev_state;	offset:32;	size:8;	signed:1;
	field:char next_comm[16];	offset:40;	size:16;	signed:0;
	field:pid_t next_pid;	offset:56;	size:4;	signed:1;
	field:int next_prio;	offset:60;	size:4;	signed:1;
"#;

    pub(crate) const SCHED_WAKING_FORMAT: &str = r#"name: sched_waking
ID: 320
format:
	field:unsigned short common_type;	offset:0;	size:2;	signed:0;
	field:unsigned char common_flags;	offset:2;	size:1;	signed:0;
	field:unsigned char common_preempt_count;	offset:3;	size:1;	signed:0;
	field:int common_pid;	offset:4;	size:4;	signed:1;

	field:char comm[16];	offset:8;	size:16;	signed:0;
	field:pid_t pid;	offset:24;	size:4;	signed:1;
	field:int prio;	offset:28;	size:4;	signed:1;
	field:int success;	offset:32;	size:4;	signed:1;
	field:int target_cpu;	offset:36;	size:4;	signed:1;
"#;

    pub(crate) fn fake_tracefs_with_events(cpus: usize) -> (TempDir, Tracefs) {
        let (dir, tracefs) = fake_tracefs(cpus);
        std::fs::write(
            dir.path().join("events/header_page"),
            "\tfield: u64 timestamp;\toffset:0;\tsize:8;\tsigned:0;\n\
             \tfield: local_t commit;\toffset:8;\tsize:8;\tsigned:1;\n\
             \tfield: int overwrite;\toffset:8;\tsize:1;\tsigned:1;\n\
             \tfield: char data;\toffset:16;\tsize:4080;\tsigned:0;\n",
        )
        .unwrap();
        add_fake_event(dir.path(), "sched", "sched_switch", SCHED_SWITCH_FORMAT);
        add_fake_event(dir.path(), "sched", "sched_waking", SCHED_WAKING_FORMAT);
        add_fake_event(
            dir.path(),
            "ftrace",
            "print",
            "name: print\nID: 5\nformat:\n\
             \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
             \tfield:unsigned long ip;\toffset:8;\tsize:8;\tsigned:0;\n\
             \tfield:char buf;\toffset:16;\tsize:0;\tsigned:0;\n",
        );
        (dir, tracefs)
    }

    #[test]
    fn test_infer_ftrace_type() {
        assert_eq!(
            infer_ftrace_type("char prev_comm[16]", 16, false),
            Some(FtraceFieldType::FixedCString)
        );
        assert_eq!(
            infer_ftrace_type("char wchar[WQ_NAME_LEN]", 24, false),
            Some(FtraceFieldType::FixedCString)
        );
        assert_eq!(
            infer_ftrace_type("__data_loc char[] name", 4, false),
            Some(FtraceFieldType::DataLoc)
        );
        assert_eq!(infer_ftrace_type("__data_loc char[] name", 8, false), None);
        assert_eq!(
            infer_ftrace_type("unsigned long args[6]", 48, false),
            Some(FtraceFieldType::Uint64)
        );
        assert_eq!(
            infer_ftrace_type("unsigned long args[6]", 24, false),
            Some(FtraceFieldType::Uint32)
        );
        assert_eq!(infer_ftrace_type("char * buf", 8, false), Some(FtraceFieldType::StringPtr));
        assert_eq!(infer_ftrace_type("void * func", 8, false), Some(FtraceFieldType::SymAddr64));
        assert_eq!(infer_ftrace_type("void * func", 4, false), Some(FtraceFieldType::SymAddr32));
        assert_eq!(infer_ftrace_type("char buf", 0, false), Some(FtraceFieldType::CString));
        assert_eq!(infer_ftrace_type("bool active", 1, false), Some(FtraceFieldType::Bool));
        assert_eq!(infer_ftrace_type("ino_t i_ino", 8, false), Some(FtraceFieldType::Inode64));
        assert_eq!(infer_ftrace_type("dev_t s_dev", 4, false), Some(FtraceFieldType::DevId32));
        assert_eq!(infer_ftrace_type("pid_t pid", 4, true), Some(FtraceFieldType::Pid32));
        assert_eq!(
            infer_ftrace_type("int common_pid", 4, true),
            Some(FtraceFieldType::CommonPid32)
        );
        assert_eq!(infer_ftrace_type("long prev_state", 8, true), Some(FtraceFieldType::Int64));
        assert_eq!(infer_ftrace_type("u32 flags", 4, false), Some(FtraceFieldType::Uint32));
        assert_eq!(infer_ftrace_type("weird thing", 3, false), None);
    }

    #[test]
    fn test_build_merges_sched_switch() {
        let (_dir, tracefs) = fake_tracefs_with_events(1);
        let table = TranslationTable::build(&tracefs);

        let event = table.event(&GroupAndName::new("sched", "sched_switch")).unwrap();
        assert_eq!(event.ftrace_event_id, 316);
        assert_eq!(event.output_id, event_info::SCHED_SWITCH_FIELD_ID);
        // max(offset + size) over fields: next_prio at 60 + 4.
        assert_eq!(event.size, 64);
        assert_eq!(event.fields.len(), 7);

        let next_pid = event.fields.iter().find(|f| f.ftrace_name == "next_pid").unwrap();
        assert_eq!(next_pid.ftrace_offset, 56);
        assert_eq!(next_pid.ftrace_size, 4);
        assert_eq!(next_pid.strategy, TranslationStrategy::Pid32ToInt64);

        let common_pid = table.common_pid().unwrap();
        assert_eq!(common_pid.ftrace_offset, 4);
        assert_eq!(common_pid.strategy, TranslationStrategy::CommonPid32ToInt64);

        assert!(table.compact_sched_format().format_valid);
        assert_eq!(table.event_by_id(316).unwrap().name, "sched_switch");
        assert!(table.event_by_id(9999).is_none());
    }

    #[test]
    fn test_missing_runtime_fields_are_dropped() {
        let (dir, tracefs) = fake_tracefs(1);
        // A sched_waking without the "success" field (removed in newer
        // kernels).
        add_fake_event(
            dir.path(),
            "sched",
            "sched_waking",
            "name: sched_waking\nID: 320\nformat:\n\
             \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
             \tfield:char comm[16];\toffset:8;\tsize:16;\tsigned:0;\n\
             \tfield:pid_t pid;\toffset:24;\tsize:4;\tsigned:1;\n\
             \tfield:int prio;\toffset:28;\tsize:4;\tsigned:1;\n\
             \tfield:int target_cpu;\toffset:32;\tsize:4;\tsigned:1;\n",
        );
        let table = TranslationTable::build(&tracefs);
        let event = table.event(&GroupAndName::new("sched", "sched_waking")).unwrap();
        assert_eq!(event.fields.len(), 4);
        assert!(event.fields.iter().all(|f| f.ftrace_name != "success"));
    }

    #[test]
    fn test_generic_event_creation_and_removal() {
        let (dir, tracefs) = fake_tracefs_with_events(1);
        add_fake_event(
            dir.path(),
            "cgroup",
            "cgroup_mkdir",
            "name: cgroup_mkdir\nID: 512\nformat:\n\
             \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
             \tfield:int root;\toffset:8;\tsize:4;\tsigned:1;\n\
             \tfield:__data_loc char[] path;\toffset:12;\tsize:4;\tsigned:0;\n",
        );
        let mut table = TranslationTable::build(&tracefs);
        let gn = GroupAndName::new("cgroup", "cgroup_mkdir");
        let id = table.create_generic_event(&tracefs, &gn).unwrap();
        assert_eq!(id, 512);

        let event = table.event(&gn).unwrap();
        assert_eq!(event.output_id, GENERIC_EVENT_FIRST_ID);
        assert!(TranslationTable::is_generic_event_output_id(event.output_id));
        assert_eq!(event.fields.len(), 2);
        assert_eq!(event.size, 16);

        let descriptor = table.generic_descriptor(event.output_id).unwrap();
        assert_eq!(descriptor.name, "cgroup_mkdir");
        assert_eq!(descriptor.fields.len(), 2);
        assert_eq!(descriptor.fields[1].kind, OutputKind::String);

        // Second creation reuses the entry, id allocation is monotonic.
        let id2 = table.create_generic_event(&tracefs, &gn).unwrap();
        assert_eq!(id2, id);
        assert_eq!(table.event(&gn).unwrap().output_id, GENERIC_EVENT_FIRST_ID);

        table.remove_event(&gn);
        assert!(table.event(&gn).is_none());
        assert!(table.event_by_id(512).is_none());
    }

    #[test]
    fn test_kprobe_event_uses_fixed_output_id() {
        let (dir, tracefs) = fake_tracefs_with_events(1);
        add_fake_event(
            dir.path(),
            "probes_kprobe",
            "do_sys_open",
            "name: do_sys_open\nID: 600\nformat:\n\
             \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
             \tfield:unsigned long __probe_ip;\toffset:8;\tsize:8;\tsigned:0;\n",
        );
        let mut table = TranslationTable::build(&tracefs);
        let gn = GroupAndName::new("probes_kprobe", "do_sys_open");
        let id = table.create_kprobe_event(&tracefs, &gn).unwrap();
        assert_eq!(id, 600);
        let event = table.event(&gn).unwrap();
        assert_eq!(event.output_id, KPROBE_EVENT_FIELD_ID);
        assert!(table.generic_descriptor(KPROBE_EVENT_FIELD_ID).is_none());
    }

    #[test]
    fn test_event_filter() {
        let mut filter = EventFilter::new();
        filter.add_enabled_event(316);
        filter.add_enabled_event(5);
        assert!(filter.is_event_enabled(316));
        assert!(!filter.is_event_enabled(317));
        assert!(!filter.is_event_enabled(0));

        let mut other = EventFilter::new();
        other.add_enabled_event(700);
        filter.enable_events_from(&other);
        assert!(filter.is_event_enabled(700));
        assert_eq!(filter.enabled_events(), vec![5, 316, 700]);

        filter.disable_event(316);
        assert!(!filter.is_event_enabled(316));
    }
}
