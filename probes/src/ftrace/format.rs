//! Parsers for the tracefs `format` text files
//!
//! Each `events/<group>/<name>/format` file describes the runtime binary
//! layout of one tracepoint:
//!
//! ```text
//! name: sched_switch
//! ID: 316
//! format:
//!     field:unsigned short common_type;  offset:0;  size:2;  signed:0;
//!     field:int common_pid;              offset:4;  size:4;  signed:1;
//!
//!     field:char prev_comm[16];          offset:8;  size:16; signed:0;
//!     ...
//! print fmt: "..."
//! ```
//!
//! `events/header_page` uses the same `field:` grammar and describes the
//! layout of the per-cpu ring buffer page header.

/// One `field:` declaration, verbatim except for the parsed numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatField {
    /// The raw C declaration, e.g. `char prev_comm[16]`.
    pub type_and_name: String,
    pub offset: u16,
    pub size: u16,
    pub is_signed: bool,
}

/// Parsed contents of one event format file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFormat {
    pub id: u16,
    pub name: String,
    /// Fields shared by every event (names start with `common_`).
    pub common_fields: Vec<FormatField>,
    pub fields: Vec<FormatField>,
}

/// Layout of the raw ring-buffer page header, from `events/header_page`.
///
/// The `commit` field is 8 bytes on 64-bit kernels and 4 on 32-bit ones;
/// record payload starts right after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeaderSpec {
    pub timestamp_offset: u16,
    pub commit_offset: u16,
    pub commit_size: u16,
}

impl PageHeaderSpec {
    #[must_use]
    pub fn data_offset(&self) -> u16 {
        self.commit_offset + self.commit_size
    }
}

/// Extract the identifier from a C declaration: the last whitespace token,
/// with any `[N]` array suffix removed. Returns `None` for declarations that
/// carry no identifier.
#[must_use]
pub fn name_from_type_and_name(type_and_name: &str) -> Option<&str> {
    let last = type_and_name.split_whitespace().last()?;
    let name = match last.find('[') {
        Some(idx) => &last[..idx],
        None => last,
    };
    // "char *buf" style declarations glue the pointer onto the name.
    let name = name.trim_start_matches('*');
    if name.is_empty() || !name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    {
        return None;
    }
    Some(name)
}

fn parse_field_line(line: &str) -> Option<FormatField> {
    let line = line.trim();
    let rest = line.strip_prefix("field:")?;

    let mut type_and_name = None;
    let mut offset = None;
    let mut size = None;
    let mut signed = None;
    for part in rest.split(';') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("offset:") {
            offset = v.trim().parse::<u16>().ok();
        } else if let Some(v) = part.strip_prefix("size:") {
            size = v.trim().parse::<u16>().ok();
        } else if let Some(v) = part.strip_prefix("signed:") {
            signed = match v.trim() {
                "0" => Some(false),
                "1" => Some(true),
                _ => None,
            };
        } else if type_and_name.is_none() && !part.is_empty() {
            type_and_name = Some(part.to_string());
        }
    }

    Some(FormatField {
        type_and_name: type_and_name?,
        offset: offset?,
        size: size?,
        is_signed: signed?,
    })
}

/// Parse the body of a format file (everything after the `format:` line, or
/// the whole `header_page` file). Unparsable lines are skipped.
#[must_use]
pub fn parse_field_lines(text: &str) -> Vec<FormatField> {
    text.lines().filter_map(parse_field_line).collect()
}

/// Parse a full `events/<group>/<name>/format` file. Returns `None` when the
/// `ID:` line is missing or malformed, since an event without a kernel id
/// cannot be matched against ring-buffer records.
#[must_use]
pub fn parse_event_format(text: &str) -> Option<EventFormat> {
    let mut out = EventFormat::default();
    let mut has_id = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_prefix("name:") {
            out.name = name.trim().to_string();
        } else if let Some(id) = trimmed.strip_prefix("ID:") {
            out.id = id.trim().parse::<u16>().ok()?;
            has_id = true;
        } else if trimmed.starts_with("print fmt:") {
            break;
        } else if let Some(field) = parse_field_line(trimmed) {
            let is_common = name_from_type_and_name(&field.type_and_name)
                .is_some_and(|n| n.starts_with("common_"));
            if is_common {
                out.common_fields.push(field);
            } else {
                out.fields.push(field);
            }
        }
    }

    if !has_id {
        return None;
    }
    Some(out)
}

/// Parse `events/header_page` into a [`PageHeaderSpec`]. Expects at least the
/// `timestamp` and `commit` declarations.
#[must_use]
pub fn parse_page_header_spec(text: &str) -> Option<PageHeaderSpec> {
    let mut timestamp: Option<&FormatField> = None;
    let mut commit: Option<&FormatField> = None;

    let fields = parse_field_lines(text);
    for field in &fields {
        match name_from_type_and_name(&field.type_and_name) {
            Some("timestamp") => timestamp = Some(field),
            Some("commit") => commit = Some(field),
            // "overwrite" aliases the commit word, "data" is the payload.
            _ => {}
        }
    }

    let timestamp = timestamp?;
    let commit = commit?;
    if timestamp.size != 8 || (commit.size != 4 && commit.size != 8) {
        return None;
    }
    Some(PageHeaderSpec {
        timestamp_offset: timestamp.offset,
        commit_offset: commit.offset,
        commit_size: commit.size,
    })
}

/// Fallback layout used when `header_page` cannot be read: timestamp at 0,
/// commit right after, commit width matching the userspace word size (the
/// kernel's `local_t` is one machine word).
#[must_use]
pub fn fallback_page_header_spec() -> PageHeaderSpec {
    let commit_size = std::mem::size_of::<usize>() as u16;
    PageHeaderSpec { timestamp_offset: 0, commit_offset: 8, commit_size }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHED_SWITCH_FORMAT: &str = r#"name: sched_switch
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

print fmt: "prev_comm=%s prev_pid=%d", REC->prev_comm, REC->prev_pid
"#;

    #[test]
    fn test_parse_sched_switch_format() {
        let format = parse_event_format(SCHED_SWITCH_FORMAT).unwrap();
        assert_eq!(format.id, 316);
        assert_eq!(format.name, "sched_switch");
        assert_eq!(format.common_fields.len(), 4);
        assert_eq!(format.fields.len(), 7);

        let prev_state = &format.fields[3];
        assert_eq!(prev_state.type_and_name, "long prev_state");
        assert_eq!(prev_state.offset, 32);
        assert_eq!(prev_state.size, 8);
        assert!(prev_state.is_signed);
    }

    #[test]
    fn test_missing_id_is_rejected() {
        let text = "name: foo\nformat:\n\tfield:int bar;\toffset:0;\tsize:4;\tsigned:1;\n";
        assert!(parse_event_format(text).is_none());
    }

    #[test]
    fn test_name_extraction() {
        assert_eq!(name_from_type_and_name("char prev_comm[16]"), Some("prev_comm"));
        assert_eq!(name_from_type_and_name("__data_loc char[] name"), Some("name"));
        assert_eq!(name_from_type_and_name("unsigned long args[6]"), Some("args"));
        assert_eq!(name_from_type_and_name("void * func"), Some("func"));
        assert_eq!(name_from_type_and_name("char *buf"), Some("buf"));
        assert_eq!(name_from_type_and_name(""), None);
    }

    #[test]
    fn test_parse_page_header_64bit() {
        let text = "\tfield: u64 timestamp;\toffset:0;\tsize:8;\tsigned:0;\n\
                    \tfield: local_t commit;\toffset:8;\tsize:8;\tsigned:1;\n\
                    \tfield: int overwrite;\toffset:8;\tsize:1;\tsigned:1;\n\
                    \tfield: char data;\toffset:16;\tsize:4080;\tsigned:0;\n";
        let spec = parse_page_header_spec(text).unwrap();
        assert_eq!(spec.timestamp_offset, 0);
        assert_eq!(spec.commit_offset, 8);
        assert_eq!(spec.commit_size, 8);
        assert_eq!(spec.data_offset(), 16);
    }

    #[test]
    fn test_parse_page_header_32bit() {
        let text = "\tfield: u64 timestamp;\toffset:0;\tsize:8;\tsigned:0;\n\
                    \tfield: local_t commit;\toffset:8;\tsize:4;\tsigned:1;\n\
                    \tfield: char data;\toffset:12;\tsize:4084;\tsigned:0;\n";
        let spec = parse_page_header_spec(text).unwrap();
        assert_eq!(spec.commit_size, 4);
        assert_eq!(spec.data_offset(), 12);
    }

    #[test]
    fn test_page_header_fallback_matches_word_size() {
        let spec = fallback_page_header_spec();
        assert_eq!(spec.timestamp_offset, 0);
        assert_eq!(spec.commit_offset, 8);
        assert_eq!(usize::from(spec.commit_size), std::mem::size_of::<usize>());
    }
}
