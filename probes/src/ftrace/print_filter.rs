//! Content filtering for `ftrace/print` events
//!
//! Userspace annotation traffic all funnels through the single print
//! tracepoint, so sessions can install prefix rules over its `buf` field to
//! keep only the messages they care about. Atrace-style rules additionally
//! understand the `B|<pid>|name` message framing and match the part after
//! the pid.

use super::config::PrintFilterConfig;
use super::translation::{TranslationStrategy, TranslationTable};
use crate::domain::types::GroupAndName;

#[derive(Debug, Clone)]
enum RuleKind {
    PrefixMatch { prefix: String },
    AtraceMessage { before_pid_part: String, prefix: String },
}

#[derive(Debug, Clone)]
struct Rule {
    allow: bool,
    kind: RuleKind,
}

#[derive(Debug, Clone, Default)]
pub struct PrintFilter {
    rules: Vec<Rule>,
}

fn prefix_matches(prefix: &str, buf: &[u8]) -> bool {
    buf.len() >= prefix.len() && &buf[..prefix.len()] == prefix.as_bytes()
}

fn atrace_message_matches(before_pid_part: &str, after_pid_prefix: &str, buf: &[u8]) -> bool {
    let Some(rest) = buf.strip_prefix(before_pid_part.as_bytes()) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix(b"|") else {
        return false;
    };
    let digits = rest.iter().take_while(|c| c.is_ascii_digit()).count();
    let Some(rest) = rest.get(digits..) else { return false };
    let Some(rest) = rest.strip_prefix(b"|") else {
        return false;
    };
    prefix_matches(after_pid_prefix, rest)
}

impl PrintFilter {
    #[must_use]
    pub fn new(config: &PrintFilterConfig) -> PrintFilter {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                let kind = match &rule.atrace_msg {
                    Some(msg) => RuleKind::AtraceMessage {
                        before_pid_part: msg.kind.clone(),
                        prefix: msg.prefix.clone(),
                    },
                    None => {
                        RuleKind::PrefixMatch { prefix: rule.prefix.clone().unwrap_or_default() }
                    }
                };
                Rule { allow: rule.allow, kind }
            })
            .collect();
        PrintFilter { rules }
    }

    /// First matching rule wins; messages matching no rule are allowed.
    #[must_use]
    pub fn is_allowed(&self, buf: &[u8]) -> bool {
        for rule in &self.rules {
            let matches = match &rule.kind {
                RuleKind::PrefixMatch { prefix } => prefix_matches(prefix, buf),
                RuleKind::AtraceMessage { before_pid_part, prefix } => {
                    atrace_message_matches(before_pid_part, prefix, buf)
                }
            };
            if matches {
                return rule.allow;
            }
        }
        true
    }
}

/// A print filter bound to the runtime layout of `ftrace/print`.
#[derive(Debug, Clone)]
pub struct PrintFilterBinding {
    filter: PrintFilter,
    event_id: u16,
    event_size: u16,
    buf_field_offset: u16,
}

impl PrintFilterBinding {
    /// Fails (with `None`) when the print event or its `buf` field is not in
    /// the expected null-terminated-string shape.
    #[must_use]
    pub fn create(config: &PrintFilterConfig, table: &TranslationTable) -> Option<Self> {
        let print_event = table.event(&GroupAndName::new("ftrace", "print"))?;
        let buf_field = print_event.fields.iter().find(|f| f.ftrace_name == "buf")?;
        if buf_field.strategy != TranslationStrategy::CStringToString {
            return None;
        }
        Some(PrintFilterBinding {
            filter: PrintFilter::new(config),
            event_id: print_event.ftrace_event_id,
            event_size: print_event.size,
            buf_field_offset: buf_field.ftrace_offset,
        })
    }

    #[must_use]
    pub fn event_id(&self) -> u16 {
        self.event_id
    }

    /// Apply the filter to a raw record (bounds already checked by the page
    /// parser). Records too short to hold the event are let through for the
    /// regular decode path to diagnose.
    #[must_use]
    pub fn is_event_interesting(&self, record: &[u8]) -> bool {
        if usize::from(self.event_size) >= record.len() {
            return true;
        }
        let buf = &record[usize::from(self.buf_field_offset)..];
        // The buf field runs to the record's end; stop at the terminator.
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        self.filter.is_allowed(&buf[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftrace::config::{AtraceMessageRule, PrintFilterRule};

    fn prefix_rule(allow: bool, prefix: &str) -> PrintFilterRule {
        PrintFilterRule { allow, prefix: Some(prefix.to_string()), atrace_msg: None }
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let config = PrintFilterConfig {
            rules: vec![prefix_rule(false, "noisy:"), prefix_rule(true, "")],
        };
        let filter = PrintFilter::new(&config);
        assert!(!filter.is_allowed(b"noisy: spam"));
        assert!(filter.is_allowed(b"anything else"));
    }

    #[test]
    fn test_no_rules_allows_everything() {
        let filter = PrintFilter::new(&PrintFilterConfig::default());
        assert!(filter.is_allowed(b"whatever"));
    }

    #[test]
    fn test_atrace_message_rule() {
        let config = PrintFilterConfig {
            rules: vec![PrintFilterRule {
                allow: true,
                prefix: None,
                atrace_msg: Some(AtraceMessageRule {
                    kind: "B".to_string(),
                    prefix: "interesting".to_string(),
                }),
            }],
        };
        let filter = PrintFilter::new(&config);
        assert!(filter.is_allowed(b"B|1234|interesting_slice"));
        // Messages matching no rule default to allowed, so test rejection
        // with an explicit catch-all.
        let config = PrintFilterConfig {
            rules: vec![
                PrintFilterRule {
                    allow: true,
                    prefix: None,
                    atrace_msg: Some(AtraceMessageRule {
                        kind: "B".to_string(),
                        prefix: "interesting".to_string(),
                    }),
                },
                prefix_rule(false, ""),
            ],
        };
        let filter = PrintFilter::new(&config);
        assert!(filter.is_allowed(b"B|1|interesting"));
        assert!(!filter.is_allowed(b"B|1|boring"));
        assert!(!filter.is_allowed(b"B|nodigits|interesting"));
        assert!(!filter.is_allowed(b"C|1|interesting"));
    }
}
