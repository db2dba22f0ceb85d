//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a kernel event id
//! where a session id is expected, and make function signatures more
//! expressive.

use std::fmt;

/// Tracing session ID
///
/// Identifies one configured session (data source) for the lifetime of its
/// `setup -> activate -> remove` cycle. Ids are handed out by the caller and
/// must be non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session#{}", self.0)
    }
}

/// A kernel tracepoint identified by its tracefs directory pair, e.g.
/// `sched/sched_switch`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupAndName {
    pub group: String,
    pub name: String,
}

impl GroupAndName {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self { group: group.into(), name: name.into() }
    }
}

impl fmt::Display for GroupAndName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display() {
        assert_eq!(SessionId(3).to_string(), "Session#3");
    }

    #[test]
    fn test_session_id_ordering() {
        assert!(SessionId(1) < SessionId(2));
    }

    #[test]
    fn test_group_and_name_display() {
        let gn = GroupAndName::new("sched", "sched_switch");
        assert_eq!(gn.to_string(), "sched/sched_switch");
    }
}
