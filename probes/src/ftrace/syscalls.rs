//! Raw syscall number lookup for the current architecture
//!
//! Session configs name syscalls symbolically (`sys_openat`); the kernel
//! filter expression and the sys_exit fd-scraping handler work on raw
//! numbers, which differ per architecture. Only the syscalls the engine has
//! a use for are tabulated.

/// Upper bound on syscall numbers we track; numbers are dense and small on
/// every supported architecture.
pub const MAX_SYSCALLS: usize = 512;

/// Sentinel "syscall id" marking that all syscalls should be recorded. Lets
/// an empty `syscall_events` config (record everything) be distinguished
/// from a config that never enabled raw_syscalls.
pub const ALL_SYSCALLS_ID: usize = MAX_SYSCALLS + 1;

#[cfg(target_arch = "x86_64")]
static SYSCALLS: &[(&str, usize)] = &[
    ("read", 0),
    ("write", 1),
    ("open", 2),
    ("close", 3),
    ("mmap", 9),
    ("ioctl", 16),
    ("pread64", 17),
    ("pwrite64", 18),
    ("dup", 32),
    ("dup2", 33),
    ("socket", 41),
    ("connect", 42),
    ("accept", 43),
    ("sendto", 44),
    ("recvfrom", 45),
    ("clone", 56),
    ("fork", 57),
    ("execve", 59),
    ("fcntl", 72),
    ("openat", 257),
    ("dup3", 292),
    ("pipe2", 293),
    ("accept4", 288),
];

#[cfg(target_arch = "aarch64")]
static SYSCALLS: &[(&str, usize)] = &[
    ("dup", 23),
    ("dup3", 24),
    ("fcntl", 25),
    ("ioctl", 29),
    ("openat", 56),
    ("close", 57),
    ("pipe2", 59),
    ("read", 63),
    ("write", 64),
    ("pread64", 67),
    ("pwrite64", 68),
    ("socket", 198),
    ("connect", 203),
    ("accept", 202),
    ("sendto", 206),
    ("recvfrom", 207),
    ("accept4", 242),
    ("clone", 220),
    ("execve", 221),
    ("mmap", 222),
];

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
static SYSCALLS: &[(&str, usize)] = &[];

#[derive(Debug, Clone, Copy)]
pub struct SyscallTable {
    entries: &'static [(&'static str, usize)],
}

impl SyscallTable {
    #[must_use]
    pub fn for_current_arch() -> SyscallTable {
        SyscallTable { entries: SYSCALLS }
    }

    /// Accepts both `sys_openat` and `openat` spellings.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<usize> {
        let name = name.strip_prefix("sys_").unwrap_or(name);
        self.entries.iter().find(|(n, _)| *n == name).map(|(_, id)| *id)
    }

    /// The (subjectively) most commonly used syscalls producing a new file
    /// descriptor as their return value, for downstream fd scraping.
    #[must_use]
    pub fn syscalls_returning_fd(&self) -> Vec<i64> {
        ["sys_open", "sys_openat", "sys_socket", "sys_dup", "sys_dup2", "sys_dup3"]
            .iter()
            .filter_map(|name| self.get_by_name(name))
            .map(|id| id as i64)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_either_spelling() {
        let table = SyscallTable::for_current_arch();
        #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
        {
            assert!(table.get_by_name("sys_openat").is_some());
            assert_eq!(table.get_by_name("openat"), table.get_by_name("sys_openat"));
        }
        assert_eq!(table.get_by_name("sys_not_a_syscall"), None);
    }

    #[test]
    fn test_fd_returning_set_is_nonempty_on_supported_arches() {
        let table = SyscallTable::for_current_arch();
        #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
        assert!(!table.syscalls_returning_fd().is_empty());
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        assert!(table.syscalls_returning_fd().is_empty());
    }
}
