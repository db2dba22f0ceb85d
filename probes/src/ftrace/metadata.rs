//! Per-session decode metadata
//!
//! Miscellaneous information accumulated while parsing events for one
//! session: seen pids (for downstream /proc scrapers), renamed pids, inode
//! and device ids, fds produced by syscalls, and the kernel-address interning
//! table backing symbol references. Cleared by the owner after each read
//! tick, once the interested consumers have drained it.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct SessionMetadata {
    pub pids: BTreeSet<i32>,
    pub rename_pids: BTreeSet<i32>,
    pub inode_and_device: BTreeSet<(u64, u64)>,
    /// `(pid, fd)` pairs from fd-returning syscalls.
    pub fds: BTreeSet<(i32, u64)>,

    /// Kernel addresses in interning order; index i holds the address with
    /// symbol index i + 1 (no symbol has index 0).
    kernel_addrs: Vec<u64>,
    addr_indices: HashMap<u64, u32>,
    /// Watermark of symbol indices already written to the output. Bundles
    /// only emit entries above it; a value of 0 means the next write starts
    /// an incremental-state sequence.
    pub last_symbol_index_written: u32,

    last_seen_device_id: u64,
    last_seen_common_pid: i32,
}

impl SessionMetadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pid(&mut self, pid: i32) {
        self.pids.insert(pid);
    }

    pub fn add_common_pid(&mut self, pid: i32) {
        self.last_seen_common_pid = pid;
        self.add_pid(pid);
    }

    #[must_use]
    pub fn last_seen_common_pid(&self) -> i32 {
        self.last_seen_common_pid
    }

    pub fn add_rename_pid(&mut self, pid: i32) {
        self.rename_pids.insert(pid);
    }

    pub fn add_device(&mut self, device_id: u64) {
        self.last_seen_device_id = device_id;
    }

    pub fn add_inode(&mut self, inode: u64) {
        self.inode_and_device.insert((inode, self.last_seen_device_id));
    }

    pub fn add_fd(&mut self, fd: u64) {
        self.fds.insert((self.last_seen_common_pid, fd));
    }

    /// Intern a kernel address, returning its symbol index. Indices are
    /// assigned monotonically starting at 1.
    pub fn add_symbol_addr(&mut self, addr: u64) -> u32 {
        if let Some(&index) = self.addr_indices.get(&addr) {
            return index;
        }
        self.kernel_addrs.push(addr);
        let index = self.kernel_addrs.len() as u32;
        self.addr_indices.insert(addr, index);
        index
    }

    /// Addresses with indices above the written watermark, i.e. the entries
    /// the next finalized bundle must emit.
    #[must_use]
    pub fn unwritten_symbol_addrs(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        let start = self.last_symbol_index_written as usize;
        self.kernel_addrs[start.min(self.kernel_addrs.len())..]
            .iter()
            .enumerate()
            .map(move |(i, &addr)| (start as u32 + i as u32 + 1, addr))
    }

    #[must_use]
    pub fn symbol_count(&self) -> u32 {
        self.kernel_addrs.len() as u32
    }

    /// Reset the cross-event state at the end of each decoded event.
    pub fn finish_event(&mut self) {
        self.last_seen_device_id = 0;
        self.last_seen_common_pid = 0;
    }

    pub fn clear(&mut self) {
        self.pids.clear();
        self.rename_pids.clear();
        self.inode_and_device.clear();
        self.fds.clear();
        self.kernel_addrs.clear();
        self.addr_indices.clear();
        self.last_symbol_index_written = 0;
        self.finish_event();
    }
}
