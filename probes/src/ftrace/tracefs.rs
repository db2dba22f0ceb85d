//! Typed read/write interface to the tracefs file tree
//!
//! Reading `trace` produces human readable trace output; truncating it clears
//! all trace buffers for online CPUs. Reading `tracing_on` returns 1/0 if
//! tracing is enabled/disabled; writing toggles it without clearing buffers.
//!
//! Every operation maps to a single file access and nothing is cached here:
//! the config muxer owns all higher-level caching of kernel state. Writes
//! failing with EACCES/EPERM are reported as `false` and logged; callers for
//! which the failure breaks an invariant must surface it themselves.

use anyhow::{bail, Context, Result};
use log::{debug, error, warn};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use probes_common::CpuStats;

/// Candidate tracefs mount points, in preference order.
pub const TRACING_PATHS: &[&str] = &["/sys/kernel/tracing/", "/sys/kernel/debug/tracing/"];

/// Written when installing a kretprobe; bounds the number of in-flight
/// function instances the kernel tracks for the return probe.
const KRETPROBE_DEFAULT_MAXACTIVES: &str = "1024";

const RSS_STAT_THROTTLED_TRIGGER: &str =
    "hist:keys=mm_id,member:bucket=size/0x80000\
     :onchange($bucket).rss_stat_throttled(mm_id,curr,member,size)";

/// System page size; raw pipe reads and page parsing work at this
/// granularity.
#[allow(unsafe_code)] // sysconf requires unsafe
#[must_use]
pub fn sys_page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        return 4096;
    }
    sz as usize
}

/// The operations of the tracefs controller. The production implementation
/// is [`Tracefs`]; tests may substitute their own.
pub trait TracefsOps {
    fn root_path(&self) -> &Path;

    fn tracing_on(&self) -> bool;
    fn set_tracing_on(&self, on: bool) -> bool;
    /// True iff nobody else is using the instance (`current_tracer` is `nop`
    /// or unreadable).
    fn is_tracing_available(&self) -> bool;

    fn clear_trace(&self);
    fn clear_per_cpu_trace(&self, cpu: usize);

    fn current_tracer(&self) -> String;
    fn set_current_tracer(&self, tracer: &str) -> bool;
    fn reset_current_tracer(&self) -> bool;

    fn clock(&self) -> String;
    fn set_clock(&self, clock: &str) -> bool;
    fn available_clocks(&self) -> BTreeSet<String>;

    fn cpu_buffer_size_pages(&self) -> usize;
    fn set_cpu_buffer_size_pages(&self, pages: usize) -> bool;
    fn buffer_percent(&self) -> u32;
    fn set_buffer_percent(&self, percent: u32) -> bool;

    fn enable_event(&self, group: &str, name: &str) -> bool;
    fn disable_event(&self, group: &str, name: &str) -> bool;
    fn disable_all_events(&self) -> bool;
    fn event_names_for_group(&self, group: &str) -> BTreeSet<String>;

    fn create_kprobe_event(&self, group: &str, name: &str, is_retprobe: bool) -> bool;
    fn remove_kprobe_event(&self, group: &str, name: &str) -> bool;

    /// Writes the kernel-side raw_syscalls filter expression. An empty set
    /// disables the filter (record all syscalls).
    fn set_syscall_filter(&self, filter: &BTreeSet<usize>) -> bool;

    fn append_function_filters(&self, filters: &[String]) -> bool;
    fn clear_function_filters(&self) -> bool;
    fn append_function_graph_filters(&self, filters: &[String]) -> bool;
    fn clear_function_graph_filters(&self) -> bool;
    fn set_max_graph_depth(&self, depth: u32) -> bool;
    fn clear_max_graph_depth(&self) -> bool;

    fn set_event_tid_filter(&self, tids: &[String]) -> bool;
    fn clear_event_tid_filter(&self) -> bool;

    fn tracefs_option(&self, option: &str) -> Option<bool>;
    fn set_tracefs_option(&self, option: &str, enabled: bool) -> bool;
    fn tracing_cpumask(&self) -> Option<String>;
    fn set_tracing_cpumask(&self, cpumask: &str) -> bool;

    fn supports_rss_stat_throttled(&self) -> bool;
    fn setup_event_triggers(&self, group: &str, name: &str) -> bool;
    fn teardown_event_triggers(&self, group: &str, name: &str) -> bool;

    fn read_page_header_format(&self) -> String;
    fn read_event_format(&self, group: &str, name: &str) -> String;
    fn read_printk_formats(&self) -> String;
    fn read_cpu_stats(&self, cpu: usize) -> Option<CpuStats>;

    fn number_of_cpus(&self) -> usize;
    fn offline_cpus(&self) -> Option<Vec<u32>>;

    /// Opens `per_cpu/cpuN/trace_pipe_raw` nonblocking.
    fn open_pipe_for_cpu(&self, cpu: usize) -> Result<File>;
}

/// Production tracefs controller rooted at a concrete instance directory.
#[derive(Debug)]
pub struct Tracefs {
    root: PathBuf,
}

impl Tracefs {
    /// Open an instance rooted at `root`, verifying the `trace` file exists.
    pub fn create(root: impl Into<PathBuf>) -> Result<Tracefs> {
        let root = root.into();
        if !root.join("trace").exists() {
            bail!("no tracefs at {}", root.display());
        }
        Ok(Tracefs { root })
    }

    /// Try the known mount points in order; `instance_path` is either empty
    /// (the root instance) or `instances/<name>/`.
    pub fn create_guessing_mount_point(instance_path: &str) -> Result<Tracefs> {
        for prefix in TRACING_PATHS {
            let path = Path::new(prefix).join(instance_path);
            if let Ok(tracefs) = Tracefs::create(path) {
                return Ok(tracefs);
            }
        }
        bail!("tracefs not mounted (tried {:?})", TRACING_PATHS)
    }

    fn write_to_file(&self, rel: &str, value: &str) -> bool {
        write_file(&self.root.join(rel), value, false)
    }

    fn append_to_file(&self, rel: &str, value: &str) -> bool {
        write_file(&self.root.join(rel), value, true)
    }

    fn clear_file(&self, rel: &str) -> bool {
        OpenOptions::new().write(true).truncate(true).open(self.root.join(rel)).is_ok()
    }

    fn read_to_string(&self, rel: &str) -> String {
        fs::read_to_string(self.root.join(rel)).unwrap_or_default()
    }

    fn read_event_triggers(&self, group: &str, name: &str) -> Vec<String> {
        let text = self.read_to_string(&format!("events/{group}/{name}/trigger"));
        text.lines()
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_whitespace().next())
            .map(str::to_string)
            .collect()
    }

    fn create_event_trigger(&self, group: &str, name: &str, trigger: &str) -> bool {
        self.write_to_file(&format!("events/{group}/{name}/trigger"), trigger)
    }

    fn remove_event_trigger(&self, group: &str, name: &str, trigger: &str) -> bool {
        self.write_to_file(&format!("events/{group}/{name}/trigger"), &format!("!{trigger}"))
    }

    fn remove_all_event_triggers(&self, group: &str, name: &str) -> bool {
        let triggers = self.read_event_triggers(group, name);
        // Remove in reverse order since a trigger can depend on another
        // trigger created earlier.
        for trigger in triggers.iter().rev() {
            if !self.remove_event_trigger(group, name, trigger) {
                return false;
            }
        }
        true
    }
}

fn write_file(path: &Path, value: &str, append: bool) -> bool {
    // Tracefs ignores truncation, but plain files (in tests) would otherwise
    // keep stale tail bytes from longer previous values.
    let file = OpenOptions::new().write(true).append(append).truncate(!append).open(path);
    match file {
        Ok(mut f) => match f.write_all(value.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                debug!("failed to write '{}' to {}: {e}", value.escape_default(), path.display());
                false
            }
        },
        Err(e) => {
            debug!("failed to open {}: {e}", path.display());
            false
        }
    }
}

/// Parse a comma-separated list of CPU ranges, e.g. `0-3,5,7-9`, as found in
/// `/sys/devices/system/cpu/offline`. An empty string means no CPUs.
#[must_use]
pub fn parse_cpu_ranges(text: &str) -> Option<Vec<u32>> {
    let text = text.trim();
    let mut cpus = Vec::new();
    if text.is_empty() {
        return Some(cpus);
    }
    for range in text.split(',') {
        if let Some((start, end)) = range.split_once('-') {
            let start: u32 = start.trim().parse().ok()?;
            let end: u32 = end.trim().parse().ok()?;
            if end < start {
                return None;
            }
            cpus.extend(start..=end);
        } else {
            cpus.push(range.trim().parse().ok()?);
        }
    }
    Some(cpus)
}

/// Parse one `per_cpu/cpuN/stats` file.
#[must_use]
pub fn parse_cpu_stats(cpu: u32, text: &str) -> CpuStats {
    let mut stats = CpuStats { cpu, ..CpuStats::default() };
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        match key.trim() {
            "entries" => stats.entries = value.parse().unwrap_or(0),
            "overrun" => stats.overrun = value.parse().unwrap_or(0),
            "commit overrun" => stats.commit_overrun = value.parse().unwrap_or(0),
            "bytes" => stats.bytes_read = value.parse().unwrap_or(0),
            "oldest event ts" => stats.oldest_event_ts = value.parse().unwrap_or(0.0),
            "now ts" => stats.now_ts = value.parse().unwrap_or(0.0),
            "dropped events" => stats.dropped_events = value.parse().unwrap_or(0),
            "read events" => stats.read_events = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    stats
}

impl TracefsOps for Tracefs {
    fn root_path(&self) -> &Path {
        &self.root
    }

    fn tracing_on(&self) -> bool {
        self.read_to_string("tracing_on").starts_with('1')
    }

    fn set_tracing_on(&self, on: bool) -> bool {
        if !self.write_to_file("tracing_on", if on { "1" } else { "0" }) {
            error!("failed to write tracing_on in {}", self.root.display());
            return false;
        }
        log::info!("{} ftrace in {}", if on { "enabled" } else { "disabled" }, self.root.display());
        true
    }

    fn is_tracing_available(&self) -> bool {
        // events/enable can read as 0, 1 or X and is unreliable across
        // kernels; the tracer name is the only signal worth trusting. An
        // unreadable file is treated as available.
        let current_tracer = self.current_tracer();
        current_tracer == "nop" || current_tracer.is_empty()
    }

    fn clear_trace(&self) {
        if !self.clear_file("trace") {
            error!("failed to clear trace in {}", self.root.display());
            return;
        }
        // Truncating `trace` only resets buffers of online CPUs; offline
        // ones must be cleared one by one through their per_cpu files.
        let total = self.number_of_cpus();
        match self.offline_cpus() {
            Some(offline) => {
                for cpu in offline {
                    self.clear_per_cpu_trace(cpu as usize);
                }
            }
            None => {
                for cpu in 0..total {
                    self.clear_per_cpu_trace(cpu);
                }
            }
        }
    }

    fn clear_per_cpu_trace(&self, cpu: usize) {
        if !self.clear_file(&format!("per_cpu/cpu{cpu}/trace")) {
            warn!("failed to clear buffer for CPU {cpu}");
        }
    }

    fn current_tracer(&self) -> String {
        self.read_to_string("current_tracer").trim_end_matches('\n').to_string()
    }

    fn set_current_tracer(&self, tracer: &str) -> bool {
        self.write_to_file("current_tracer", tracer)
    }

    fn reset_current_tracer(&self) -> bool {
        self.set_current_tracer("nop")
    }

    fn clock(&self) -> String {
        let text = self.read_to_string("trace_clock");
        let Some(start) = text.find('[') else { return String::new() };
        let Some(end) = text[start..].find(']') else { return String::new() };
        text[start + 1..start + end].to_string()
    }

    fn set_clock(&self, clock: &str) -> bool {
        self.write_to_file("trace_clock", clock)
    }

    fn available_clocks(&self) -> BTreeSet<String> {
        self.read_to_string("trace_clock")
            .split_whitespace()
            .map(|name| name.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|name| !name.is_empty())
            .collect()
    }

    fn cpu_buffer_size_pages(&self) -> usize {
        let text = self.read_to_string("buffer_size_kb");
        // Before tracing starts the root instance reports something like
        // "7 (expanded: 1408)"; only the leading digits count.
        let digits: String = text.chars().take_while(char::is_ascii_digit).collect();
        let Ok(size_kb) = digits.parse::<usize>() else {
            warn!("failed to read per-cpu buffer size");
            return 1;
        };
        let page_kb = sys_page_size() / 1024;
        size_kb.div_ceil(page_kb).max(1)
    }

    fn set_cpu_buffer_size_pages(&self, pages: usize) -> bool {
        let kb = pages * (sys_page_size() / 1024);
        self.write_to_file("buffer_size_kb", &kb.to_string())
    }

    fn buffer_percent(&self) -> u32 {
        self.read_to_string("buffer_percent").trim().parse().unwrap_or(0)
    }

    fn set_buffer_percent(&self, percent: u32) -> bool {
        self.write_to_file("buffer_percent", &percent.to_string())
    }

    fn enable_event(&self, group: &str, name: &str) -> bool {
        // Synthetic events are backed by histogram triggers that must exist
        // before the event fires.
        self.setup_event_triggers(group, name);

        if self.write_to_file(&format!("events/{group}/{name}/enable"), "1") {
            return true;
        }
        self.append_to_file("set_event", &format!("{group}:{name}"))
    }

    fn disable_event(&self, group: &str, name: &str) -> bool {
        let ret = self.write_to_file(&format!("events/{group}/{name}/enable"), "0")
            || self.append_to_file("set_event", &format!("!{group}:{name}"));
        self.teardown_event_triggers(group, name);
        ret
    }

    fn disable_all_events(&self) -> bool {
        self.write_to_file("events/enable", "0")
    }

    fn event_names_for_group(&self, group: &str) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let path = self.root.join("events").join(group);
        let Ok(entries) = fs::read_dir(&path) else {
            debug!("unable to read events from {}", path.display());
            return names;
        };
        for entry in entries.flatten() {
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                if let Ok(name) = entry.file_name().into_string() {
                    names.insert(name);
                }
            }
        }
        names
    }

    fn create_kprobe_event(&self, group: &str, name: &str, is_retprobe: bool) -> bool {
        let probe = if is_retprobe {
            format!("r{KRETPROBE_DEFAULT_MAXACTIVES}:{group}/{name} {name}")
        } else {
            format!("p:{group}/{name} {name}")
        };
        debug!("writing \"{probe}\" >> kprobe_events");
        let path = self.root.join("kprobe_events");
        let file = OpenOptions::new().append(true).open(&path);
        match file.and_then(|mut f| f.write_all(probe.as_bytes())) {
            Ok(()) => true,
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                // Possibly left behind by a session that never tore down.
                debug!("kprobe event {group}/{name} already exists");
                true
            }
            Err(e) => {
                warn!("failed writing '{probe}' to kprobe_events: {e}");
                false
            }
        }
    }

    fn remove_kprobe_event(&self, group: &str, name: &str) -> bool {
        debug!("removing kprobe event {group}/{name}");
        self.append_to_file("kprobe_events", &format!("-:{group}/{name}"))
    }

    fn set_syscall_filter(&self, filter: &BTreeSet<usize>) -> bool {
        let expr = if filter.is_empty() {
            "0".to_string()
        } else {
            filter.iter().map(|id| format!("id == {id}")).collect::<Vec<_>>().join(" || ")
        };
        for event in ["sys_enter", "sys_exit"] {
            let rel = format!("events/raw_syscalls/{event}/filter");
            if !self.write_to_file(&rel, &expr) {
                error!("failed to write file: {rel}");
                return false;
            }
        }
        true
    }

    fn append_function_filters(&self, filters: &[String]) -> bool {
        let filter = filters.join("\n");
        // The same file accepts "func:command" actions which run regardless
        // of the active tracer and would leak across concurrent sessions of
        // the shared instance, so they are rejected wholesale.
        if filter.contains(':') {
            error!("function filter commands are disallowed");
            return false;
        }
        self.append_to_file("set_ftrace_filter", &filter)
    }

    fn clear_function_filters(&self) -> bool {
        self.clear_file("set_ftrace_filter")
    }

    fn append_function_graph_filters(&self, filters: &[String]) -> bool {
        self.append_to_file("set_graph_function", &filters.join("\n"))
    }

    fn clear_function_graph_filters(&self) -> bool {
        self.clear_file("set_graph_function")
    }

    fn set_max_graph_depth(&self, depth: u32) -> bool {
        self.write_to_file("max_graph_depth", &depth.to_string())
    }

    fn clear_max_graph_depth(&self) -> bool {
        self.write_to_file("max_graph_depth", "0")
    }

    fn set_event_tid_filter(&self, tids: &[String]) -> bool {
        self.write_to_file("set_event_pid", &tids.join(" "))
    }

    fn clear_event_tid_filter(&self) -> bool {
        self.clear_file("set_event_pid")
    }

    fn tracefs_option(&self, option: &str) -> Option<bool> {
        let value = self.read_to_string(&format!("options/{option}"));
        match value.trim() {
            "0" => Some(false),
            "1" => Some(true),
            _ => None,
        }
    }

    fn set_tracefs_option(&self, option: &str, enabled: bool) -> bool {
        self.write_to_file(&format!("options/{option}"), if enabled { "1" } else { "0" })
    }

    fn tracing_cpumask(&self) -> Option<String> {
        let mask = self.read_to_string("tracing_cpumask").trim().to_string();
        if mask.is_empty() {
            return None;
        }
        Some(mask)
    }

    fn set_tracing_cpumask(&self, cpumask: &str) -> bool {
        self.write_to_file("tracing_cpumask", cpumask)
    }

    fn supports_rss_stat_throttled(&self) -> bool {
        // If the trigger is already installed (possibly by a concurrent
        // session), don't churn it: match on the synthetic event name.
        let triggers = self.read_event_triggers("kmem", "rss_stat");
        if triggers.iter().any(|t| t.contains("rss_stat_throttled")) {
            return true;
        }
        self.setup_event_triggers("synthetic", "rss_stat_throttled")
            && self.teardown_event_triggers("synthetic", "rss_stat_throttled")
    }

    fn setup_event_triggers(&self, group: &str, name: &str) -> bool {
        let ret = if group == "synthetic" && name == "rss_stat_throttled" {
            self.remove_all_event_triggers("kmem", "rss_stat")
                && self.create_event_trigger("kmem", "rss_stat", RSS_STAT_THROTTLED_TRIGGER)
        } else {
            true
        };
        if !ret {
            warn!("failed to set up event triggers for {group}:{name}");
        }
        ret
    }

    fn teardown_event_triggers(&self, group: &str, name: &str) -> bool {
        let ret = if group == "synthetic" && name == "rss_stat_throttled" {
            self.remove_all_event_triggers("kmem", "rss_stat")
        } else {
            true
        };
        if !ret {
            warn!("failed to tear down event triggers for {group}:{name}");
        }
        ret
    }

    fn read_page_header_format(&self) -> String {
        self.read_to_string("events/header_page")
    }

    fn read_event_format(&self, group: &str, name: &str) -> String {
        self.read_to_string(&format!("events/{group}/{name}/format"))
    }

    fn read_printk_formats(&self) -> String {
        self.read_to_string("printk_formats")
    }

    fn read_cpu_stats(&self, cpu: usize) -> Option<CpuStats> {
        let text = self.read_to_string(&format!("per_cpu/cpu{cpu}/stats"));
        if text.is_empty() {
            return None;
        }
        Some(parse_cpu_stats(cpu as u32, &text))
    }

    fn number_of_cpus(&self) -> usize {
        // The per_cpu tree enumerates the instance's buffers including
        // offline CPUs, which is exactly the set of pipes to drain.
        if let Ok(entries) = fs::read_dir(self.root.join("per_cpu")) {
            let count = entries
                .flatten()
                .filter(|e| e.file_name().to_string_lossy().starts_with("cpu"))
                .count();
            if count > 0 {
                return count;
            }
        }
        num_configured_cpus()
    }

    fn offline_cpus(&self) -> Option<Vec<u32>> {
        let text = fs::read_to_string("/sys/devices/system/cpu/offline").ok()?;
        parse_cpu_ranges(&text)
    }

    fn open_pipe_for_cpu(&self, cpu: usize) -> Result<File> {
        let path = self.root.join(format!("per_cpu/cpu{cpu}/trace_pipe_raw"));
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))
    }
}

#[allow(unsafe_code)] // sysconf requires unsafe
fn num_configured_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n <= 0 {
        return 1;
    }
    n as usize
}

/// Method of last resort to reset ftrace state, e.g. after a crashed
/// predecessor. Avoids going through an instance handle since we don't know
/// what state the system is in.
pub fn hard_reset_ftrace_state() -> bool {
    for prefix in TRACING_PATHS {
        let prefix = Path::new(prefix);
        let mut res = true;
        res &= write_file(&prefix.join("tracing_on"), "0", false);
        res &= write_file(&prefix.join("buffer_size_kb"), "4", false);
        // Not checked: these files might not be accessible on locked-down
        // systems.
        write_file(&prefix.join("events/enable"), "0", false);
        write_file(&prefix.join("events/raw_syscalls/filter"), "0", false);
        write_file(&prefix.join("current_tracer"), "nop", false);
        res &= OpenOptions::new().write(true).truncate(true).open(prefix.join("trace")).is_ok();
        if res {
            return true;
        }
    }
    false
}
