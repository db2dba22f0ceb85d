//! Pre-flight checks for the probes daemon
//!
//! Validates system requirements before touching tracefs, and probes for
//! optional kernel features. Provides clear, actionable error messages when
//! requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};

/// Kernel version with reliable `buffer_percent` poll wakeups on the raw
/// trace pipes.
const POLL_REQUIRED_KERNEL_VERSION: (u32, u32) = (6, 9);

/// Run all pre-flight checks before opening tracefs.
pub fn run_preflight_checks() -> Result<()> {
    check_privileges()?;
    Ok(())
}

/// Check if running with sufficient privileges to write tracefs
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }
    // Non-root setups exist (group-writable tracefs), but flag the common
    // failure up front.
    log::warn!("not running as root; tracefs writes may fail with EACCES");
    Ok(())
}

fn kernel_release() -> Result<String> {
    let version_str = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .context("Failed to read /proc/sys/kernel/osrelease")?;
    Ok(version_str.trim().to_string())
}

/// Parse "major.minor..." from a kernel release string.
fn parse_major_minor(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Android GKI releases backport the poll fix; parse
/// `major.minor.sub-androidRELEASE-...` and accept recent ones.
fn parse_android_gki(release: &str) -> Option<(u32, u32, u32)> {
    let (version, rest) = release.split_once("-android")?;
    let (major, minor) = parse_major_minor(version)?;
    let android_release: u32 = rest
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor, android_release))
}

fn release_supports_buffer_watermark(release: &str) -> bool {
    if let Some((major, minor, android_release)) = parse_android_gki(release) {
        return android_release >= 15 || (android_release >= 14 && (major, minor) >= (6, 1));
    }
    parse_major_minor(release).is_some_and(|v| v >= POLL_REQUIRED_KERNEL_VERSION)
}

/// Whether the running kernel delivers reliable readability wakeups when a
/// per-cpu buffer passes the `buffer_percent` watermark. Callers must
/// tolerate this being unavailable: the periodic tick is always kept as the
/// backing mechanism.
#[must_use]
pub fn kernel_supports_buffer_watermark() -> bool {
    match kernel_release() {
        Ok(release) => release_supports_buffer_watermark(&release),
        Err(_) => false,
    }
}

/// Check that some tracefs mount is present and readable
pub fn check_tracefs_available() -> Result<()> {
    for prefix in crate::ftrace::tracefs::TRACING_PATHS {
        if std::path::Path::new(prefix).join("trace").exists() {
            return Ok(());
        }
    }
    bail!(
        "tracefs not found.\n\n\
         Expected a mount at /sys/kernel/tracing or /sys/kernel/debug/tracing.\n\
         Mount with: mount -t tracefs nodev /sys/kernel/tracing"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_major_minor() {
        assert_eq!(parse_major_minor("6.9.0-arch1-1"), Some((6, 9)));
        assert_eq!(parse_major_minor("5.15.148"), Some((5, 15)));
        assert_eq!(parse_major_minor("garbage"), None);
    }

    #[test]
    fn test_watermark_support_by_version() {
        assert!(release_supports_buffer_watermark("6.9.0-arch1-1"));
        assert!(release_supports_buffer_watermark("6.12.3"));
        assert!(!release_supports_buffer_watermark("6.8.1"));
        assert!(!release_supports_buffer_watermark("5.15.0-generic"));
    }

    #[test]
    fn test_watermark_support_gki() {
        assert!(release_supports_buffer_watermark("6.1.57-android14-11-gabcdef"));
        assert!(release_supports_buffer_watermark("6.6.30-android15-8-gabcdef"));
        assert!(!release_supports_buffer_watermark("5.15.110-android13-8-gabcdef"));
    }
}
