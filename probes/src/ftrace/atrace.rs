//! Invocation of the `atrace` userspace helper
//!
//! Atrace categories and app names have userspace side effects (enabling
//! system properties consumed by instrumented processes) that the engine
//! delegates to the platform `atrace` binary. Only the invocation is modeled
//! here; the muxer owns the unioning policy across sessions.

use log::debug;
use std::process::Command;

/// Abstracts the helper binary so the muxer can be exercised without a
/// platform atrace on the host.
pub trait AtraceRunner {
    /// Whether `--only_userspace` is understood (concurrent sessions need
    /// it, since a full atrace run would clobber the kernel side).
    fn supports_userspace_only(&self) -> bool;
    /// Whether `--prefer_sdk` is understood.
    fn supports_prefer_sdk(&self) -> bool;
    /// Run the helper with the given arguments (argv0 excluded). On failure
    /// returns the helper's error output for the session diagnostics.
    fn run_atrace(&mut self, args: &[String]) -> Result<(), String>;
}

/// Production runner that spawns the `atrace` binary. Flag support is probed
/// once, at construction.
pub struct AtraceProcess {
    binary: String,
    supports_userspace_only: bool,
    supports_prefer_sdk: bool,
}

impl AtraceProcess {
    #[must_use]
    pub fn new() -> AtraceProcess {
        AtraceProcess::with_binary("atrace")
    }

    #[must_use]
    pub fn with_binary(binary: impl Into<String>) -> AtraceProcess {
        let binary = binary.into();
        let help = Command::new(&binary).arg("--help").output().map_or_else(
            |e| {
                debug!("atrace probe failed: {e}");
                String::new()
            },
            |out| {
                String::from_utf8_lossy(&out.stdout).to_string()
                    + &String::from_utf8_lossy(&out.stderr)
            },
        );
        AtraceProcess {
            binary,
            supports_userspace_only: help.contains("--only_userspace"),
            supports_prefer_sdk: help.contains("--prefer_sdk"),
        }
    }
}

impl Default for AtraceProcess {
    fn default() -> Self {
        AtraceProcess::new()
    }
}

impl AtraceRunner for AtraceProcess {
    fn supports_userspace_only(&self) -> bool {
        self.supports_userspace_only
    }

    fn supports_prefer_sdk(&self) -> bool {
        self.supports_prefer_sdk
    }

    fn run_atrace(&mut self, args: &[String]) -> Result<(), String> {
        debug!("running atrace {}", args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| format!("failed to exec atrace: {e}"))?;
        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::AtraceRunner;

    /// Records invocations; scripted to succeed or fail.
    #[derive(Default)]
    pub struct FakeAtrace {
        pub calls: Vec<Vec<String>>,
        pub fail: bool,
        pub userspace_only: bool,
        pub prefer_sdk: bool,
    }

    impl AtraceRunner for FakeAtrace {
        fn supports_userspace_only(&self) -> bool {
            self.userspace_only
        }

        fn supports_prefer_sdk(&self) -> bool {
            self.prefer_sdk
        }

        fn run_atrace(&mut self, args: &[String]) -> Result<(), String> {
            self.calls.push(args.to_vec());
            if self.fail {
                Err("scripted atrace failure".to_string())
            } else {
                Ok(())
            }
        }
    }
}
