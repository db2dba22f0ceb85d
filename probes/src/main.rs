use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use probes::cli::Args;
use probes::domain::types::SessionId;
use probes::ftrace::atrace::AtraceProcess;
use probes::ftrace::config::FtraceConfig;
use probes::ftrace::controller::{
    FrozenInstanceReader, FtraceController, NullObserver, FLUSH_TIMEOUT,
};
use probes::ftrace::symbolizer::NullSymbolizer;
use probes::ftrace::tracefs;
use probes::output::{JsonLinesSink, RecordSink};
use probes::preflight;

fn make_sink(output_file: Option<&File>) -> Result<Box<dyn RecordSink>> {
    match output_file {
        Some(file) => {
            let handle = file.try_clone().context("failed to clone output file handle")?;
            Ok(Box::new(JsonLinesSink::new(handle)))
        }
        None => Ok(Box::new(JsonLinesSink::new(std::io::stdout()))),
    }
}

fn open_output(path: Option<&Path>) -> Result<Option<File>> {
    path.map(|p| File::create(p).with_context(|| format!("failed to create {}", p.display())))
        .transpose()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    // Mode 1: hard reset of leftover global state (e.g. after a crash).
    if args.hard_reset {
        if tracefs::hard_reset_ftrace_state() {
            info!("ftrace state reset");
            return Ok(());
        }
        anyhow::bail!("could not reset ftrace state on any known mount point");
    }

    preflight::run_preflight_checks()?;
    preflight::check_tracefs_available()?;

    let output_file = open_output(args.output.as_deref())?;

    // Mode 2: drain a frozen secondary instance and exit.
    if let Some(instance_name) = &args.frozen_instance {
        let mut sink = make_sink(output_file.as_ref())?;
        let mut reader = FrozenInstanceReader::create(instance_name)?;
        reader.drain(sink.as_mut());
        sink.flush();
        return Ok(());
    }

    // Mode 3: live recording for the configured sessions.
    if args.config.is_empty() {
        anyhow::bail!("no session configs given; see --help");
    }

    let mut controller = FtraceController::create(
        Box::new(AtraceProcess::new()),
        Box::new(NullSymbolizer),
        Box::new(NullObserver),
    )?;

    let mut session_ids = Vec::new();
    for (index, config_path) in args.config.iter().enumerate() {
        let text = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config: FtraceConfig = serde_json::from_str(&text)
            .with_context(|| format!("invalid session config {}", config_path.display()))?;

        let id = SessionId(index as u64 + 1);
        let sink = make_sink(output_file.as_ref())?;
        let diagnostics = controller.add_session(id, config, sink)?;
        if !diagnostics.is_empty() {
            warn!(
                "{id} configured with diagnostics: unknown events {:?}, failed events {:?}, \
                 atrace {:?}",
                diagnostics.unknown_ftrace_events,
                diagnostics.failed_ftrace_events,
                diagnostics.atrace_errors
            );
        }
        controller.start_session(id)?;
        session_ids.push(id);
    }
    info!("recording {} session(s), tick period {} ms", session_ids.len(), controller.tick_period_ms());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        () = controller.run() => {}
        _ = &mut ctrl_c => {
            info!("received Ctrl+C, shutting down");
        }
        () = tokio::time::sleep(Duration::from_secs(args.duration)), if args.duration > 0 => {
            info!("duration limit reached ({}s), shutting down", args.duration);
        }
    }

    // Final drain, then undo all tracefs mutations.
    controller.flush(FLUSH_TIMEOUT);
    for id in session_ids {
        if let Some(mut sink) = controller.remove_session(id) {
            sink.flush();
        }
    }

    Ok(())
}
