#![forbid(unsafe_code)]
//! `shfs-admin` — administration of an SHFS volume.
//!
//! Mounts the volume found on the given member devices, executes the action
//! tokens in command-line order, and unmounts. Unmount is the sole writeback
//! point and runs even after action failures or a cancellation.

mod args;

use anyhow::{Context, Result};
use shfs_core::{Volume, run_actions};
use shfs_types::CancelFlag;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use std::io::Write;
use std::process::ExitCode;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Exit status used when a signal cancelled the run.
const EXIT_CANCELLED: u8 = (-2_i8) as u8;

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "warn,shfs_core=debug,shfs_block=debug,shfs_cli=debug",
        _ => "warn,shfs_core=trace,shfs_block=trace,shfs_cli=trace",
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

fn install_signal_hooks(cancel: &CancelFlag) -> Result<()> {
    for signal in [SIGINT, SIGTERM, SIGQUIT] {
        signal_hook::flag::register(signal, cancel.shared())
            .with_context(|| format!("failed to install handler for signal {signal}"))?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let invocation = match args::parse_from(std::env::args_os()) {
        Ok(invocation) => invocation,
        Err(err) => {
            if let Some(clap_err) = err.downcast_ref::<clap::Error>() {
                use clap::error::ErrorKind;
                if matches!(
                    clap_err.kind(),
                    ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
                ) {
                    let _ = clap_err.print();
                    return ExitCode::SUCCESS;
                }
            }
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(invocation.verbosity);

    let cancel = CancelFlag::new();
    if let Err(err) = install_signal_hooks(&cancel) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    match run(&cancel, &invocation) {
        Ok(summary) => {
            if summary.cancelled {
                eprintln!("Cancelled");
                return ExitCode::from(EXIT_CANCELLED);
            }
            if summary.failed > 0 {
                eprintln!("Some commands failed");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cancel: &CancelFlag, invocation: &args::Invocation) -> Result<shfs_core::RunSummary> {
    if cancel.is_set() {
        return Ok(shfs_core::RunSummary {
            cancelled: true,
            ..Default::default()
        });
    }

    let mut volume =
        Volume::mount(cancel, &invocation.devices).context("could not mount SHFS volume")?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let summary = run_actions(cancel, &mut volume, &invocation.actions, &mut out);
    let _ = out.flush();

    // Unmount is best-effort even after failures; a writeback error means the
    // on-disk index may be stale.
    if let Err(err) = volume.unmount() {
        warn!("unmount writeback failed, the volume may be corrupted: {err}");
        return Ok(shfs_core::RunSummary {
            failed: summary.failed + 1,
            ..summary
        });
    }

    Ok(summary)
}
