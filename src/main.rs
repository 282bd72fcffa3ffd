//! pipeline-harness - Coordinator/Worker Harness for Staged Batch Pipelines
//!
//! Entry point for the CLI application. `run` starts the coordinator, the
//! hidden `worker` subcommand is what the coordinator launches per slot.

use anyhow::{Context, Result};
use clap::Parser;
use pipeline_harness::channel::{ControlChannel, ProcessLauncher, SocketPeer};
use pipeline_harness::config::{CliArgs, CliCommand, FleetConfig, RunArgs, WorkerArgs, WorkerConfig};
use pipeline_harness::directories::RunDirectories;
use pipeline_harness::error::{
    BootstrapError, HarnessError, EXIT_BOOTSTRAP_FAILURE, EXIT_CLEAN, EXIT_RUN_FAILURE,
};
use pipeline_harness::fleet::{FleetBootstrap, RunContext, StageCoordinator, WorkerAgent};
use pipeline_harness::progress::{print_header, print_summary, ProgressReporter};
use pipeline_harness::stage::ShellStage;
use pipeline_harness::LogLevel;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let result = match args.command {
        CliCommand::Run(run) => run_coordinator(run),
        CliCommand::Worker(worker) => run_worker(worker),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code_of(&e))
        }
    }
}

/// Exit code carried by the first harness error in the chain
fn exit_code_of(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<HarnessError>())
        .map(HarnessError::exit_code)
        .unwrap_or(EXIT_BOOTSTRAP_FAILURE)
}

fn run_coordinator(args: RunArgs) -> Result<u8> {
    setup_logging(args.effective_log_level())?;

    let config = FleetConfig::from_args(args)
        .map_err(HarnessError::from)
        .context("Invalid configuration")?;

    let dirs = RunDirectories::resolve(&config.policy.dir, &config.policy.name, &config.run_id)
        .and_then(|dirs| dirs.create_all().map(|()| dirs))
        .map_err(|e| {
            HarnessError::from(BootstrapError::Environment {
                reason: format!("cannot create run directories: {}", e),
            })
        })
        .context("Failed to prepare run directories")?;
    info!(run_dir = %dirs.run_dir().display(), "Run directories ready");

    let launcher = match &config.worker_program {
        Some(program) => ProcessLauncher::new(program),
        None => ProcessLauncher::current_exe()
            .map_err(HarnessError::from)
            .context("Cannot locate the worker executable")?,
    }
    .with_universe_size(config.universe_size)
    .with_connect_timeout(config.connect_timeout)
    .with_reap_timeout(config.reap_timeout);

    // Checked at stage boundaries only
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, stopping after the current stage...");
        stop_flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let bootstrap = FleetBootstrap::new(launcher, config.spawn_spec(), config.policy.capacity_hint);
    let (ctx, channel) = bootstrap
        .bootstrap()
        .map_err(HarnessError::from)
        .context("Failed to bring up the worker fleet")?;

    if config.show_progress {
        print_header(
            &config.run_id,
            &config.policy_path.display().to_string(),
            ctx.fleet_size(),
            &config.stages().names(),
        );
    }

    let progress = config
        .show_progress
        .then(|| ProgressReporter::new(config.stages().len()));

    let mut coordinator = StageCoordinator::new(ctx, channel, config.codec())
        .with_stop_signal(stop)
        .with_continue_between_stages(config.policy.continue_between_stages);

    let result = coordinator.run_observed(config.stages(), |event| {
        if let Some(ref p) = progress {
            p.observe(event);
        }
    });

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            if let Some(ref p) = progress {
                p.finish("Run failed");
            }
            return Err(e).context("Pipeline run failed");
        }
    };

    if let Some(ref p) = progress {
        p.finish_and_clear();
    }
    if config.show_progress {
        print_summary(&summary, config.stages().len());
    }

    for exit in summary.fleet.failures() {
        warn!(rank = exit.rank, code = ?exit.code, error = ?exit.error, "Worker exited abnormally");
    }

    if summary.fleet.all_succeeded() {
        Ok(EXIT_CLEAN)
    } else {
        Ok(EXIT_RUN_FAILURE)
    }
}

fn run_worker(args: WorkerArgs) -> Result<u8> {
    setup_logging(args.log_level)?;

    // The terminal delivers SIGINT to the whole process group; the
    // coordinator decides when the fleet stops
    ctrlc::set_handler(|| {
        info!("Interrupt ignored, waiting for the coordinator");
    })
    .context("Failed to set signal handler")?;

    let config = WorkerConfig::from_args(args)
        .map_err(HarnessError::from)
        .context("Invalid worker configuration")?;

    let peer = SocketPeer::from_env().context("Failed to join the fleet")?;
    let ctx = RunContext::new(
        config.run_id.clone(),
        config.policy_path.clone(),
        peer.rank(),
        peer.topology(),
        config.log_level,
    );

    let dirs = RunDirectories::resolve(&config.policy.dir, &config.policy.name, &config.run_id)
        .and_then(|dirs| dirs.create_all().map(|()| dirs))
        .map_err(HarnessError::from)
        .context("Failed to prepare run directories")?;

    let handler = ShellStage::new(&ctx, config.policy.stages.clone(), dirs);
    let summary = WorkerAgent::new(ctx, peer, config.policy.codec(), handler)
        .run()
        .context("Worker failed")?;

    info!(
        rank = summary.rank,
        stages = summary.stages_processed,
        sync_rounds = summary.sync_rounds,
        "Worker finished"
    );
    Ok(EXIT_CLEAN)
}

/// Setup tracing/logging; logs go to stderr so stdout stays for the summary
fn setup_logging(level: LogLevel) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.filter_directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
