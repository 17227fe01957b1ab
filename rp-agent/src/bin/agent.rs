//! `rp-agent`: the in-allocation agent binary. Loads the platform config
//! and allocation manifest, wires the pipeline (SPEC_FULL §B/§E.12), reads
//! task descriptions from an input file, runs them to completion, and
//! drains the Update queue to stdout until every task has reported a
//! terminal state or `Control::Shutdown` fires.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rp_agent::control::Control;
use rp_agent::executor::ExecutorEvent;
use rp_agent::pipeline::Pipeline;
use rp_agent::resource_manager::AllocationManifest;
use rp_agent::staging::SandboxRoots;
use rp_core::config::parse_platform_configs;
use rp_core::model::{Task, TaskDescription};
use tokio::sync::mpsc;
use tracing::{error, info};

/// RADICAL-Pilot in-allocation agent.
#[derive(Parser, Debug)]
#[command(name = "rp-agent", about = "Runs one pilot's task pipeline to completion")]
struct Args {
    /// Path to the platform configuration JSON (spec §6).
    #[arg(long)]
    platform_config: PathBuf,

    /// Key of this platform's entry in `platform_config`.
    #[arg(long)]
    platform_name: String,

    /// Number of nodes this pilot's allocation is expected to cover.
    #[arg(long)]
    expected_nodes: usize,

    /// Batch-system nodefile (one hostname per line) to build the
    /// allocation manifest from. Mutually exclusive with `--nodelist`.
    #[arg(long)]
    nodefile: Option<PathBuf>,

    /// SLURM_NODELIST-style node range expression, e.g. `node[01-04]`.
    #[arg(long)]
    nodelist: Option<String>,

    /// Newline-delimited JSON file of `{"uid": ..., "description": {...}}`
    /// tasks to run.
    #[arg(long)]
    tasks: PathBuf,

    /// Root directory for per-task sandboxes (the pilot sandbox). Defaults
    /// to `RP_PILOT_SANDBOX` if unset.
    #[arg(long)]
    pilot_sandbox: Option<PathBuf>,

    /// Client-side sandbox root for `client:///` staging URLs. Defaults to
    /// `RP_CLIENT_SANDBOX` if unset.
    #[arg(long)]
    client_sandbox: Option<PathBuf>,

    /// Session sandbox root for `session:///` staging URLs. Defaults to
    /// `RP_SESSION_SANDBOX` if unset.
    #[arg(long)]
    session_sandbox: Option<PathBuf>,
}

#[derive(serde::Deserialize)]
struct TaskInput {
    uid: String,
    description: TaskDescription,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = %e, "agent exiting");
        std::process::exit(e.exit_code());
    }
}

async fn run(args: Args) -> rp_core::error::Result<()> {
    let raw = std::fs::read_to_string(&args.platform_config)?;
    let mut configs = parse_platform_configs(&raw)?;
    let platform = configs.remove(&args.platform_name).ok_or_else(|| {
        rp_core::Error::Configuration(format!("no platform entry named '{}'", args.platform_name))
    })?;
    let launch_order = platform.launch_methods.order.clone();

    let manifest = match (&args.nodefile, &args.nodelist) {
        (Some(path), _) => AllocationManifest::from_nodefile(&std::fs::read_to_string(path)?)?,
        (None, Some(spec)) => AllocationManifest::from_slurm_nodelist(spec)?,
        (None, None) => {
            return Err(rp_core::Error::Configuration(
                "one of --nodefile or --nodelist is required".into(),
            ))
        }
    };

    let pilot_sandbox = args
        .pilot_sandbox
        .or_else(|| std::env::var("RP_PILOT_SANDBOX").ok().map(PathBuf::from))
        .ok_or_else(|| rp_core::Error::Configuration("no pilot sandbox configured".into()))?;
    let sandbox_roots = SandboxRoots::new(
        args.client_sandbox
            .or_else(|| std::env::var("RP_CLIENT_SANDBOX").ok().map(PathBuf::from))
            .unwrap_or_else(|| pilot_sandbox.clone()),
        args.session_sandbox
            .or_else(|| std::env::var("RP_SESSION_SANDBOX").ok().map(PathBuf::from))
            .unwrap_or_else(|| pilot_sandbox.clone()),
        pilot_sandbox.clone(),
    );

    let (pipeline, mut update_rx) = Pipeline::new(
        platform,
        &manifest,
        args.expected_nodes,
        &pilot_sandbox,
        launch_order,
        sandbox_roots,
    )?;
    let pipeline = Arc::new(pipeline);

    let tasks: Vec<Task> = std::fs::read_to_string(&args.tasks)?
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let input: TaskInput = serde_json::from_str(line)?;
            Ok(Task::new(input.uid, input.description))
        })
        .collect::<rp_core::error::Result<Vec<Task>>>()?;
    let total = tasks.len();
    info!(count = total, "loaded tasks");

    let control = Control::new(16);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ExecutorEvent>();

    let updates_handle = tokio::spawn(async move {
        while let Some(msg) = update_rx.recv().await {
            info!(uid = %msg.uid, state = ?msg.state, details = ?msg.details, "state update");
        }
    });

    // Every component subscribes to Control and processes commands in
    // arrival order (spec §4.6). The binary's own subscriber is the one
    // that actually reaches a running task: `cancel_task` cancels the named
    // uids, `cancel_pilot`/`shutdown` cancel everything still running.
    let control_handle = {
        let pipeline = Arc::clone(&pipeline);
        let mut control_rx = control.subscribe();
        tokio::spawn(async move {
            while let Ok(cmd) = control_rx.recv().await {
                match cmd {
                    rp_core::message::ControlCommand::CancelTask { uids } => {
                        for uid in uids {
                            pipeline.cancel(&uid).await;
                        }
                    }
                    rp_core::message::ControlCommand::CancelPilot
                    | rp_core::message::ControlCommand::Shutdown => {
                        for uid in pipeline.running_uids() {
                            pipeline.cancel(&uid).await;
                        }
                        break;
                    }
                }
            }
        })
    };

    for task in tasks {
        let pipeline = Arc::clone(&pipeline);
        let events_tx = events_tx.clone();
        tokio::spawn(async move { pipeline.run_task(task, events_tx).await });
    }
    drop(events_tx);

    let mut outstanding = total;
    let mut shutting_down = false;
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Some(event) => {
                        pipeline.handle_event(event);
                        outstanding = outstanding.saturating_sub(1);
                        if outstanding == 0 {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = &mut shutdown, if !shutting_down => {
                info!("ctrl-c received, broadcasting shutdown");
                shutting_down = true;
                control.publish(rp_core::message::ControlCommand::Shutdown);
            }
        }
    }

    // `Shutdown` only cancels running children; wait for the control
    // task to finish signaling them before tearing down the pipeline so
    // `Executor::cancel`'s SIGTERM/SIGKILL grace period actually runs.
    // Dropping `control` closes the broadcast channel so the control task's
    // receiver loop exits on its own when no shutdown was ever published.
    drop(control);
    let _ = control_handle.await;
    drop(pipeline);
    let _ = updates_handle.await;
    Ok(())
}
