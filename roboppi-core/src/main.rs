//! `roboppi`: the supervisor CLI (spec.md §6). Three subcommands —
//! `serve` runs the IPC-facing admission core against a scheduler peer;
//! `run-workflow` drives a single workflow definition to completion
//! in-process; `validate` checks a workflow definition without running
//! it. Grounded on the teacher's `knhk-workflow.rs` binary: a clap
//! derive `Cli`/`Commands` pair, one `match` arm per subcommand, errors
//! surfaced through `anyhow` at the process boundary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roboppi_admission::backpressure::BackpressureController;
use roboppi_admission::breaker_registry::CircuitBreakerRegistry;
use roboppi_admission::budget::ExecutionBudget;
use roboppi_admission::PermitGate;
use roboppi_core::admission_core::{AdmissionCore, PermitGateAdmission};
use roboppi_core::artifacts::{self, StateWriter, WorkflowEvent};
use roboppi_core::config::{RoboppiConfig, Transport};
use roboppi_core::metrics::MetricsCollector;
use roboppi_executor::hooks::HookRegistry;
use roboppi_executor::{EscalationManager, WorkflowExecutor};
use roboppi_gateway::WorkerDelegationGateway;
use roboppi_ipc::{FrameWriter, IpcServer, Message};
use roboppi_process::ProcessManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "roboppi", about = "Supervisor for coding-agent worker processes")]
struct Cli {
    /// Path to a TOML config file. Defaults are used if omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the IPC-facing admission core against a scheduler peer.
    Serve,
    /// Run a single workflow definition (JSON) to completion.
    RunWorkflow {
        file: PathBuf,
        /// Root directory each step's `workspace` field resolves against.
        /// Defaults to the workflow file's parent directory.
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Validate a workflow definition without running it.
    Validate { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RoboppiConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(config.verbose);

    let result = match cli.command {
        Commands::Serve => serve(config).await,
        Commands::RunWorkflow { file, workspace } => run_workflow(config, file, workspace).await,
        Commands::Validate { file } => validate(file).await,
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "roboppi exited with an error");
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_permit_gate(config: &RoboppiConfig) -> Result<Arc<PermitGate>> {
    let budget = Arc::new(ExecutionBudget::new((&config.budget).into()));
    let breakers = Arc::new(CircuitBreakerRegistry::new(
        config.breaker.failure_threshold,
        config.breaker.open_duration,
    ));
    let backpressure = Arc::new(
        BackpressureController::new((&config.backpressure).into()).context("invalid backpressure thresholds")?,
    );
    // No external load signal is wired in yet; `report_queue_metrics`
    // (spec.md §4.13) is logged but not fed back into admission
    // decisions, so the gate always sees normal load.
    Ok(Arc::new(PermitGate::new(budget, breakers, backpressure, Arc::new(|| 0.0))))
}

async fn serve(config: RoboppiConfig) -> Result<()> {
    let metrics = MetricsCollector::new();
    let _reporter = roboppi_core::metrics::spawn_reporter(Arc::clone(&metrics), config.metrics_interval);

    let gate = build_permit_gate(&config)?;
    let gateway = Arc::new(WorkerDelegationGateway::new(ProcessManager::new()));
    let (notify_tx, notify_rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    let core = Arc::new(AdmissionCore::new(
        Arc::clone(&gate),
        gateway,
        roboppi_executor::resilience::retry::RetryConfig::default(),
        notify_tx,
        metrics,
    ));
    let server = IpcServer::new(core);

    let mut sigterm = signal_stream();
    match config.transport {
        Transport::Stdio => {
            tracing::info!("roboppi serving over stdio");
            tokio::select! {
                _ = server.run(tokio::io::stdin(), FrameWriter::new(tokio::io::stdout()), notify_rx) => {}
                _ = sigterm.recv() => {
                    tracing::info!("received termination signal, shutting down");
                }
            }
        }
        Transport::Socket => {
            let socket_path = config
                .socket_path
                .clone()
                .context("transport = socket requires socket_path")?;
            let _ = tokio::fs::remove_file(&socket_path).await;
            let listener = tokio::net::UnixListener::bind(&socket_path)
                .with_context(|| format!("binding unix socket at {socket_path}"))?;
            tracing::info!(path = %socket_path, "roboppi serving over unix socket");

            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted.context("accepting unix socket connection")?;
                    let (reader, writer) = stream.into_split();
                    server.run(reader, FrameWriter::new(writer), notify_rx).await;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received termination signal before any connection, shutting down");
                }
            }
        }
    }
    gate.dispose();
    Ok(())
}

/// Resolves once on the first SIGTERM; a second resolves immediately
/// into a forced process exit (spec.md §6: "second polite signal forces
/// exit"). `Ctrl-C` on an interactive stdio session is covered by EOF on
/// stdin, which already ends `server.run` on its own.
struct SignalStream {
    inner: tokio::sync::mpsc::Receiver<()>,
}

impl SignalStream {
    async fn recv(&mut self) {
        self.inner.recv().await;
    }
}

fn signal_stream() -> SignalStream {
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    tokio::spawn(async move {
        let Ok(mut term) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) else {
            return;
        };
        term.recv().await;
        let _ = tx.send(()).await;
        term.recv().await;
        tracing::warn!("second termination signal received, forcing exit");
        std::process::exit(1);
    });
    SignalStream { inner: rx }
}

async fn run_workflow(config: RoboppiConfig, file: PathBuf, workspace: Option<PathBuf>) -> Result<()> {
    let definition = load_workflow(&file).await?;
    definition.validate().context("workflow failed validation")?;

    let workspace_root = workspace.unwrap_or_else(|| {
        file.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))
    });

    let metrics = MetricsCollector::new();
    let _reporter = roboppi_core::metrics::spawn_reporter(Arc::clone(&metrics), config.metrics_interval);

    let gate = build_permit_gate(&config)?;
    let admission = Arc::new(PermitGateAdmission::new(Arc::clone(&gate), metrics));
    let gateway = Arc::new(WorkerDelegationGateway::new(ProcessManager::new()));
    let hooks = Arc::new(HookRegistry::new(config.hooks.clone()));
    let escalation = Arc::new(EscalationManager::new((&config.escalation).into()));

    let executor = WorkflowExecutor::new(admission, gateway)
        .with_hooks(hooks)
        .with_escalation(escalation);

    let state_writer = StateWriter::new(workspace_root.clone());
    artifacts::append_event(&workspace_root, &WorkflowEvent::new("workflow_started", serde_json::json!({"name": definition.name})))
        .await
        .context("writing start event")?;

    let workflow_cancel = roboppi_common::CancelHandle::new();
    let runtime = executor.run(&definition, &workspace_root, workflow_cancel).await;

    state_writer.notify(runtime.clone()).await;
    state_writer.flush().await;
    artifacts::append_event(
        &workspace_root,
        &WorkflowEvent::new("workflow_finished", serde_json::json!({"status": runtime.status})),
    )
    .await
    .context("writing finish event")?;

    for event in executor.drain_escalations() {
        tracing::warn!(?event, "escalation raised during workflow run");
    }

    println!("{}", serde_json::to_string_pretty(&runtime).context("serializing final state")?);

    match runtime.status {
        roboppi_common::WorkflowStatus::Succeeded => Ok(()),
        _ => anyhow::bail!("workflow did not succeed: {:?}", runtime.status),
    }
}

async fn validate(file: PathBuf) -> Result<()> {
    let definition = load_workflow(&file).await?;
    match definition.validate() {
        Ok(()) => {
            println!("ok: {} steps, acyclic, referentially sound", definition.steps.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("invalid: {e}");
            anyhow::bail!("workflow validation failed");
        }
    }
}

async fn load_workflow(file: &Path) -> Result<roboppi_common::WorkflowDefinition> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading workflow file {}", file.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing workflow file {}", file.display()))
}

#[cfg(not(unix))]
compile_error!("roboppi's serve command relies on unix socket and signal support");
