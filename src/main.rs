mod doctor;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use lattice_core::config::{CoordinatorConfig, ScheduledDagConfig};
use lattice_core::event::EventBus;
use lattice_core::traits::EngineLauncher;
use lattice_core::types::{CoordinatorEvent, DagDef, EngineKind};
use lattice_dag::DagPartitioner;
use lattice_engine::{build_launcher, TcpEngineClient};
use lattice_jobs::{HealthCheckTask, JobManager, JobStatusTable, Schedule, Scheduler};
use lattice_session::{DagLoadTask, EngineRouter, SessionManager};

#[derive(Parser)]
#[command(name = "lattice", version, about = "Control plane for a distributed graph platform")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "lattice.toml", env = "LATTICE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration
    Config,
    /// Split a DAG file into dispatch segments and print them
    Partition {
        /// DAG in JSON wire format
        dag: PathBuf,
        /// Print the segments as JSON
        #[arg(long)]
        json: bool,
    },
    /// Bring the engines up, run one DAG, and tear them down again
    Run {
        /// DAG in JSON wire format
        dag: PathBuf,
    },
    /// Run the coordinator: engines, health checks and scheduled jobs
    Daemon,
    /// Check the configuration and the engine deployment
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lattice=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle commands that need no config first
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "lattice", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Partition { dag, json } => return partition_file(dag, *json),
        _ => {}
    }

    let config = if cli.config.exists() {
        CoordinatorConfig::load(&cli.config)?
    } else {
        eprintln!(
            "Warning: {} not found, using defaults (no engines configured)",
            cli.config.display()
        );
        CoordinatorConfig::default()
    };
    let config_dir = cli
        .config
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Doctor => {
            println!("Lattice Doctor");
            println!("==============");
            doctor::run_doctor(&config, &config_dir);
        }
        Commands::Run { dag } => {
            let dag = read_dag(&dag)?;
            let coordinator = Coordinator::start(&config, CancellationToken::new()).await?;
            let session = coordinator.sessions.open_session();
            let outcome = session.run_dag(&dag).await;
            coordinator.sessions.close_session(session.id());
            coordinator.shutdown().await;

            let report = outcome?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Daemon => {
            info!("Starting coordinator daemon");
            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();

            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down daemon...");
                cancel_clone.cancel();
            });

            let coordinator = Coordinator::start(&config, cancel.clone()).await?;

            if let Some(ref hc) = config.health_check {
                if hc.enabled {
                    let task = HealthCheckTask::new(coordinator.launchers.clone());
                    coordinator.sessions.jobs().submit(
                        Arc::new(task),
                        Schedule::Every(Duration::from_secs(hc.interval_secs.max(1))),
                    );
                    info!(interval_secs = hc.interval_secs, "Health check scheduled");
                }
            }

            for job in &config.jobs {
                if let Err(e) = schedule_dag_job(&coordinator.sessions, job, &config_dir) {
                    error!(job = %job.name, error = %e, "Scheduled job rejected");
                }
            }

            cancel.cancelled().await;
            coordinator.shutdown().await;
        }
        Commands::Partition { .. } | Commands::Completions { .. } => {
            unreachable!("handled before config load")
        }
    }

    Ok(())
}

/// Running engines plus the session layer dispatching to them.
struct Coordinator {
    launchers: Vec<Arc<dyn EngineLauncher>>,
    sessions: SessionManager,
    cancel: CancellationToken,
}

impl Coordinator {
    async fn start(config: &CoordinatorConfig, cancel: CancellationToken) -> anyhow::Result<Self> {
        let event_bus = Arc::new(EventBus::new(config.coordinator.event_capacity));
        spawn_event_logger(&event_bus, cancel.clone());

        let mut launchers: Vec<Arc<dyn EngineLauncher>> = Vec::new();
        let mut router = EngineRouter::new();
        for kind in EngineKind::ALL {
            let Some(launcher_config) = config.engines.get(kind) else {
                continue;
            };
            let launcher = build_launcher(kind, launcher_config, Some(event_bus.clone()));
            if let Err(e) = launcher.start().await {
                error!(engine = %kind, error = %e, "Engine failed to start");
                for line in launcher.recent_output() {
                    eprintln!("  [{}] {}", kind, line);
                }
                stop_all(&launchers).await;
                return Err(e).with_context(|| format!("starting {} engine", kind));
            }
            router.register(Arc::new(TcpEngineClient::new(launcher.clone())));
            launchers.push(launcher);
        }
        if launchers.is_empty() {
            warn!("No engines configured, only coordinator-local operations can run");
        }

        let scheduler = Arc::new(Scheduler::new(cancel.clone()));
        let driver = scheduler.clone();
        tokio::spawn(async move {
            driver.run().await;
        });
        let jobs = Arc::new(
            JobManager::new(
                scheduler,
                Arc::new(JobStatusTable::new()),
                Some(event_bus.clone()),
            )
            .with_history_limit(config.coordinator.job_history_limit),
        );
        let sessions = SessionManager::new(config, router, jobs, event_bus);

        Ok(Self {
            launchers,
            sessions,
            cancel,
        })
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        stop_all(&self.launchers).await;
    }
}

async fn stop_all(launchers: &[Arc<dyn EngineLauncher>]) {
    for launcher in launchers {
        if let Err(e) = launcher.stop(false).await {
            warn!(engine = %launcher.kind(), error = %e, "Engine did not stop cleanly");
        }
    }
}

fn spawn_event_logger(event_bus: &EventBus, cancel: CancellationToken) {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(CoordinatorEvent::SegmentFailed { session_id, engine, index, error }) => {
                    warn!(session = %session_id, engine = %engine, segment = index, error = %error, "Segment failed");
                }
                Ok(CoordinatorEvent::JobFinished { job_id, kind, status, .. }) => {
                    info!(job = %job_id, kind = %kind, status = %status, "Job finished");
                }
                Ok(other) => debug!(event = ?other, "Coordinator event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn schedule_dag_job(
    sessions: &SessionManager,
    job: &ScheduledDagConfig,
    config_dir: &Path,
) -> anyhow::Result<String> {
    let schedule = match (job.every_secs, job.cron.as_deref()) {
        (Some(secs), _) => Schedule::Every(Duration::from_secs(secs)),
        (None, Some(expr)) => Schedule::cron(expr)?,
        (None, None) => Schedule::Once(Duration::ZERO),
    };
    let path = config_dir.join(&job.dag_file);
    let task = DagLoadTask::from_file(&job.name, &path, sessions.context().clone())?;
    let id = sessions.jobs().submit(Arc::new(task), schedule);
    info!(job = %job.name, id = %id, dag = %path.display(), "Scheduled DAG job registered");
    Ok(id)
}

fn read_dag(path: &Path) -> anyhow::Result<DagDef> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading DAG file {}", path.display()))?;
    Ok(DagDef::from_json(&content)?)
}

fn partition_file(path: &Path, json: bool) -> anyhow::Result<()> {
    let dag = read_dag(path)?;
    let queue = DagPartitioner::default().partition(&dag)?;

    if json {
        let segments: Vec<_> = queue
            .iter()
            .map(|(engine, segment)| serde_json::json!({ "engine": engine, "ops": segment.ops() }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&segments)?);
        return Ok(());
    }

    println!("{} operations, {} segments", dag.len(), queue.len());
    for (i, (engine, segment)) in queue.iter().enumerate() {
        let keys: Vec<_> = segment.ops().iter().map(|op| op.key.as_str()).collect();
        println!("  [{}] {:<18} {}", i, engine.as_str(), keys.join(", "));
    }
    Ok(())
}
