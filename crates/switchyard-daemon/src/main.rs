//! Switchyard daemon
//!
//! Registers the configured worker processes and dispatches tasks to them
//! until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use switchyard_core::config::{load_config, load_config_from};
use switchyard_core::tracing_init::{crate_filter, init_tracing};
use switchyard_daemon::AgentDispatcher;
use switchyard_daemon::dispatch::{HealthLevel, OverallHealth};
use switchyard_daemon::registry::RegistryEvent;
use switchyard_daemon::transport::{LaunchSpec, ProcessLauncher};

#[derive(Parser, Debug)]
#[command(name = "switchyard")]
#[command(version, about = "Switchyard - dispatches work to long-running worker processes")]
struct Args {
    /// Explicit config file (skips the global and project config layers)
    #[arg(long, env = "SWITCHYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Project directory searched for `.switchyard/config.toml`
    #[arg(long, env = "SWITCHYARD_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Log level filter (overrides the configured level)
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "SWITCHYARD_LOG_JSON")]
    log_json: bool,

    /// Maximum concurrently executing tasks (overrides the configured value)
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Seconds between health summaries in the log; 0 disables them.
    #[arg(long, default_value_t = 60, env = "SWITCHYARD_HEALTH_INTERVAL")]
    health_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = match args.project_dir.clone() {
        Some(dir) => Some(dir),
        None => std::env::current_dir().ok(),
    };
    let mut config = match &args.config {
        Some(path) => load_config_from(path)?,
        None => load_config(project_dir.as_deref())?,
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(n) = args.max_concurrent {
        config.scheduler.max_concurrent = n;
    }
    config.logging.json |= args.log_json;
    config.validate()?;

    let level = &config.logging.level;
    let log_filter = format!(
        "{},{}",
        crate_filter(env!("CARGO_PKG_NAME"), level),
        crate_filter("switchyard-core", level)
    );
    init_tracing(&log_filter, config.logging.json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        max_concurrent = config.scheduler.max_concurrent,
        agents = config.agents.len(),
        "Starting switchyard"
    );

    let dispatcher = Arc::new(AgentDispatcher::new(Arc::new(ProcessLauncher), &config)?);
    info!(
        request_timeout_ms = dispatcher.registry().config().request_timeout_ms,
        task_timeout_ms = config.scheduler.task_timeout_ms,
        "Dispatcher started"
    );
    let event_log = tokio::spawn(log_registry_events(Arc::clone(&dispatcher)));

    for agent in &config.agents {
        match dispatcher
            .register_server(&agent.id, LaunchSpec::from(agent))
            .await
        {
            Ok(status) => info!(
                agent_id = %agent.id,
                pid = ?status.pid,
                tools = status.tools.len(),
                "Agent registered"
            ),
            Err(e) => warn!(agent_id = %agent.id, error = %e, "Agent registration failed"),
        }
    }

    let health_log = (args.health_interval_secs > 0).then(|| {
        tokio::spawn(log_health(
            Arc::clone(&dispatcher),
            Duration::from_secs(args.health_interval_secs),
        ))
    });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!("Switchyard ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    if let Some(handle) = health_log {
        handle.abort();
    }
    dispatcher.close().await;
    event_log.abort();

    info!("Switchyard stopped");
    Ok(())
}

async fn log_registry_events(dispatcher: Arc<AgentDispatcher>) {
    let mut events = dispatcher.registry().subscribe();
    loop {
        match events.recv().await {
            Ok(RegistryEvent::StateChanged { agent_id, state }) => {
                info!(agent_id = %agent_id, state = %state, "Worker state changed");
            }
            Ok(RegistryEvent::Notification {
                agent_id, method, ..
            }) => {
                info!(agent_id = %agent_id, method = %method, "Worker notification");
            }
            Ok(RegistryEvent::Exited {
                agent_id,
                code,
                signal,
            }) => {
                warn!(agent_id = %agent_id, code = ?code, signal = ?signal, "Worker exited");
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Registry event log lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_health(dispatcher: Arc<AgentDispatcher>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let report = dispatcher.health_check().await;
        let unhealthy: Vec<&str> = report
            .agents
            .iter()
            .filter(|a| a.health != HealthLevel::Healthy)
            .map(|a| a.agent_id.as_str())
            .collect();
        match report.status {
            OverallHealth::Healthy => info!(
                queue_depth = report.queue_depth,
                active_tasks = report.active_tasks,
                free_slots = report.free_slots,
                success_rate = report.success_rate,
                avg_latency_ms = report.average_latency_ms,
                "Health: healthy"
            ),
            OverallHealth::Degraded => warn!(
                queue_depth = report.queue_depth,
                active_tasks = report.active_tasks,
                free_slots = report.free_slots,
                longest_running_ms = ?report.running.first().map(|r| r.running_ms),
                success_rate = report.success_rate,
                unhealthy = ?unhealthy,
                "Health: degraded"
            ),
        }
    }
}
