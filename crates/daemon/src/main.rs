use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use docklite_backup_daemon::config::{self, Config};
use docklite_backup_daemon::{build_router, AppState};
use docklite_backup_engine::orchestrator::DEFAULT_STAGING_DIR;
use docklite_backup_engine::{
    DockerRuntime, Orchestrator, Scheduler, SchedulerHandle, SystemClock,
};
use docklite_backup_storage::{open_store, Stores};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (cfg, mode) = parse_args()?;

    let root = env::var("DOCKLITE_BACKUP_ROOT")
        .ok()
        .or_else(|| cfg.storage.root.clone())
        .unwrap_or_else(|| "./data".to_owned());

    let database_url = env::var("DATABASE_URL")
        .ok()
        .or_else(|| cfg.storage.database_url.clone());

    let stores = open_store(PathBuf::from(&root), database_url.as_deref())
        .await
        .context("opening backup store")?;
    let orchestrator = Arc::new(build_orchestrator(&stores, &cfg)?);

    match mode.as_deref() {
        Some("run-due") => run_due(orchestrator).await,
        Some("trigger") => {
            let job_id = trigger_job_id()?;
            trigger(orchestrator, job_id).await
        }
        Some("serve") | None => run_service(stores, orchestrator, &cfg).await,
        Some(other) => bail!("unknown mode: {other} (expected serve, run-due or trigger <job-id>)"),
    }
}

/// Parse CLI args, returning the loaded config and optional subcommand.
fn parse_args() -> Result<(Config, Option<String>)> {
    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut mode: Option<String> = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i >= args.len() {
                    bail!("--config requires a path argument");
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            other if mode.is_none() => {
                mode = Some(other.to_owned());
            }
            _ => {}
        }
        i += 1;
    }

    let cfg = match config_path {
        Some(path) => {
            info!(?path, "loading config file");
            config::load_config(&path)?
        }
        None => Config::default(),
    };

    Ok((cfg, mode))
}

/// The positional argument after `trigger`.
fn trigger_job_id() -> Result<i64> {
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => i += 1,
            "trigger" => {
                let Some(raw) = args.get(i + 1) else {
                    bail!("trigger requires a job id");
                };
                return raw
                    .parse()
                    .with_context(|| format!("invalid job id: {raw}"));
            }
            _ => {}
        }
        i += 1;
    }
    bail!("trigger requires a job id")
}

fn build_orchestrator(stores: &Stores, cfg: &Config) -> Result<Orchestrator> {
    let runtime = DockerRuntime::connect().context("connecting to docker")?;

    let staging_dir = cfg
        .storage
        .staging_dir
        .clone()
        .unwrap_or_else(|| DEFAULT_STAGING_DIR.to_owned());
    let pg_user = env::var("DOCKLITE_PG_USER")
        .ok()
        .or_else(|| cfg.docker.pg_user.clone())
        .unwrap_or_else(|| "docklite".to_owned());
    let timeout = match cfg.scheduler.target_timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    Ok(
        Orchestrator::new(stores, Arc::new(runtime), Arc::new(SystemClock))
            .with_staging_dir(staging_dir)
            .with_pg_user(pg_user)
            .with_target_timeout(timeout),
    )
}

/// One scheduler pass, waiting for every dispatched job.
async fn run_due(orchestrator: Arc<Orchestrator>) -> Result<()> {
    let summaries = Scheduler::new(orchestrator).tick().await.join().await;
    for summary in &summaries {
        info!(
            job_id = summary.job_id,
            skipped = summary.skipped,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "job finished"
        );
    }
    info!(jobs = summaries.len(), "run-due complete");
    Ok(())
}

async fn trigger(orchestrator: Arc<Orchestrator>, job_id: i64) -> Result<()> {
    let summary = orchestrator.trigger_job(job_id).await?;
    if summary.skipped {
        warn!(job_id, "job skipped: destination missing or disabled");
    } else {
        info!(
            job_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "triggered backup finished"
        );
    }
    Ok(())
}

async fn run_service(stores: Stores, orchestrator: Arc<Orchestrator>, cfg: &Config) -> Result<()> {
    let listen = env::var("DOCKLITE_BACKUP_LISTEN")
        .ok()
        .or_else(|| cfg.server.listen.clone())
        .unwrap_or_else(|| "127.0.0.1:8089".to_owned());

    let state = AppState {
        store: stores.store.clone(),
        orchestrator: orchestrator.clone(),
        api_token: env::var("DOCKLITE_BACKUP_API_TOKEN")
            .ok()
            .or_else(|| cfg.security.api_token.clone()),
        local_root: None,
    };

    let scheduler = SchedulerHandle::spawn(
        Scheduler::new(orchestrator)
            .with_interval(Duration::from_secs(cfg.scheduler.interval_secs.max(1)))
            .with_initial_delay(Duration::from_secs(cfg.scheduler.initial_delay_secs)),
    );

    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address: {listen}"))?;
    let app = build_router(state);

    info!(%addr, "starting backup API server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .await?;

    scheduler.shutdown().await;
    Ok(())
}
