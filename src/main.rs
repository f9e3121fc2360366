use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Result;
use log::{error, info, warn};
use sqlx::PgPool;
use tokio::task::spawn_blocking;

#[cfg(feature = "systemd")]
use sd_notify::NotifyState;

mod cli;
mod config;
mod db;
mod gc;
mod generate;
mod ipc;
mod scan;
mod sign;
mod version;

macro_rules! log_error {
    ($i:expr, $stage:expr) => {
        if let Err(err) = $i {
            error!("Error while {}: {}", $stage, err);
        }
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: cli::PVector = argh::from_env();
    env_logger::init();

    let config = config::parse_config(args.config.as_str())?;
    config::lint_config(&config);

    info!("Connecting to database...");
    let pool = db::connect_database(&config.config.db_pgconn).await?;
    info!("Running any pending migrations...");
    db::run_migrate(&pool).await?;

    #[cfg(feature = "systemd")]
    sd_notify::notify(true, &[NotifyState::Ready]).ok();

    match args.command {
        cli::PVectorCommand::Scan(_) => scan_action(&config, &pool).await?,
        cli::PVectorCommand::Release(_) => release_action(&config, &pool).await?,
        cli::PVectorCommand::Maintenance(_) => maintenance_action(&pool).await?,
        cli::PVectorCommand::Reset(_) => reset_action(&pool).await?,
        cli::PVectorCommand::GC(_) => gc_action(&config, &pool).await?,
        cli::PVectorCommand::Full(_) => full_action(&config, &pool).await?,
    }

    Ok(())
}

/// Group the (branch, component) pairs discovered under `pool/`, skipping
/// branches not present in the configured branch list unless auto-discover is
/// enabled, and warning about configured branches missing on disk.
fn group_discovered_branches(
    config: &config::Config,
    discovered: &[std::path::PathBuf],
) -> HashMap<String, Vec<String>> {
    let configured: HashSet<&str> = config.branch.iter().map(|b| b.name.as_str()).collect();
    let mut by_branch: HashMap<String, Vec<String>> = HashMap::new();

    for topic in discovered {
        let mut parts = topic.components();
        let branch = match parts.next() {
            Some(std::path::Component::Normal(p)) => p.to_string_lossy().into_owned(),
            _ => continue,
        };
        let component = match parts.next() {
            Some(std::path::Component::Normal(p)) => p.to_string_lossy().into_owned(),
            _ => continue,
        };
        if !config.config.discover && !configured.contains(branch.as_str()) {
            warn!("{branch} is not a configured branch, skipping");
            continue;
        }
        by_branch.entry(branch).or_default().push(component);
    }

    if !config.config.discover {
        for branch in &config.branch {
            if !by_branch.contains_key(&branch.name) {
                warn!("configured branch {} is not present under pool/", branch.name);
            }
        }
    }

    by_branch
}

async fn scan_action(config: &config::Config, pool: &PgPool) -> Result<()> {
    let base_dir = Path::new(&config.config.path);
    let pool_dir = base_dir.join("pool");
    let discovered = spawn_blocking(move || scan::discover_topics_components(pool_dir)).await??;
    info!("{} topics discovered.", discovered.len());

    let by_branch = group_discovered_branches(config, &discovered);

    let mut conn = config
        .config
        .change_notifier
        .as_deref()
        .map(ipc::redis_connect)
        .transpose()?;

    let before = db::max_repo_mtime(pool).await?;

    for (branch, components) in &by_branch {
        for component in components {
            info!("Reconciling {branch}/{component} ...");
            let events = match scan::reconcile(pool, base_dir, branch, component).await {
                Ok(events) => events,
                Err(err) => {
                    error!("Error while reconciling {branch}/{component}: {err}");
                    continue;
                }
            };
            if let Some(conn) = conn.as_mut() {
                log_error!(
                    ipc::publish_change_events(&events, conn),
                    format!("publishing change events for {branch}/{component}")
                );
            }
        }
    }

    let after = db::max_repo_mtime(pool).await?;
    if after > before {
        db::refresh_indexes(pool).await?;
    }

    Ok(())
}

async fn release_action(config: &config::Config, pool: &PgPool) -> Result<()> {
    let base_dir = Path::new(&config.config.path);
    let release_config = config::convert_branch_description_config(config);
    generate::render_releases(pool, base_dir, &release_config).await?;
    info!("Release generation finished.");

    Ok(())
}

async fn maintenance_action(pool: &PgPool) -> Result<()> {
    info!("Running database maintenance ...");
    db::run_maintenance(pool).await?;
    info!("Maintenance completed.");

    Ok(())
}

async fn gc_action(config: &config::Config, pool: &PgPool) -> Result<()> {
    let base_dir = Path::new(&config.config.path);
    gc::run_gc(pool, base_dir).await
}

async fn reset_action(pool: &PgPool) -> Result<()> {
    db::reset_database(pool).await
}

/// Scan, then gc, then maintenance and release concurrently. Errors in any
/// stage after scan are logged, not propagated, so the remaining stages
/// still run.
async fn full_action(config: &config::Config, pool: &PgPool) -> Result<()> {
    scan_action(config, pool).await?;

    let gc_result = gc_action(config, pool).await;
    log_error!(gc_result, "garbage collecting");

    let (maintenance_result, release_result) =
        tokio::join!(maintenance_action(pool), release_action(config, pool));
    log_error!(maintenance_result, "database maintenance");
    log_error!(release_result, "generating release files");

    Ok(())
}
