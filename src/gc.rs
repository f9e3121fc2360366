//! Garbage collection: drops `pv_repos` rows, and the `dists/<branch>` tree
//! that goes with them, for branches no longer present under `pool/`.

use std::path::Path;

use anyhow::Result;
use log::{error, info};
use sqlx::PgPool;
use tokio::fs::remove_dir_all;

/// List all branches the database currently knows about.
async fn list_existing_branches(pool: &PgPool) -> Result<Vec<String>> {
    let records = sqlx::query!("SELECT DISTINCT branch FROM pv_repos")
        .fetch_all(pool)
        .await?;

    Ok(records.into_iter().map(|x| x.branch).collect())
}

/// Delete every row belonging to one branch: the repos and all tables keyed
/// by their `repo` name, in dependency order, so the `pv_repos` FK on
/// `pv_packages.repo` never sees an orphaned reference.
async fn delete_branch(pool: &PgPool, branch: &str) -> Result<()> {
    let repo_names: Vec<String> = sqlx::query!("SELECT name FROM pv_repos WHERE branch = $1", branch)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|r| r.name)
        .collect();

    let mut tx = pool.begin().await?;
    sqlx::query!("DELETE FROM pv_package_sodep WHERE repo = ANY($1)", &repo_names)
        .execute(&mut *tx)
        .await?;
    sqlx::query!("DELETE FROM pv_package_files WHERE repo = ANY($1)", &repo_names)
        .execute(&mut *tx)
        .await?;
    sqlx::query!("DELETE FROM pv_package_dependencies WHERE repo = ANY($1)", &repo_names)
        .execute(&mut *tx)
        .await?;
    sqlx::query!("DELETE FROM pv_package_duplicate WHERE repo = ANY($1)", &repo_names)
        .execute(&mut *tx)
        .await?;
    sqlx::query!("DELETE FROM pv_packages WHERE repo = ANY($1)", &repo_names)
        .execute(&mut *tx)
        .await?;
    sqlx::query!("DELETE FROM pv_repos WHERE branch = $1", branch)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(())
}

async fn clean_dist_files(to_remove: &[&String], mirror_root: &Path) {
    let mut tasks = Vec::new();
    for branch in to_remove {
        tasks.push(async move {
            info!("Deleting dists/{branch} ...");
            let path = mirror_root.join("dists").join(branch);
            if let Err(e) = remove_dir_all(path).await {
                error!("failed to remove dists/{branch}: {e}");
            }
        });
    }
    futures::future::join_all(tasks).await;
}

/// Drop every branch whose `pool/<branch>` directory is gone.
pub async fn run_gc<P: AsRef<Path>>(pool: &PgPool, mirror_root: P) -> Result<()> {
    let known_branches = list_existing_branches(pool).await?;
    let to_remove = known_branches
        .iter()
        .filter(|branch| !mirror_root.as_ref().join("pool").join(branch).is_dir())
        .collect::<Vec<_>>();

    if to_remove.is_empty() {
        info!("Nothing to do.");
        return Ok(());
    }
    info!(
        "Database knows {} branches, {} of which will be removed.",
        known_branches.len(),
        to_remove.len()
    );
    for branch in &to_remove {
        info!("Deleting from database: {branch} ...");
        delete_branch(pool, branch.as_str()).await?;
    }
    clean_dist_files(&to_remove, mirror_root.as_ref()).await;

    Ok(())
}
