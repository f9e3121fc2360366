use anyhow::Result;
use log::info;
use sqlx::types::chrono::{DateTime, Utc};
use sqlx::PgPool;

#[derive(Clone, Debug)]
pub struct PVPackage {
    pub package: Option<String>,
    pub version: Option<String>,
    pub repo: Option<String>,
    pub architecture: Option<String>,
    pub filename: Option<String>,
    pub size: Option<i64>,
    pub mtime: Option<i32>,
    pub sha256: Option<String>,
}

/// Run all pending migrations from the `migrations` directory.
pub async fn run_migrate(pool: &PgPool) -> Result<()> {
    Ok(sqlx::migrate!().run(pool).await?)
}

/// Connect to the database.
pub async fn connect_database(connspec: &str) -> Result<PgPool> {
    Ok(PgPool::connect(connspec).await?)
}

/// Run routine database maintenance: reclaim dead tuples and refresh planner statistics.
pub async fn run_maintenance(pool: &PgPool) -> Result<()> {
    info!("Running ANALYZE ...");
    sqlx::query!("ANALYZE").execute(pool).await?;
    info!("Running VACUUM ...");
    sqlx::query!("VACUUM").execute(pool).await?;

    Ok(())
}

/// Erase everything: used to recover from a corrupted index without re-deploying.
pub async fn reset_database(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    info!("Truncating all tables ...");
    sqlx::query!(
        "TRUNCATE TABLE pv_repos, pv_packages, pv_package_duplicate,
         pv_package_dependencies, pv_package_sodep, pv_package_files,
         dpkg_packages, dpkg_package_files"
    )
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    info!("Reset done.");

    Ok(())
}

/// The latest `mtime` across every Repository row, used to detect whether a
/// scan run touched anything worth refreshing secondary indexes for.
pub async fn max_repo_mtime(pool: &PgPool) -> Result<Option<DateTime<Utc>>> {
    let row = sqlx::query!("SELECT max(mtime) AS mtime FROM pv_repos")
        .fetch_one(pool)
        .await?;

    Ok(row.mtime)
}

/// Refresh planner statistics for the tables a scan run just touched.
pub async fn refresh_indexes(pool: &PgPool) -> Result<()> {
    info!("Refreshing secondary indexes ...");
    sqlx::query!("ANALYZE pv_repos, pv_packages, pv_package_files, pv_package_dependencies")
        .execute(pool)
        .await?;

    Ok(())
}

/// List all the packages known for a (branch, component) path, including
/// archives evicted as same-version collisions, so the Reconciler can classify
/// the complete recorded inventory.
pub async fn list_packages_in_component(pool: &PgPool, component: &str) -> Result<Vec<PVPackage>> {
    let records = sqlx::query_as!(
        PVPackage,
        r#"SELECT p.package, p.version, p.repo, p.architecture, p.filename, p.size, p.mtime, p.sha256
FROM pv_packages p INNER JOIN pv_repos r ON p.repo=r.name WHERE r.path=$1
UNION ALL
SELECT p.package, p.version, p.repo, p.architecture, p.filename, p.size, p.mtime, p.sha256
FROM pv_package_duplicate p INNER JOIN pv_repos r ON p.repo=r.name WHERE r.path=$1"#,
        component
    )
    .fetch_all(pool)
    .await?;

    Ok(records)
}
