//! Reconciler: diffs the database's view of a (branch, component) against the
//! live pool directory and applies the difference atomically.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use crossbeam_queue::SegQueue;
use log::{error, info, warn};
use rayon::prelude::*;
use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction};

use crate::db::PVPackage;
use crate::ipc::{ChangeEvent, ChangeKind};
use crate::version;

use super::{mtime, sha256sum, PackageMeta, PKG_RELATION};

fn sha256sum_validate(path: &Path, expected: &str) -> Result<bool> {
    let f = std::fs::File::open(path)?;
    Ok(sha256sum(f)? == expected)
}

/// Phase 1: classify the database's existing inventory against the live pool.
///
/// Returns the set of absolute paths that are already up to date (to be excluded
/// from the Phase 2 walk) and the database rows to delete, each tagged with
/// whether the on-disk file was merely superseded (still present, changed) or
/// is genuinely missing.
pub fn classify_inventory(
    base_dir: &Path,
    existing: &[PVPackage],
) -> (Vec<PathBuf>, Vec<(PVPackage, bool)>) {
    let to_delete = SegQueue::new();
    let ignore = existing
        .par_iter()
        .filter_map(|p| {
            let filename = p.filename.as_deref().unwrap_or_default();
            let path = base_dir.join(filename);
            let stat = match path.metadata() {
                Ok(stat) if path.is_file() => stat,
                Ok(_) | Err(_) => {
                    to_delete.push((p.clone(), false));
                    return None;
                }
            };
            let size = p.size.unwrap_or(-1);
            if size < 0 {
                return None;
            }
            let unchanged = stat.len() == size as u64
                && (mtime(&stat).unwrap_or(0) == p.mtime.unwrap_or(0) as u64
                    || p.sha256
                        .as_deref()
                        .map(|expect| sha256sum_validate(&path, expect).unwrap_or(false))
                        .unwrap_or(false));
            if unchanged {
                Some(path)
            } else {
                to_delete.push((p.clone(), true));
                None
            }
        })
        .collect::<Vec<_>>();

    let mut deletions = Vec::with_capacity(to_delete.len());
    while let Some(item) = to_delete.pop() {
        deletions.push(item);
    }

    (ignore, deletions)
}

/// Recursively collect `*.deb` files under `<base>/pool/<branch>/<component>`,
/// excluding anything already known to be unchanged.
pub fn collect_new_files(
    component_root: &Path,
    ignore: &HashSet<PathBuf>,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(component_root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if !entry.file_name().to_string_lossy().ends_with(".deb") {
            continue;
        }
        let path = entry.into_path();
        if !ignore.contains(&path) {
            files.push(path);
        }
    }

    Ok(files)
}

/// realname derivation per the Repository data model: `all` maps to `noarch`,
/// and non-`main` components prefix the architecture.
fn realname(component: &str, architecture: &str) -> String {
    let arch = if architecture == "all" { "noarch" } else { architecture };
    if component == "main" {
        arch.to_string()
    } else {
        format!("{component}-{arch}")
    }
}

async fn upsert_repo(
    tx: &mut Transaction<'_, Postgres>,
    repo_name: &str,
    comppath: &str,
    branch: &str,
    component: &str,
    architecture: &str,
) -> Result<()> {
    sqlx::query!(
        "INSERT INTO pv_repos (name, path, branch, component, architecture, mtime)
         VALUES ($1, $2, $3, $4, $5, now())
         ON CONFLICT (name) DO UPDATE SET mtime = now()",
        repo_name,
        comppath,
        branch,
        component,
        architecture
    )
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Phase 4: apply one extracted (or degraded) Package Record, deciding its
/// disposition and emitting a change event when one is warranted.
async fn apply_package(
    tx: &mut Transaction<'_, Postgres>,
    compname: &str,
    comppath: &str,
    branch: &str,
    component: &str,
    package: &PackageMeta,
    superseded: &HashSet<String>,
) -> Result<Option<ChangeEvent>> {
    let name = realname(component, &package.deb.architecture);
    let repo = format!("{name}/{branch}");
    upsert_repo(tx, &repo, comppath, branch, component, &package.deb.architecture).await?;

    let mut event = None;
    if !package.degraded {
        if superseded.contains(&package.filename) {
            event = Some(ChangeEvent {
                component: compname.to_string(),
                package: package.deb.name.clone(),
                architecture: package.deb.architecture.clone(),
                kind: ChangeKind::Overwrite,
                old_version: Some(package.deb.version.clone()),
                new_version: Some(package.deb.version.clone()),
            });
        } else {
            let existing = sqlx::query!(
                "SELECT version, filename FROM pv_packages WHERE package = $1 AND repo = $2",
                package.deb.name,
                repo
            )
            .fetch_all(&mut **tx)
            .await?;

            if existing.is_empty() {
                event = Some(ChangeEvent {
                    component: compname.to_string(),
                    package: package.deb.name.clone(),
                    architecture: package.deb.architecture.clone(),
                    kind: ChangeKind::New,
                    old_version: None,
                    new_version: Some(package.deb.version.clone()),
                });
            } else {
                let oldest = existing
                    .iter()
                    .max_by(|a, b| version::cmp(&a.version, &b.version).cmp(&0))
                    .unwrap();
                match version::cmp(&oldest.version, &package.deb.version) {
                    v if v < 0 => {
                        event = Some(ChangeEvent {
                            component: compname.to_string(),
                            package: package.deb.name.clone(),
                            architecture: package.deb.architecture.clone(),
                            kind: ChangeKind::Upgrade,
                            old_version: Some(oldest.version.clone()),
                            new_version: Some(package.deb.version.clone()),
                        });
                    }
                    v if v > 0 => {
                        warn!(
                            "OLD {} {} {} (newer {} already present)",
                            package.deb.architecture, package.deb.name, package.deb.version, oldest.version
                        );
                    }
                    _ => {
                        info!("DUP {} == {}", oldest.filename, package.filename);
                        let key = (&package.deb.name, &package.deb.version, &repo);
                        sqlx::query!(
                            "DELETE FROM pv_package_sodep WHERE package=$1 AND version=$2 AND repo=$3",
                            key.0, key.1, key.2
                        ).execute(&mut **tx).await?;
                        sqlx::query!(
                            "DELETE FROM pv_package_files WHERE package=$1 AND version=$2 AND repo=$3",
                            key.0, key.1, key.2
                        ).execute(&mut **tx).await?;
                        sqlx::query!(
                            "DELETE FROM pv_package_dependencies WHERE package=$1 AND version=$2 AND repo=$3",
                            key.0, key.1, key.2
                        ).execute(&mut **tx).await?;
                        sqlx::query!(
                            "DELETE FROM pv_package_duplicate WHERE package=$1 AND version=$2 AND repo=$3",
                            key.0, key.1, key.2
                        ).execute(&mut **tx).await?;
                        sqlx::query!(
                            "INSERT INTO pv_package_duplicate SELECT * FROM pv_packages WHERE filename = $1",
                            oldest.filename
                        ).execute(&mut **tx).await?;
                        sqlx::query!(
                            "DELETE FROM pv_packages WHERE package=$1 AND version=$2 AND repo=$3",
                            key.0, key.1, key.2
                        ).execute(&mut **tx).await?;
                    }
                }
            }
        }
    }

    let control = json!(package.deb.control);
    let comparable_version = version::comparable_key(&package.deb.version);
    sqlx::query!(
        r#"INSERT INTO pv_packages
            (package, version, repo, architecture, filename, size, mtime, sha256, debtime, comparable_version, control, degraded)
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
         ON CONFLICT (package, version, repo) DO UPDATE SET
            filename = $5, size = $6, mtime = $7, sha256 = $8, debtime = $9,
            comparable_version = $10, control = $11, degraded = $12"#,
        package.deb.name,
        package.deb.version,
        repo,
        package.deb.architecture,
        package.filename,
        package.size as i64,
        package.mtime as i32,
        package.sha256,
        package.deb.debtime.map(|t| t as i32),
        comparable_version,
        control,
        package.degraded
    )
    .execute(&mut **tx)
    .await?;

    if let Some(contents) = &package.contents {
        for relation in PKG_RELATION {
            if let Some(value) = package.deb.control.get(*relation) {
                sqlx::query!(
                    "INSERT INTO pv_package_dependencies (package, version, repo, relationship, value)
                     VALUES ($1,$2,$3,$4,$5)
                     ON CONFLICT ON CONSTRAINT pv_package_dependencies_pkey DO UPDATE SET value = $5",
                    package.deb.name, package.deb.version, repo, relation, value
                )
                .execute(&mut **tx)
                .await?;
            }
        }
        for (soname, soversion) in &contents.so_provides {
            sqlx::query!(
                "INSERT INTO pv_package_sodep (package, version, repo, is_depend, so_name, so_version)
                 VALUES ($1,$2,$3,false,$4,$5)",
                package.deb.name, package.deb.version, repo, soname, soversion
            )
            .execute(&mut **tx)
            .await?;
        }
        for (soname, soversion) in &contents.so_depends {
            sqlx::query!(
                "INSERT INTO pv_package_sodep (package, version, repo, is_depend, so_name, so_version)
                 VALUES ($1,$2,$3,true,$4,$5)",
                package.deb.name, package.deb.version, repo, soname, soversion
            )
            .execute(&mut **tx)
            .await?;
        }
        for file in &contents.files {
            sqlx::query!(
                r#"INSERT INTO pv_package_files
                    (package, version, repo, path, name, size, ftype, perm, uid, gid, uname, gname)
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)"#,
                package.deb.name, package.deb.version, repo, file.path, file.name,
                file.size, file.ftype, file.perm, file.uid, file.gid, file.uname, file.gname
            )
            .execute(&mut **tx)
            .await?;
        }
    }

    Ok(event)
}

/// Run the Reconciler for one (branch, component) unit, end to end.
pub async fn reconcile(
    pool: &PgPool,
    base_dir: &Path,
    branch: &str,
    component: &str,
) -> Result<Vec<ChangeEvent>> {
    let comppath = format!("{branch}/{component}");
    let compname = format!("{branch}-{component}");
    let existing = crate::db::list_packages_in_component(pool, &comppath).await?;

    let base_dir_owned = base_dir.to_owned();
    let existing_clone = existing.clone();
    let (ignore, to_delete) = tokio::task::spawn_blocking(move || {
        classify_inventory(&base_dir_owned, &existing_clone)
    })
    .await?;

    let mut tx = pool.begin().await?;
    let mut events = Vec::new();
    let mut superseded = HashSet::new();
    let mut touched_repos: HashSet<String> = HashSet::new();
    for (row, is_superseded) in &to_delete {
        let filename = row.filename.as_deref().unwrap_or_default();
        let package = row.package.as_deref().unwrap_or_default();
        let version = row.version.as_deref().unwrap_or_default();
        let repo = row.repo.as_deref().unwrap_or_default();
        sqlx::query!(
            "DELETE FROM pv_package_sodep WHERE package=$1 AND version=$2 AND repo=$3",
            package, version, repo
        ).execute(&mut *tx).await?;
        sqlx::query!(
            "DELETE FROM pv_package_files WHERE package=$1 AND version=$2 AND repo=$3",
            package, version, repo
        ).execute(&mut *tx).await?;
        sqlx::query!(
            "DELETE FROM pv_package_dependencies WHERE package=$1 AND version=$2 AND repo=$3",
            package, version, repo
        ).execute(&mut *tx).await?;
        sqlx::query!(
            "DELETE FROM pv_package_duplicate WHERE package=$1 AND version=$2 AND repo=$3",
            package, version, repo
        ).execute(&mut *tx).await?;
        sqlx::query!(
            "DELETE FROM pv_packages WHERE package=$1 AND version=$2 AND repo=$3",
            package, version, repo
        ).execute(&mut *tx).await?;
        if !repo.is_empty() {
            touched_repos.insert(repo.to_string());
        }
        if *is_superseded {
            superseded.insert(filename.to_string());
        } else {
            events.push(ChangeEvent {
                component: compname.clone(),
                package: row.package.clone().unwrap_or_default(),
                architecture: row.architecture.clone().unwrap_or_default(),
                kind: ChangeKind::Delete,
                old_version: row.version.clone(),
                new_version: None,
            });
            info!("CLEAN {filename}");
        }
    }

    let component_root = base_dir.join("pool").join(branch).join(component);
    let ignore_set: HashSet<PathBuf> = ignore.into_iter().collect();
    let component_root_clone = component_root.clone();
    let new_files =
        tokio::task::spawn_blocking(move || collect_new_files(&component_root_clone, &ignore_set))
            .await??;
    info!("{} new or changed packages under {comppath}", new_files.len());

    let base_dir_owned = base_dir.to_owned();
    let paths: Vec<&Path> = new_files.iter().map(PathBuf::as_path).collect();
    let packages = tokio::task::block_in_place(|| super::scan_packages_advanced(&paths, &base_dir_owned));

    for package in &packages {
        match apply_package(&mut tx, &compname, &comppath, branch, component, package, &superseded)
            .await
        {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(e) => {
                error!("failed to apply {}: {e:?}", package.filename);
                return Err(e);
            }
        }
    }

    // Phase 5: repos touched only by a deletion never went through
    // upsert_repo, so their mtime needs bumping here explicitly.
    if !touched_repos.is_empty() {
        let repos: Vec<String> = touched_repos.into_iter().collect();
        sqlx::query!("UPDATE pv_repos SET mtime = now() WHERE name = ANY($1)", &repos)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realname_maps_all_to_noarch() {
        assert_eq!(realname("main", "all"), "noarch");
        assert_eq!(realname("main", "amd64"), "amd64");
        assert_eq!(realname("contrib", "amd64"), "contrib-amd64");
        assert_eq!(realname("contrib", "all"), "contrib-noarch");
    }
}
