//! Release Generator: materializes `Packages`/`Contents`/`Release` per branch
//! from the committed database, staged under `dists.new`, then published into
//! `dists` via an atomic three-way rename.

use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use async_compression::tokio::write::GzipEncoder;
use async_compression::Level;
use log::{error, info};
use rayon::prelude::*;
use sailfish::TemplateSimple;
use serde_json::Value;
use sqlx::PgPool;
use time::format_description::well_known::Rfc2822;
use tokio::fs::{create_dir_all, File};
use tokio::io::AsyncWriteExt;
use tokio::task::spawn_blocking;

use crate::config::{BranchRelease, ReleaseConfig};
use crate::scan::sha256sum;
use crate::sign;

/// Debian's canonical `Packages` stanza field order. Anything else present in
/// the raw control map is appended afterwards, sorted for determinism.
const CANONICAL_FIELD_ORDER: &[&str] = &[
    "Package",
    "Source",
    "Version",
    "Essential",
    "Priority",
    "Section",
    "Maintainer",
    "Original-Maintainer",
    "Build-Essential",
    "Architecture",
    "Origin",
    "Bugs",
    "Installed-Size",
    "Provides",
    "Pre-Depends",
    "Depends",
    "Recommends",
    "Suggests",
    "Conflicts",
    "Breaks",
    "Enhances",
    "Replaces",
    "Filename",
    "Size",
    "MD5sum",
    "SHA1",
    "SHA256",
    "Description",
    "Multi-Arch",
    "Homepage",
    "Tag",
    "Description-md5",
];

#[derive(Clone, Debug)]
struct PackageStanza {
    lines: Vec<(String, String)>,
}

#[derive(TemplateSimple)]
#[template(path = "Packages.stpl")]
struct PackagesTemplate {
    packages: Vec<PackageStanza>,
}

#[derive(TemplateSimple)]
#[template(path = "InRelease.stpl")]
struct InReleaseTemplate<'a> {
    origin: &'a str,
    label: &'a str,
    codename: &'a str,
    suite: &'a str,
    description: &'a str,
    date: String,
    valid_until: Option<String>,
    architectures: String,
    components: String,
    sha256_block: &'a [(String, u64, String)],
}

struct PackageIndexRow {
    package: String,
    version: String,
    architecture: String,
    filename: String,
    size: i64,
    sha256: Option<String>,
    control: Value,
}

struct ContentsRow {
    path: String,
    name: String,
    producers: Option<String>,
}

struct BranchMeta {
    branch: String,
    components: Vec<String>,
    architectures: Vec<String>,
}

/// Reassemble a control stanza: canonical columns (`Package`, `Version`,
/// `Architecture`, and the `Filename`/`Size`/`SHA256` trailer) plus whatever
/// was in the raw control map, ordered per Debian's canonical field order with
/// any leftover (vendor) fields appended alphabetically.
fn build_stanza(row: &PackageIndexRow) -> PackageStanza {
    let mut fields: HashMap<String, String> = match &row.control {
        Value::Object(map) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
        _ => HashMap::new(),
    };
    fields.insert("Package".to_string(), row.package.clone());
    fields.insert("Version".to_string(), row.version.clone());
    fields.insert("Architecture".to_string(), row.architecture.clone());
    fields.insert("Filename".to_string(), row.filename.clone());
    fields.insert("Size".to_string(), row.size.to_string());
    if let Some(sha256) = &row.sha256 {
        fields.insert("SHA256".to_string(), sha256.clone());
    }

    let mut lines = Vec::with_capacity(fields.len());
    for name in CANONICAL_FIELD_ORDER {
        if let Some(value) = fields.remove(*name) {
            lines.push((name.to_string(), value));
        }
    }
    let mut rest: Vec<(String, String)> = fields.into_iter().collect();
    rest.sort_by(|a, b| a.0.cmp(&b.0));
    lines.extend(rest);

    PackageStanza { lines }
}

/// Package Records whose filename starts with `pool/<branch>/<component>/`,
/// folding in the `dpkg_packages` companion table for the same component.
async fn fetch_package_rows(pool: &PgPool, comppath: &str) -> Result<Vec<PackageIndexRow>> {
    let mut rows = sqlx::query_as!(
        PackageIndexRow,
        r#"SELECT p.package, p.version, p.architecture, p.filename, p.size, p.sha256, p.control
           FROM pv_packages p INNER JOIN pv_repos r ON p.repo = r.name
           WHERE r.path = $1 AND p.degraded = false"#,
        comppath
    )
    .fetch_all(pool)
    .await?;

    let dpkg = sqlx::query_as!(
        PackageIndexRow,
        r#"SELECT d.package, d.version, d.architecture, d.filename, d.size, d.sha256, d.control
           FROM dpkg_packages d INNER JOIN pv_repos r ON d.repo = r.name
           WHERE r.path = $1"#,
        comppath
    )
    .fetch_all(pool)
    .await?;

    rows.extend(dpkg);

    Ok(rows)
}

async fn compress_xz(path: &Path) -> Result<()> {
    let status = tokio::process::Command::new("xz")
        .arg("-k")
        .arg("-0")
        .arg("-f")
        .arg(path)
        .status()
        .await
        .with_context(|| format!("failed to spawn xz for {}", path.display()))?;

    if !status.success() {
        return Err(anyhow!("xz exited with {} compressing {}", status, path.display()));
    }

    Ok(())
}

async fn render_packages_in_component(
    pool: &PgPool,
    comppath: &str,
    component_root: &Path,
) -> Result<()> {
    let rows = fetch_package_rows(pool, comppath).await?;
    let mut grouped: HashMap<String, Vec<PackageStanza>> = HashMap::new();
    for row in &rows {
        grouped
            .entry(row.architecture.clone())
            .or_default()
            .push(build_stanza(row));
    }

    for (arch, packages) in grouped {
        let dist_path = component_root.join(format!("binary-{arch}"));
        create_dir_all(&dist_path).await?;
        let rendered = spawn_blocking(move || PackagesTemplate { packages }.render_once()).await??;

        let packages_path = dist_path.join("Packages");
        tokio::fs::write(&packages_path, rendered.as_bytes()).await?;
        compress_xz(&packages_path).await?;
    }

    Ok(())
}

async fn render_contents_in_component_arch(
    pool: &PgPool,
    comppath: &str,
    arch: &str,
    component_root: &Path,
) -> Result<()> {
    let rows = sqlx::query_as!(
        ContentsRow,
        r#"WITH rows AS (
    SELECT df.path, df.name,
        coalesce(nullif(p.control->>'Section', ''), 'None') || '/' || p.package AS producer
    FROM pv_package_files df
    INNER JOIN pv_packages p USING (package, version, repo)
    INNER JOIN pv_repos r ON r.name = p.repo
    WHERE r.path = $1 AND df.ftype = 'reg' AND (p.architecture = $2 OR p.architecture = 'all')
    UNION ALL
    SELECT df.path, df.name,
        coalesce(nullif(p.control->>'Section', ''), 'None') || '/' || p.package AS producer
    FROM dpkg_package_files df
    INNER JOIN dpkg_packages p USING (package, version, repo)
    INNER JOIN pv_repos r ON r.name = p.repo
    WHERE r.path = $1 AND df.ftype = 'reg' AND (p.architecture = $2 OR p.architecture = 'all')
)
SELECT path, name, string_agg(DISTINCT producer, ',') AS producers
FROM rows GROUP BY path, name"#,
        comppath,
        arch
    )
    .fetch_all(pool)
    .await?;

    let mut content = String::new();
    for row in &rows {
        let full = format!("{}/{}", row.path, row.name);
        let producers = row.producers.as_deref().unwrap_or_default();
        content.push_str(&format!("{full:<55} {producers}\n"));
    }

    let gz_path = component_root.join(format!("Contents-{arch}.gz"));
    let mut encoder = GzipEncoder::with_quality(File::create(&gz_path).await?, Level::Precise(9));
    encoder.write_all(content.as_bytes()).await?;
    encoder.shutdown().await?;

    Ok(())
}

async fn render_contents_in_component(
    pool: &PgPool,
    comppath: &str,
    component_root: &Path,
) -> Result<()> {
    info!("Generating Contents for {comppath}");

    let archs = sqlx::query!(
        "SELECT DISTINCT architecture FROM pv_repos WHERE path = $1 AND architecture != 'all'",
        comppath
    )
    .fetch_all(pool)
    .await?;

    create_dir_all(component_root.join("Contents-all")).await?;

    for row in archs {
        render_contents_in_component_arch(pool, comppath, &row.architecture, component_root).await?;
    }

    Ok(())
}

async fn get_branch_metadata(pool: &PgPool) -> Result<Vec<BranchMeta>> {
    struct Row {
        branch: String,
        components: Option<Vec<String>>,
        architectures: Option<Vec<String>>,
    }
    let rows = sqlx::query_as!(
        Row,
        r#"SELECT branch, array_agg(DISTINCT component) AS components, array_agg(DISTINCT architecture) AS architectures
           FROM pv_repos GROUP BY branch"#
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| {
            let mut components = r.components.unwrap_or_default();
            components.sort();
            let mut architectures: Vec<String> = r
                .architectures
                .unwrap_or_default()
                .into_iter()
                .filter(|a| a != "all")
                .collect();
            architectures.sort();
            BranchMeta {
                branch: r.branch,
                components,
                architectures,
            }
        })
        .collect())
}

fn scan_single_release_file(branch_root: &Path, path: &Path) -> Result<(String, u64, String)> {
    let f = std::fs::File::open(path)?;
    let size = f.metadata()?.len();
    let sha256 = sha256sum(&f)?;
    let rel = path.strip_prefix(branch_root)?.to_string_lossy().into_owned();

    Ok((sha256, size, rel))
}

/// Hash every file already materialized under a branch's staging directory,
/// for the `Release` stanza's `SHA256` block.
fn scan_release_files(branch_root: &Path) -> Result<Vec<(String, u64, String)>> {
    let mut files_to_scan = Vec::new();
    for entry in walkdir::WalkDir::new(branch_root) {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy();
        if entry.file_type().is_dir() || filename.starts_with('.') || &*filename == "Release" || &*filename == "InRelease" {
            continue;
        }
        files_to_scan.push(entry.into_path());
    }

    let mut files = files_to_scan
        .par_iter()
        .filter_map(|p| match scan_single_release_file(branch_root, p) {
            Ok(item) => Some(item),
            Err(e) => {
                error!("error hashing {}: {e}", p.display());
                None
            }
        })
        .collect::<Vec<_>>();
    files.sort_by(|a, b| a.2.cmp(&b.2));

    Ok(files)
}

async fn create_release_file(staging_root: &Path, release: &BranchRelease, meta: &BranchMeta) -> Result<()> {
    let branch_dir = staging_root.join(&meta.branch);
    info!("Generating Release for {}", meta.branch);

    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let date = time::OffsetDateTime::from_unix_timestamp(now as i64)?;
    let valid_until = if release.ttl > 0 {
        let ts = now + release.ttl * 24 * 3600;
        Some(time::OffsetDateTime::from_unix_timestamp(ts as i64)?.format(&Rfc2822)?)
    } else {
        None
    };

    let branch_dir_for_scan = branch_dir.clone();
    let sha256_block = spawn_blocking(move || scan_release_files(&branch_dir_for_scan)).await??;

    let rendered = (InReleaseTemplate {
        origin: &release.origin,
        label: &release.label,
        codename: &release.codename,
        suite: &meta.branch,
        description: &release.description,
        date: date.format(&Rfc2822)?,
        valid_until,
        architectures: meta.architectures.join(" "),
        components: meta.components.join(" "),
        sha256_block: &sha256_block,
    })
    .render_once()?;

    let release_path = branch_dir.join("Release");
    tokio::fs::write(&release_path, rendered.as_bytes()).await?;

    let branch_dir_for_sign = branch_dir.clone();
    spawn_blocking(move || sign::clearsign(&branch_dir_for_sign)).await??;

    Ok(())
}

/// Atomically publish the staged tree: `dists` becomes `dists.old`, `dists.new`
/// becomes `dists`, then the old tree is removed. The two renames are the only
/// observable mutations to the live tree.
async fn publish(base_dir: &Path) -> Result<()> {
    let dists = base_dir.join("dists");
    let staging = base_dir.join("dists.new");
    let old = base_dir.join("dists.old");

    if old.exists() {
        tokio::fs::remove_dir_all(&old).await?;
    }
    if dists.exists() {
        tokio::fs::rename(&dists, &old).await?;
    }
    tokio::fs::rename(&staging, &dists).await?;
    if old.exists() {
        tokio::fs::remove_dir_all(&old).await?;
    }

    Ok(())
}

/// Run the Release Generator for every branch recorded in the database,
/// staging into `dists.new` and publishing it atomically when done.
pub async fn render_releases(pool: &PgPool, base_dir: &Path, config: &ReleaseConfig) -> Result<()> {
    let staging_root = base_dir.join("dists.new");
    if staging_root.exists() {
        tokio::fs::remove_dir_all(&staging_root).await?;
    }
    create_dir_all(&staging_root).await?;

    let branches = get_branch_metadata(pool).await?;
    for meta in &branches {
        let branch_dir = staging_root.join(&meta.branch);
        for component in &meta.components {
            let comppath = format!("{}/{}", meta.branch, component);
            let component_root = branch_dir.join(component);
            create_dir_all(&component_root).await?;
            render_packages_in_component(pool, &comppath, &component_root).await?;
            render_contents_in_component(pool, &comppath, &component_root).await?;
        }

        let release = config.resolve(&meta.branch);
        if let Err(e) = create_release_file(&staging_root, &release, meta).await {
            error!("failed to finalize release for {}: {e:?}", meta.branch);
            if let Err(remove_err) = tokio::fs::remove_dir_all(&branch_dir).await {
                error!("failed to discard staging tree for {}: {remove_err}", meta.branch);
            }
        }
    }

    publish(base_dir).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stanza_follows_canonical_field_order_then_leftovers() {
        let row = PackageIndexRow {
            package: "test".to_string(),
            version: "1.0".to_string(),
            architecture: "amd64".to_string(),
            filename: "pool/stable/main/t/test_1.0_amd64.deb".to_string(),
            size: 10,
            sha256: Some("abc".to_string()),
            control: json!({
                "Section": "utils",
                "Maintainer": "McTestFace <test@example.org>",
                "Depends": "libc (>= 2.3)",
                "X-Vendor-Extra": "yes",
            }),
        };
        let stanza = build_stanza(&row);
        let keys: Vec<&str> = stanza.lines.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "Package",
                "Version",
                "Section",
                "Maintainer",
                "Architecture",
                "Depends",
                "Filename",
                "Size",
                "SHA256",
                "X-Vendor-Extra",
            ]
        );
    }

    #[test]
    fn date_formats_as_rfc_2822() {
        use time::macros::datetime;
        let dt = datetime!(2021 - 07 - 14 10:54:24 +0000);
        assert_eq!(dt.format(&Rfc2822).unwrap(), "Wed, 14 Jul 2021 10:54:24 +0000");
    }
}
