use anyhow::{anyhow, Context, Result};
use faster_hex::hex_string;
use log::{error, info};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::Metadata;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

mod dbscan;
mod pkgscan;

pub use self::dbscan::*;

pub(crate) fn mtime(stat: &Metadata) -> Result<u64> {
    Ok(stat.modified()?.duration_since(UNIX_EPOCH)?.as_secs())
}

/// Raw `st_mode` file-type bits to the short tag stored alongside a file manifest row.
fn file_type_tag(mode_type: u32) -> &'static str {
    match mode_type {
        0o100000 => "reg",
        0o120000 => "lnk",
        0o140000 => "sock",
        0o020000 => "chr",
        0o060000 => "blk",
        0o040000 => "dir",
        0o010000 => "fifo",
        _ => "reg",
    }
}

/// Split a `libfoo.so.1.2` style name into `(soname, soversion)`, mirroring the
/// degraded-data-free split used when recording shared-object provides/depends.
fn split_soname(name: &str) -> (String, String) {
    match name.rsplit_once(".so") {
        Some((base, rest)) => (format!("{base}.so"), rest.to_string()),
        None => (name.to_string(), String::new()),
    }
}

/// Recover `(package, version, architecture)` from a pool-relative filename when
/// the archive scanner reports the file as corrupt. Debian package filenames are
/// `<package>_<version>_<arch>.deb`, percent-encoded.
fn parse_debname(filename: &str) -> Result<(String, String, String)> {
    let basename = Path::new(filename)
        .file_stem()
        .ok_or_else(|| anyhow!("no filename in {filename}"))?
        .to_string_lossy();
    let decoded = percent_decode(&basename);
    let (package, rest) = decoded
        .split_once('_')
        .ok_or_else(|| anyhow!("malformed package filename: {filename}"))?;
    let (version, arch) = rest
        .rsplit_once('_')
        .ok_or_else(|| anyhow!("malformed package filename: {filename}"))?;

    Ok((package.to_string(), version.to_string(), arch.to_string()))
}

/// Join `/` with a `data.tar` member path and collapse `.`/`..` components and
/// duplicate separators, mirroring `os.path.normpath(os.path.join('/', path))`.
/// `dpkg-deb` writes entries with a leading `./` (e.g. `./usr/bin/ls`), so this
/// has to run before the path is split into directory/basename.
fn normalize_member_path(path: &str) -> PathBuf {
    let mut out = Vec::new();
    for component in Path::new("/").join(path).components() {
        match component {
            std::path::Component::Normal(part) => out.push(part),
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::RootDir | std::path::Component::CurDir => {}
            std::path::Component::Prefix(_) => {}
        }
    }
    out.into_iter().collect::<PathBuf>()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(value) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Calculate the SHA256 checksum of the given stream.
pub fn sha256sum<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;

    Ok(hex_string(&hasher.finalize()))
}

#[derive(Debug, Clone)]
pub struct PackageFile {
    pub path: String,
    pub name: String,
    pub size: i64,
    pub ftype: String,
    pub perm: i32,
    pub uid: i64,
    pub gid: i64,
    pub uname: Option<String>,
    pub gname: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PackageContents {
    pub files: Vec<PackageFile>,
    /// (soname, soversion) pairs this package exports.
    pub so_provides: Vec<(String, String)>,
    /// (soname, soversion) pairs this package requires.
    pub so_depends: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct DebMeta {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub debtime: Option<i64>,
    /// Raw control stanza, including fields with no dedicated column
    /// (dependency relationships, vendor extensions).
    pub control: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct PackageMeta {
    pub deb: DebMeta,
    /// Pool-relative filename (always begins with `pool/<branch>/<component>/`).
    pub filename: String,
    pub size: u64,
    pub mtime: u64,
    pub sha256: Option<String>,
    /// (branch, component)
    pub repo: (String, String),
    pub contents: Option<PackageContents>,
    /// True when the archive scanner reported the file as corrupt and this
    /// record was synthesized from the filename alone.
    pub degraded: bool,
}

pub(crate) const PKG_RELATION: &[&str] = &[
    "Depends",
    "Pre-Depends",
    "Recommends",
    "Suggests",
    "Enhances",
    "Breaks",
    "Conflicts",
    "Provides",
    "Replaces",
];

fn get_branch_name<P: AsRef<Path>>(rel_path: P) -> Result<(String, String)> {
    let mut comp = rel_path.as_ref().components();
    let branch = match comp.next() {
        Some(std::path::Component::Normal(p)) => p.to_string_lossy().to_string(),
        _ => return Err(anyhow!("unexpected path: {}", rel_path.as_ref().display())),
    };
    let component = match comp.next() {
        Some(std::path::Component::Normal(p)) => p.to_string_lossy().to_string(),
        _ => return Err(anyhow!("unexpected path: {}", rel_path.as_ref().display())),
    };

    Ok((branch, component))
}

fn degraded_record(
    path: &Path,
    rel_filename: &str,
    stat: &Metadata,
    repo: (String, String),
) -> Result<PackageMeta> {
    let (package, version, architecture) = parse_debname(rel_filename)?;
    let sha256 = std::fs::File::open(path)
        .and_then(|f| sha256sum(f).map_err(std::io::Error::other))
        .ok();

    Ok(PackageMeta {
        deb: DebMeta {
            name: package,
            version,
            architecture,
            debtime: None,
            control: HashMap::new(),
        },
        filename: rel_filename.to_string(),
        size: stat.len(),
        mtime: mtime(stat)?,
        sha256,
        repo,
        contents: None,
        degraded: true,
    })
}

fn scan_single_deb_advanced(path: &Path, pool_root: &Path) -> Result<PackageMeta> {
    let stat = path.metadata()?;
    let rel_filename = path
        .strip_prefix(pool_root)?
        .to_string_lossy()
        .into_owned();
    let repo = get_branch_name(path.strip_prefix(pool_root.join("pool"))?)?;

    match pkgscan::scan(path).with_context(|| format!("scanning {}", path.display()))? {
        pkgscan::ScanOutcome::Corrupt => {
            error!("{} is corrupted, falling back to a degraded record", path.display());
            degraded_record(path, &rel_filename, &stat, repo)
        }
        pkgscan::ScanOutcome::Ok(scanned) => {
            let mut control = scanned.control;
            let name = control
                .remove("Package")
                .ok_or_else(|| anyhow!("control stanza missing Package"))?;
            let version = control
                .remove("Version")
                .ok_or_else(|| anyhow!("control stanza missing Version"))?;
            let architecture = control
                .remove("Architecture")
                .ok_or_else(|| anyhow!("control stanza missing Architecture"))?;

            let so_provides = scanned.so_provides.iter().map(|s| split_soname(s)).collect();
            let so_depends = scanned.so_depends.iter().map(|s| split_soname(s)).collect();
            let files = scanned
                .files
                .into_iter()
                .map(|f| {
                    let full = normalize_member_path(&f.path);
                    let parent = full
                        .parent()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let name = full
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    PackageFile {
                        path: parent,
                        name,
                        size: f.size as i64,
                        ftype: file_type_tag(f.ftype).to_string(),
                        perm: f.perm as i32,
                        uid: f.uid as i64,
                        gid: f.gid as i64,
                        uname: f.uname,
                        gname: f.gname,
                    }
                })
                .collect();

            Ok(PackageMeta {
                deb: DebMeta {
                    name,
                    version,
                    architecture,
                    debtime: Some(scanned.time),
                    control,
                },
                filename: rel_filename,
                size: stat.len(),
                mtime: mtime(&stat)?,
                sha256: Some(scanned.sha256_hex()),
                repo,
                contents: Some(PackageContents {
                    files,
                    so_provides,
                    so_depends,
                }),
                degraded: false,
            })
        }
    }
}

/// Dispatch the Phase 3 worker pool: each path is extracted independently, with
/// no shared mutable state between workers.
pub fn scan_packages_advanced(entries: &[&Path], pool_root: &Path) -> Vec<PackageMeta> {
    entries
        .par_iter()
        .filter_map(|entry| {
            info!("Scanning {} ...", entry.display());
            match scan_single_deb_advanced(entry, pool_root) {
                Ok(meta) => Some(meta),
                Err(err) => {
                    error!("{}: {:?}", entry.display(), err);
                    None
                }
            }
        })
        .collect()
}

/// Auto-discover branch/component pairs under the pool directory.
pub fn discover_topics_components<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>> {
    let mut topics = Vec::new();

    for entry in WalkDir::new(path.as_ref())
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_entry(|x| x.file_type().is_dir())
    {
        let entry = entry?;
        let name = entry.path().strip_prefix(path.as_ref())?;
        topics.push(name.to_owned());
    }

    Ok(topics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_soname_version() {
        assert_eq!(
            split_soname("libfoo.so.1.2.3"),
            ("libfoo.so".to_string(), "1.2.3".to_string())
        );
        assert_eq!(split_soname("nolib"), ("nolib".to_string(), "".to_string()));
    }

    #[test]
    fn parses_degraded_filename() {
        let (pkg, ver, arch) = parse_debname("hello_2.0_amd64.deb").unwrap();
        assert_eq!(pkg, "hello");
        assert_eq!(ver, "2.0");
        assert_eq!(arch, "amd64");
    }

    #[test]
    fn parses_percent_encoded_filename() {
        let (pkg, ver, _arch) = parse_debname("hello_2%3a0-1_amd64.deb").unwrap();
        assert_eq!(pkg, "hello");
        assert_eq!(ver, "2:0-1");
    }

    #[test]
    fn file_type_tags_match_known_modes() {
        assert_eq!(file_type_tag(0o100000), "reg");
        assert_eq!(file_type_tag(0o040000), "dir");
        assert_eq!(file_type_tag(0o120000), "lnk");
    }

    #[test]
    fn normalizes_dpkg_deb_leading_dot_slash() {
        assert_eq!(
            normalize_member_path("./usr/bin/ls"),
            PathBuf::from("usr/bin/ls")
        );
    }

    #[test]
    fn normalizes_dot_dot_and_duplicate_separators() {
        assert_eq!(
            normalize_member_path("./usr//local/../bin/ls"),
            PathBuf::from("usr/bin/ls")
        );
    }
}
