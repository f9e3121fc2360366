//! Subprocess adapter for the external `.deb` archive scanner.
//!
//! `pkgscan_cli` is a sibling executable, not part of this crate: it knows how to
//! read `ar`/`tar`/compression formats and extract control metadata, the file
//! manifest, and shared-object provides/depends. We only need to invoke it and
//! parse its JSON stdout.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};
use faster_hex::hex_string;
use serde::Deserialize;

#[derive(Deserialize)]
pub struct ScannedFile {
    pub path: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub ftype: u32,
    pub perm: u32,
    pub uid: u64,
    pub gid: u64,
    pub uname: Option<String>,
    pub gname: Option<String>,
}

#[derive(Deserialize)]
pub struct PkgScanOutput {
    pub control: HashMap<String, String>,
    pub hash_value: Vec<u8>,
    pub time: i64,
    pub so_provides: Vec<String>,
    pub so_depends: Vec<String>,
    pub files: Vec<ScannedFile>,
}

impl PkgScanOutput {
    pub fn sha256_hex(&self) -> String {
        hex_string(&self.hash_value)
    }
}

/// Outcome of invoking the scanner on one archive.
pub enum ScanOutcome {
    Ok(PkgScanOutput),
    /// Exit status 1 or 2: the archive is corrupt. Callers fall back to a
    /// degraded record built from the filename alone.
    Corrupt,
}

/// Invoke `pkgscan_cli <path>` and parse its result.
///
/// Any exit status other than 0, 1, or 2 is treated as fatal to the enclosing
/// scan unit, matching the external interface contract.
pub fn scan(path: &Path) -> Result<ScanOutcome> {
    let output = Command::new("pkgscan_cli")
        .arg(path)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .with_context(|| format!("failed to spawn pkgscan_cli for {}", path.display()))?;

    match output.status.code() {
        Some(0) => {
            let parsed: PkgScanOutput = serde_json::from_slice(&output.stdout).with_context(
                || format!("pkgscan_cli produced invalid JSON for {}", path.display()),
            )?;
            Ok(ScanOutcome::Ok(parsed))
        }
        Some(1) | Some(2) => Ok(ScanOutcome::Corrupt),
        Some(code) => Err(anyhow!(
            "pkgscan_cli exited with status {} for {}",
            code,
            path.display()
        )),
        None => Err(anyhow!(
            "pkgscan_cli was terminated by a signal while scanning {}",
            path.display()
        )),
    }
}
