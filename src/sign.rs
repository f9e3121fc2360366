//! Clearsigns a branch's `Release` file into `InRelease` via an external `gpg`.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};

/// Resolve the signer binary: the `GPG` environment variable if set, otherwise
/// `gpg2` on `PATH`, falling back to `gpg`.
fn resolve_gpg() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("GPG") {
        return Ok(PathBuf::from(path));
    }
    which("gpg2")
        .or_else(|| which("gpg"))
        .ok_or_else(|| anyhow!("neither gpg2 nor gpg was found on PATH"))
}

fn which(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| {
        let candidate = dir.join(binary);
        candidate.is_file().then_some(candidate)
    })
}

/// Clearsign `<branch_dir>/Release` into `<branch_dir>/InRelease`, then remove
/// the plaintext `Release` file. `branch_dir` is always the directory currently
/// being rendered, passed explicitly so no loop variable can be shadowed or
/// captured stale across branches.
pub fn clearsign(branch_dir: &Path) -> Result<()> {
    let gpg = resolve_gpg()?;
    let release = branch_dir.join("Release");
    let inrelease = branch_dir.join("InRelease");

    let status = Command::new(&gpg)
        .arg("--batch")
        .arg("--yes")
        .arg("--clearsign")
        .arg("-o")
        .arg(&inrelease)
        .arg(&release)
        .status()
        .with_context(|| format!("failed to spawn {}", gpg.display()))?;

    if !status.success() {
        return Err(anyhow!(
            "{} exited with {} while signing {}",
            gpg.display(),
            status,
            release.display()
        ));
    }

    std::fs::remove_file(&release)
        .with_context(|| format!("removing plaintext {}", release.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_gpg_honors_env_override() {
        std::env::set_var("GPG", "/usr/bin/gpg2-custom");
        assert_eq!(resolve_gpg().unwrap(), PathBuf::from("/usr/bin/gpg2-custom"));
        std::env::remove_var("GPG");
    }
}
