use anyhow::Result;
use log::warn;
use serde::Deserialize;
use std::{collections::HashMap, fs::File, io::Read, path::Path};

#[derive(Deserialize, Clone)]
pub struct GeneralConfig {
    pub db_pgconn: String,
    pub change_notifier: Option<String>,
    pub path: String,
    pub discover: bool,
    pub origin: String,
    pub ttl: u64,
    pub label: String,
    pub codename: String,
}

#[derive(Deserialize, Clone)]
pub struct BranchConfig {
    pub name: String,
    #[serde(rename = "desc")]
    pub description: String,
    pub ttl: Option<u64>,
    pub origin: Option<String>,
    pub label: Option<String>,
    pub codename: Option<String>,
}

#[derive(Deserialize, Clone)]
pub struct Config {
    pub config: GeneralConfig,
    pub branch: Vec<BranchConfig>,
}

/// Resolved per-branch release metadata: the common defaults from `[config]`
/// overridden field-by-field by a matching `[[branch]]` entry, if any.
#[derive(Clone)]
pub struct BranchRelease {
    pub origin: String,
    pub label: String,
    pub codename: String,
    pub description: String,
    pub ttl: u64,
}

#[derive(Clone)]
pub struct ReleaseConfig {
    pub default_origin: String,
    pub default_label: String,
    pub default_codename: String,
    pub default_ttl: u64,
    pub branches: HashMap<String, BranchRelease>,
}

impl ReleaseConfig {
    /// Look up the resolved metadata for a branch, falling back to the common
    /// defaults for anything not present as a `[[branch]]` entry.
    pub fn resolve(&self, branch: &str) -> BranchRelease {
        self.branches.get(branch).cloned().unwrap_or_else(|| BranchRelease {
            origin: self.default_origin.clone(),
            label: self.default_label.clone(),
            codename: self.default_codename.clone(),
            description: format!("Topic: {branch}"),
            ttl: self.default_ttl,
        })
    }
}

pub fn convert_branch_description_config(config: &Config) -> ReleaseConfig {
    let default = &config.config;
    let mut branches = HashMap::new();
    for b in &config.branch {
        branches.insert(
            b.name.clone(),
            BranchRelease {
                origin: b.origin.clone().unwrap_or_else(|| default.origin.clone()),
                label: b.label.clone().unwrap_or_else(|| default.label.clone()),
                codename: b
                    .codename
                    .clone()
                    .unwrap_or_else(|| default.codename.clone()),
                description: b.description.clone(),
                ttl: b.ttl.unwrap_or(default.ttl),
            },
        );
    }

    ReleaseConfig {
        default_origin: default.origin.clone(),
        default_label: default.label.clone(),
        default_codename: default.codename.clone(),
        default_ttl: default.ttl,
        branches,
    }
}

pub fn lint_config(config: &Config) {
    if config.config.discover && !config.branch.is_empty() {
        warn!("Specifying any branch when auto-discover is enabled will only get their descriptions read.");
    }
}

pub fn parse_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let mut f = File::open(path)?;
    let mut content = String::new();
    content.reserve(1024);
    f.read_to_string(&mut content)?;

    Ok(toml::from_str(&content)?)
}
