//! Cluster topology descriptors and the sync tasks derived from them.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::core::errors::{DiagError, Result};

/// `{uuid}.json` written by the deployment tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterTopology {
    pub cluster_name: String,
    pub status: String,
    pub message: String,
    pub hosts: Vec<HostEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostEntry {
    pub status: String,
    pub ip: String,
    pub enable_sudo: bool,
    pub user: String,
    pub message: String,
    pub components: Vec<ComponentEntry>,
}

impl HostEntry {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentEntry {
    pub status: String,
    pub deploy_dir: String,
    pub name: String,
    /// A single port or a list of ports.
    #[serde(deserialize_with = "one_or_many")]
    pub port: Vec<String>,
}

impl ComponentEntry {
    /// Port used in keys and folder names.
    pub fn primary_port(&self) -> &str {
        self.port.first().map_or("", String::as_str)
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        One(String),
        Number(u64),
        Many(Vec<String>),
    }
    Ok(match Option::<Port>::deserialize(deserializer)? {
        Some(Port::One(p)) => vec![p],
        Some(Port::Number(n)) => vec![n.to_string()],
        Some(Port::Many(ps)) => ps,
        None => Vec::new(),
    })
}

impl ClusterTopology {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| DiagError::io(path, e))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// One task per component of every successful host.
    pub fn sync_tasks(&self, target: &Path, uuid: &str) -> Vec<SyncTask> {
        let mut tasks = Vec::new();
        for host in self.hosts.iter().filter(|h| h.is_success()) {
            for component in &host.components {
                let port = component.primary_port();
                let folder = format!("{}-{port}", component.name);
                tasks.push(SyncTask {
                    key: format!("{uuid}_{}_{}_{port}", host.ip, component.name),
                    from: format!("{}@{}:{}/log/", host.user, host.ip, component.deploy_dir),
                    to: target.join(uuid).join(&host.ip).join(folder),
                    filters: filters_for(&component.name),
                });
            }
        }
        tasks
    }
}

/// Extra log name prefixes pulled alongside a component's own logs.
const EXTRA_PATTERNS: &[(&str, &[&str])] = &[("prometheus", &["alertmanager"])];

fn pattern(name: &str) -> String {
    format!("{name}*")
}

pub fn filters_for(component: &str) -> Vec<String> {
    let mut filters = vec![pattern(component)];
    for (name, extras) in EXTRA_PATTERNS {
        if *name == component {
            filters.extend(extras.iter().map(|e| pattern(e)));
        }
    }
    filters
}

/// One remote log directory mirrored locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncTask {
    pub key: String,
    pub from: String,
    pub to: PathBuf,
    pub filters: Vec<String>,
}

/// Scan `topo_dir` for `*.json` descriptors (uuid = file stem). A
/// descriptor that cannot be read or parsed is logged and skipped.
pub fn load_tasks(topo_dir: &Path, target: &Path) -> Result<Vec<SyncTask>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(topo_dir)
        .map_err(|e| DiagError::io(topo_dir, e))?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    entries.sort();

    let mut tasks = Vec::new();
    for path in entries {
        let Some(uuid) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        match ClusterTopology::load(&path) {
            Ok(cluster) => tasks.extend(cluster.sync_tasks(target, &uuid)),
            Err(e) => eprintln!("[DIAG-SYNC] skipping descriptor {}: {e}", path.display()),
        }
    }
    Ok(tasks)
}
