//! Platform configuration file schema (spec §6). JSON, keyed by platform
//! name; treated as static input, parsed once at agent boot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceManagerKind {
    Ccm,
    Cobalt,
    Fork,
    Lsf,
    Pbspro,
    Slurm,
    Torque,
    Yarn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemArchitecture {
    #[serde(default)]
    pub smt: u32,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub blocked_cores: Vec<u32>,
    #[serde(default)]
    pub blocked_gpus: Vec<u32>,
}

impl Default for SystemArchitecture {
    fn default() -> Self {
        Self { smt: 1, options: vec![], blocked_cores: vec![], blocked_gpus: vec![] }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VirtenvMode {
    Create,
    Recreate,
    Use,
    Update,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpVersion {
    Local,
    Release,
    Installed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchMethodsConfig {
    /// Order in which launch methods are tried by the registry (spec §4.3.1).
    #[serde(default)]
    pub order: Vec<String>,
    /// Per-method idempotent setup lines, keyed by method name.
    #[serde(default)]
    pub pre_exec_cached: HashMap<String, Vec<String>>,
}

/// A single platform entry (spec §6). Keyed externally by platform name in
/// the top-level JSON map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub default_queue: Option<String>,
    pub project: Option<String>,
    pub resource_manager: ResourceManagerKind,
    pub cores_per_node: u32,
    #[serde(default)]
    pub gpus_per_node: u32,
    pub lfs_path_per_node: String,
    #[serde(default)]
    pub lfs_size_per_node: u64,
    #[serde(default)]
    pub mem_per_node: u64,
    #[serde(default)]
    pub system_architecture: SystemArchitecture,
    #[serde(default)]
    pub launch_methods: LaunchMethodsConfig,
    #[serde(default)]
    pub pre_bootstrap_0: Vec<String>,
    #[serde(default)]
    pub pre_bootstrap_1: Vec<String>,
    #[serde(default)]
    pub virtenv_mode: Option<VirtenvMode>,
    #[serde(default)]
    pub rp_version: Option<RpVersion>,
    pub default_remote_workdir: Option<String>,
    /// Batch directory creation into one `mkdir -p` once a staging bulk
    /// exceeds this many distinct target directories (spec §4.5).
    #[serde(default = "default_task_bulk_mkdir_threshold")]
    pub task_bulk_mkdir_threshold: usize,
}

fn default_task_bulk_mkdir_threshold() -> usize {
    64
}

/// Top-level config file: a JSON object keyed by platform name.
pub fn parse_platform_configs(raw: &str) -> Result<HashMap<String, PlatformConfig>> {
    serde_json::from_str(raw).map_err(Error::from)
}

impl PlatformConfig {
    /// Validate an allocation against this platform's declared shape
    /// (spec §4.1 `ConfigMismatch`).
    pub fn validate_node_count(&self, observed_nodes: usize, expected: usize) -> Result<()> {
        if observed_nodes != expected {
            return Err(Error::ConfigMismatch(format!(
                "expected {expected} nodes, allocation manifest has {observed_nodes}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_platform_entry() {
        let raw = r#"{
            "local.localhost": {
                "resource_manager": "FORK",
                "cores_per_node": 8,
                "gpus_per_node": 0,
                "lfs_path_per_node": "/tmp",
                "system_architecture": { "blocked_cores": [0] },
                "launch_methods": { "order": ["FORK"] },
                "default_remote_workdir": "/tmp/%(pd.project)s"
            }
        }"#;
        let cfgs = parse_platform_configs(raw).unwrap();
        let p = cfgs.get("local.localhost").unwrap();
        assert_eq!(p.cores_per_node, 8);
        assert_eq!(p.system_architecture.blocked_cores, vec![0]);
        assert_eq!(p.launch_methods.order, vec!["FORK".to_string()]);
    }

    #[test]
    fn rejects_unknown_resource_manager() {
        let raw = r#"{"p": {"resource_manager": "NOPE", "cores_per_node": 1, "lfs_path_per_node": "/tmp"}}"#;
        assert!(parse_platform_configs(raw).is_err());
    }
}
