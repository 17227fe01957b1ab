//! Resource Manager (spec §4.1): discovers the node list, cores, GPUs, lfs
//! and memory of the allocation from platform config and a batch-system
//! supplied allocation manifest. Produces data; does not allocate.

use std::collections::HashMap;
use std::path::PathBuf;

use rp_core::config::PlatformConfig;
use rp_core::error::{Error, Result};
use rp_core::model::{Node, Slot};

/// A parsed allocation manifest: one entry per node, in discovery order.
/// Matches e.g. a de-duplicated `PBS_NODEFILE` or an expanded
/// `SLURM_NODELIST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationManifest {
    pub hostnames: Vec<String>,
}

impl AllocationManifest {
    /// One hostname per line; batch nodefiles often repeat the hostname once
    /// per core slot, so adjacent duplicates are collapsed but the overall
    /// node *order* (first-seen) is preserved.
    pub fn from_nodefile(contents: &str) -> Result<Self> {
        let mut hostnames = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if hostnames.last().map(|h: &String| h.as_str()) != Some(line) {
                hostnames.push(line.to_string());
            }
        }
        if hostnames.is_empty() {
            return Err(Error::AllocationUnreadable(
                "nodefile contained no hostnames".into(),
            ));
        }
        Ok(Self { hostnames })
    }

    /// Minimal SLURM_NODELIST-style parser: comma-separated hostnames, with
    /// optional `prefix[a-b,c]` numeric range/list expansion.
    pub fn from_slurm_nodelist(spec: &str) -> Result<Self> {
        let mut hostnames = Vec::new();
        for token in split_top_level_commas(spec) {
            if let Some(open) = token.find('[') {
                let close = token.rfind(']').ok_or_else(|| {
                    Error::AllocationUnreadable(format!(
                        "unbalanced brackets in nodelist token {token}"
                    ))
                })?;
                let prefix = &token[..open];
                let body = &token[open + 1..close];
                for part in body.split(',') {
                    if let Some((lo, hi)) = part.split_once('-') {
                        let width = lo.len();
                        let lo: u32 = lo.parse().map_err(|_| {
                            Error::AllocationUnreadable(format!("bad range in {token}"))
                        })?;
                        let hi: u32 = hi.parse().map_err(|_| {
                            Error::AllocationUnreadable(format!("bad range in {token}"))
                        })?;
                        for n in lo..=hi {
                            hostnames.push(format!("{prefix}{n:0width$}"));
                        }
                    } else {
                        hostnames.push(format!("{prefix}{part}"));
                    }
                }
            } else {
                hostnames.push(token.to_string());
            }
        }
        if hostnames.is_empty() {
            return Err(Error::AllocationUnreadable("empty SLURM_NODELIST".into()));
        }
        Ok(Self { hostnames })
    }

    pub fn single_node(hostname: impl Into<String>) -> Self {
        Self { hostnames: vec![hostname.into()] }
    }
}

fn split_top_level_commas(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

pub struct ResourceManager {
    platform: PlatformConfig,
}

impl ResourceManager {
    pub fn new(platform: PlatformConfig) -> Self {
        Self { platform }
    }

    /// Produce the initial node list (spec §4.1 `nodes() -> [Node]`).
    /// Errors with `ConfigMismatch` if the manifest's node count doesn't
    /// match what the platform config implies the pilot requested.
    pub fn nodes(&self, manifest: &AllocationManifest, expected_nodes: usize) -> Result<Vec<Node>> {
        self.platform
            .validate_node_count(manifest.hostnames.len(), expected_nodes)?;

        let blocked_cores = &self.platform.system_architecture.blocked_cores;
        let blocked_gpus = &self.platform.system_architecture.blocked_gpus;

        let nodes = manifest
            .hostnames
            .iter()
            .enumerate()
            .map(|(idx, hostname)| {
                let cores = (0..self.platform.cores_per_node)
                    .map(|i| {
                        if blocked_cores.contains(&i) {
                            Slot::blocked(i)
                        } else {
                            Slot::free(i)
                        }
                    })
                    .collect();
                let gpus = (0..self.platform.gpus_per_node)
                    .map(|i| {
                        if blocked_gpus.contains(&i) {
                            Slot::blocked(i)
                        } else {
                            Slot::free(i)
                        }
                    })
                    .collect();
                Node {
                    id: format!("node-{idx}"),
                    name: hostname.clone(),
                    cores,
                    gpus,
                    lfs_path: PathBuf::from(&self.platform.lfs_path_per_node),
                    lfs_size: self.platform.lfs_size_per_node,
                    mem: self.platform.mem_per_node,
                }
            })
            .collect();

        Ok(nodes)
    }

    /// Environment launch methods need to address the allocation (spec
    /// §4.1 `launch_command_info`), e.g. the host list for `--nodelist`.
    pub fn launch_command_info(&self, nodes: &[Node]) -> HashMap<String, String> {
        let hostlist = nodes.iter().map(|n| n.name.clone()).collect::<Vec<_>>().join(",");
        let mut env = HashMap::new();
        env.insert("RP_NODELIST".to_string(), hostlist);
        env.insert(
            "RP_CORES_PER_NODE".to_string(),
            self.platform.cores_per_node.to_string(),
        );
        env.insert(
            "RP_GPUS_PER_NODE".to_string(),
            self.platform.gpus_per_node.to_string(),
        );
        env
    }
}
