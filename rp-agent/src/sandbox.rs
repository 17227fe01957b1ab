//! Task sandbox directory and the two scripts the Executor materializes
//! there (spec §4.3 step 2-3).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rp_core::error::Result;
use rp_core::model::Task;

/// Per-task working directory, created by Staging-Input if a directive
/// already touched it, otherwise by the Executor on first use.
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(pilot_sandbox: &Path, task: &Task) -> Self {
        let root = match &task.description.sandbox {
            Some(explicit) => explicit.clone(),
            None => pilot_sandbox.join(&task.uid),
        };
        Self { root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn launch_script(&self) -> PathBuf {
        self.root.join(format!(
            "{}.launch.sh",
            self.root.file_name().and_then(|n| n.to_str()).unwrap_or("task")
        ))
    }

    pub fn exec_script(&self) -> PathBuf {
        self.root.join(format!(
            "{}.exec.sh",
            self.root.file_name().and_then(|n| n.to_str()).unwrap_or("task")
        ))
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.root.join(format!(
            "{}.out",
            self.root.file_name().and_then(|n| n.to_str()).unwrap_or("task")
        ))
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.root.join(format!(
            "{}.err",
            self.root.file_name().and_then(|n| n.to_str()).unwrap_or("task")
        ))
    }

    pub fn prof_path(&self) -> PathBuf {
        self.root.join(format!(
            "{}.prof",
            self.root.file_name().and_then(|n| n.to_str()).unwrap_or("task")
        ))
    }

    /// Append one timestamped named event to `<uid>.prof` (supplement D.4,
    /// RP's historical profiling format: TSV of `ts\tevent`).
    pub fn record_prof_event(&self, event: &str) -> Result<()> {
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0);
        let mut f = std::fs::OpenOptions::new().create(true).append(true).open(self.prof_path())?;
        writeln!(f, "{ts}\t{event}")?;
        Ok(())
    }
}

/// Truncate a captured output buffer to the API surfacing limit (spec §4.3
/// step 4); the full file on disk is left untouched.
pub fn truncate_for_api(bytes: &[u8], limit: usize) -> Vec<u8> {
    if bytes.len() <= limit {
        bytes.to_vec()
    } else {
        bytes[..limit].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_core::model::{Payload, TaskDescription, ThreadingType};
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn desc() -> TaskDescription {
        TaskDescription {
            payload: Payload::Executable { path: "date".into(), arguments: vec![] },
            environment: HashMap::new(),
            ranks: 1,
            cores_per_rank: 1,
            gpus_per_rank: 0,
            threading_type: ThreadingType::None,
            mem_per_rank: 0,
            lfs_per_rank: 0,
            pre_exec: vec![],
            post_exec: vec![],
            pre_launch: vec![],
            post_launch: vec![],
            input_staging: vec![],
            output_staging: vec![],
            stdout: None,
            stderr: None,
            sandbox: None,
            named_env: None,
            tags: HashMap::new(),
        }
    }

    #[test]
    fn sandbox_defaults_to_pilot_sandbox_slash_uid() {
        let dir = tempdir().unwrap();
        let task = Task::new("t0", desc());
        let sbx = Sandbox::new(dir.path(), &task);
        assert_eq!(sbx.path(), dir.path().join("t0"));
    }

    #[test]
    fn truncate_for_api_leaves_short_output_untouched() {
        let data = b"hello";
        assert_eq!(truncate_for_api(data, 1024), data.to_vec());
    }

    #[test]
    fn truncate_for_api_caps_long_output() {
        let data = vec![b'x'; 2048];
        assert_eq!(truncate_for_api(&data, 1024).len(), 1024);
    }
}
