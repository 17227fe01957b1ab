//! Environment isolation contract (spec §4.3): the launcher injects its own
//! variables (`PMIX_*`, `OMPI_*`, `SLURM_*`, ...) into the rank environment.
//! `pre_exec` must not see them. We dump the pre-launch environment, dump
//! the rank environment, diff the two, and only the non-launcher-injected
//! additions are reapplied when running user `pre_exec`.

use std::collections::HashMap;

/// Snapshot of an environment (as `KEY=VALUE` pairs) taken at a point in
/// the launch sequence.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot(HashMap<String, String>);

impl EnvSnapshot {
    pub fn capture(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(vars.into_iter().collect())
    }

    pub fn process_env() -> Self {
        Self::capture(std::env::vars())
    }

    /// Variables present in `self` but not in `base`, excluding any whose
    /// name starts with one of `injected_prefixes` -- the launcher's own
    /// bookkeeping, which must never reach user `pre_exec`.
    pub fn added_since(&self, base: &EnvSnapshot, injected_prefixes: &[&str]) -> HashMap<String, String> {
        self.0
            .iter()
            .filter(|(k, _)| !base.0.contains_key(*k))
            .filter(|(k, _)| !injected_prefixes.iter().any(|p| k.starts_with(p)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
