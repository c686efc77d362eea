use super::ExternalLabels;
use anyhow::Context;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// How the host mounts its cgroup hierarchies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupMode {
    /// cgroup v1 only.
    Legacy,
    /// cgroup v1 controllers with an additional v2 hierarchy under `unified/`.
    Hybrid,
    /// cgroup v2 only.
    Unified,
}

impl CgroupMode {
    pub fn detect(cgroup_root: &Path) -> Self {
        if cgroup_root.join("cgroup.controllers").exists() {
            CgroupMode::Unified
        } else if cgroup_root.join("unified").is_dir() {
            CgroupMode::Hybrid
        } else {
            CgroupMode::Legacy
        }
    }
}

impl fmt::Display for CgroupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CgroupMode::Legacy => "legacy",
            CgroupMode::Hybrid => "hybrid",
            CgroupMode::Unified => "unified",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemdUnitTarget {
    pub name: String,
    pub node_name: String,
    pub cgroup_mode: CgroupMode,
}

impl SystemdUnitTarget {
    pub fn new(name: impl Into<String>, node_name: impl Into<String>, cgroup_mode: CgroupMode) -> Self {
        Self {
            name: name.into(),
            node_name: node_name.into(),
            cgroup_mode,
        }
    }

    /// Directory of the unit's cgroup. On v1 hosts the `perf_event` hierarchy is used.
    pub fn cgroup_path(&self, cgroup_root: &Path) -> PathBuf {
        let root = match self.cgroup_mode {
            CgroupMode::Unified => cgroup_root.to_path_buf(),
            CgroupMode::Legacy | CgroupMode::Hybrid => cgroup_root.join("perf_event"),
        };
        root.join("system.slice").join(&self.name)
    }

    /// Processes currently in the unit's cgroup.
    pub fn pids(&self, cgroup_root: &Path) -> anyhow::Result<Vec<u32>> {
        let path = self.cgroup_path(cgroup_root).join("cgroup.procs");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let mut pids = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.parse::<u32>()
                    .with_context(|| format!("invalid pid {:?} in {}", line, path.display()))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    pub fn labels(&self) -> ExternalLabels {
        ExternalLabels::from([
            ("systemd_unit".to_string(), self.name.clone()),
            ("node".to_string(), self.node_name.clone()),
        ])
    }
}
