use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableMapping {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub path: String,
}

impl ExecutableMapping {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessMappings {
    mappings: Vec<ExecutableMapping>,
}

impl ProcessMappings {
    pub fn read(proc_root: &Path, pid: u32) -> anyhow::Result<Self> {
        let path = proc_root.join(pid.to_string()).join("maps");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    /// Keeps file backed mappings with execute permission, skipping unparsable lines.
    pub fn parse(content: &str) -> Self {
        let mut mappings: Vec<ExecutableMapping> = content.lines().filter_map(parse_line).collect();
        mappings.sort_by_key(|m| m.start);
        Self { mappings }
    }

    pub fn find(&self, addr: u64) -> Option<&ExecutableMapping> {
        match self.mappings.partition_point(|m| m.start <= addr) {
            0 => None,
            idx => self.mappings.get(idx - 1).filter(|m| m.contains(addr)),
        }
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &ExecutableMapping> {
        self.mappings.iter()
    }
}

/// Path of a mapped file as seen from the process' own mount namespace.
pub fn object_path(proc_root: &Path, pid: u32, path: &str) -> PathBuf {
    proc_root
        .join(pid.to_string())
        .join("root")
        .join(path.trim_start_matches('/'))
}

// "start-end perms offset dev inode pathname"
fn parse_line(line: &str) -> Option<ExecutableMapping> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let path = parts.collect::<Vec<_>>().join(" ");

    if !perms.contains('x') || !path.starts_with('/') {
        return None;
    }

    let (start, end) = range.split_once('-')?;
    Some(ExecutableMapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        offset: u64::from_str_radix(offset, 16).ok()?,
        path,
    })
}
