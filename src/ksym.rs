use anyhow::Context;
use moka::sync::Cache;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

pub const KALLSYMS: &str = "/proc/kallsyms";

/// Lookup of kernel addresses to the name of the function containing them.
///
/// Implementations are shared between all profilers and must be safe for concurrent use.
pub trait KernelSymbols: Send + Sync {
    fn lookup(&self, addr: u64) -> Option<Arc<str>>;
}

#[derive(Debug, Clone)]
struct Ksym {
    start: u64,
    name: Arc<str>,
}

#[derive(Debug)]
struct Table {
    syms: Arc<Vec<Ksym>>,
    loaded_at: Instant,
}

/// Caches the kernel symbol table and recent lookups.
///
/// The table is reloaded once it is older than the update interval, since modules load and
/// unload at runtime. When the kernel hides symbol addresses (`kptr_restrict`) every address
/// in the table reads as zero, and all lookups report "not found".
#[derive(Debug)]
pub struct KsymCache {
    path: PathBuf,
    update_interval: Duration,
    table: RwLock<Option<Table>>,
    resolved: Cache<u64, Option<Arc<str>>>,
}

impl Default for KsymCache {
    fn default() -> Self {
        Self::new(KALLSYMS)
    }
}

impl KsymCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            update_interval: Duration::from_secs(5 * 60),
            table: RwLock::new(None),
            resolved: Cache::new(10_000),
        }
    }

    #[must_use]
    pub fn with_update_interval(mut self, update_interval: Duration) -> Self {
        self.update_interval = update_interval;
        self
    }

    /// Current symbol table. A failed load is kept as an empty table until the next reload.
    fn symbols(&self) -> Arc<Vec<Ksym>> {
        {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(t) = table.as_ref() {
                if t.loaded_at.elapsed() < self.update_interval {
                    return Arc::clone(&t.syms);
                }
            }
        }

        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        // Another lookup may have reloaded while this one waited for the lock.
        if let Some(t) = table.as_ref() {
            if t.loaded_at.elapsed() < self.update_interval {
                return Arc::clone(&t.syms);
            }
        }

        let syms = match load_kallsyms(&self.path) {
            Ok(syms) => {
                log::debug!(
                    "Loaded {} kernel symbols from {}",
                    syms.len(),
                    self.path.display()
                );
                Arc::new(syms)
            }
            Err(e) => {
                log::warn!("Failed to load kernel symbols: {:#}", e);
                Arc::new(Vec::new())
            }
        };

        *table = Some(Table {
            syms: Arc::clone(&syms),
            loaded_at: Instant::now(),
        });
        self.resolved.invalidate_all();

        syms
    }
}

impl KernelSymbols for KsymCache {
    fn lookup(&self, addr: u64) -> Option<Arc<str>> {
        let syms = self.symbols();
        self.resolved
            .get_with(addr, || find_owner(&syms, addr).map(|s| Arc::clone(&s.name)))
    }
}

fn load_kallsyms(path: &Path) -> anyhow::Result<Vec<Ksym>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut syms = Vec::new();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(addr), Some(kind), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };

        // Only text symbols can own a sampled instruction pointer.
        if !matches!(kind, "t" | "T" | "w" | "W") {
            continue;
        }

        let start = u64::from_str_radix(addr, 16)
            .with_context(|| format!("invalid kallsyms address {addr:?}"))?;
        syms.push(Ksym {
            start,
            name: Arc::from(name),
        });
    }

    if syms.iter().all(|s| s.start == 0) {
        log::warn!(
            "Kernel symbol addresses in {} are hidden, kernel frames will stay unresolved",
            path.display()
        );
        return Ok(Vec::new());
    }

    syms.sort_by_key(|s| s.start);
    Ok(syms)
}

fn find_owner(syms: &[Ksym], addr: u64) -> Option<&Ksym> {
    match syms.partition_point(|s| s.start <= addr) {
        0 => None,
        idx => syms.get(idx - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KALLSYMS_FIXTURE: &str = "\
ffffffff81000000 T _text
ffffffff81000100 T do_syscall_64
ffffffff81000200 d some_data
ffffffff81000300 t __schedule
ffffffffc0000000 t nf_hook [nf_tables]
";

    fn fixture(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_lookup() {
        let f = fixture(KALLSYMS_FIXTURE);
        let cache = KsymCache::new(f.path());

        assert_eq!(cache.lookup(0xffffffff81000000).as_deref(), Some("_text"));
        assert_eq!(
            cache.lookup(0xffffffff81000150).as_deref(),
            Some("do_syscall_64")
        );
        // Data symbols are skipped, the address belongs to the previous function.
        assert_eq!(
            cache.lookup(0xffffffff81000250).as_deref(),
            Some("do_syscall_64")
        );
        assert_eq!(cache.lookup(0xffffffff81000301).as_deref(), Some("__schedule"));
        assert_eq!(cache.lookup(0xffffffffc0000010).as_deref(), Some("nf_hook"));
    }

    #[test]
    fn test_lookup_below_first_symbol() {
        let f = fixture(KALLSYMS_FIXTURE);
        let cache = KsymCache::new(f.path());
        assert_eq!(cache.lookup(0x1000), None);
    }

    #[test]
    fn test_hidden_addresses() {
        let f = fixture(
            "0000000000000000 T _text\n0000000000000000 T do_syscall_64\n",
        );
        let cache = KsymCache::new(f.path());
        assert_eq!(cache.lookup(0xffffffff81000150), None);
    }

    #[test]
    fn test_missing_kallsyms() {
        let cache = KsymCache::new("/nonexistent/kallsyms");
        assert_eq!(cache.lookup(0xffffffff81000150), None);
    }

    #[test]
    fn test_failed_load_waits_for_update_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kallsyms");
        let cache = KsymCache::new(&path);
        assert_eq!(cache.lookup(0xffffffff81000010), None);

        std::fs::write(&path, "ffffffff81000000 T late\n").unwrap();
        assert_eq!(cache.lookup(0xffffffff81000010), None);
        assert!(cache.table.read().unwrap().as_ref().unwrap().syms.is_empty());

        let cache = KsymCache::new(&path).with_update_interval(Duration::ZERO);
        assert_eq!(cache.lookup(0xffffffff81000010).as_deref(), Some("late"));
    }

    #[test]
    fn test_reload_after_update_interval() {
        let mut f = fixture("ffffffff81000000 T old_name\n");
        let cache = KsymCache::new(f.path()).with_update_interval(Duration::ZERO);
        assert_eq!(cache.lookup(0xffffffff81000010).as_deref(), Some("old_name"));

        f.as_file_mut().set_len(0).unwrap();
        std::fs::write(f.path(), "ffffffff81000000 T new_name\n").unwrap();
        assert_eq!(cache.lookup(0xffffffff81000010).as_deref(), Some("new_name"));
    }

    #[test]
    fn test_concurrent_lookups() {
        let f = fixture(KALLSYMS_FIXTURE);
        let cache = Arc::new(KsymCache::new(f.path()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.lookup(0xffffffff81000150))
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap().as_deref(), Some("do_syscall_64"));
        }
    }
}
