use crate::process::PROC_ROOT;
use crate::profile::{RawProfile, RawSample};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

pub const DEFAULT_FREQUENCY: u32 = 19;

/// Captures raw stacks of a set of processes over a sampling window.
///
/// Implementations must return once the window has elapsed; the caller bounds nothing else.
#[tonic::async_trait]
pub trait Sampler: Send + Sync {
    async fn sample(&self, pids: &[u32], duration: Duration) -> anyhow::Result<RawProfile>;
}

/// Samples kernel stacks by polling `/proc/<pid>/task/<tid>/stack`.
///
/// Reading another process' kernel stack requires `CAP_SYS_ADMIN`. Threads that exit or cannot
/// be read during the window are skipped, as are threads observed outside the kernel.
#[derive(Debug, Clone)]
pub struct ProcStackSampler {
    proc_root: PathBuf,
    frequency: u32,
}

impl Default for ProcStackSampler {
    fn default() -> Self {
        Self::new(DEFAULT_FREQUENCY)
    }
}

impl ProcStackSampler {
    pub fn new(frequency: u32) -> Self {
        Self {
            proc_root: PathBuf::from(PROC_ROOT),
            frequency: frequency.max(1),
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(1) / self.frequency
    }
}

#[tonic::async_trait]
impl Sampler for ProcStackSampler {
    async fn sample(&self, pids: &[u32], duration: Duration) -> anyhow::Result<RawProfile> {
        let period = self.period();
        let deadline = Instant::now() + duration;
        let proc_root: Arc<Path> = Arc::from(self.proc_root.as_path());
        let targets: Arc<[u32]> = Arc::from(pids);

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut counts: HashMap<(u32, Vec<u64>), i64> = HashMap::new();
        loop {
            ticker.tick().await;
            // Only sweep while a whole period still fits before the deadline.
            if deadline.saturating_duration_since(Instant::now()) < period {
                break;
            }
            let (root, targets) = (Arc::clone(&proc_root), Arc::clone(&targets));
            let stacks =
                tokio::task::spawn_blocking(move || read_stacks(&root, &targets)).await?;
            for stack in stacks {
                *counts.entry(stack).or_default() += 1;
            }
        }
        tokio::time::sleep_until(deadline).await;

        let mut samples: Vec<RawSample> = counts
            .into_iter()
            .map(|((pid, kernel_stack), count)| RawSample {
                pid,
                kernel_stack,
                user_stack: Vec::new(),
                count,
            })
            .collect();
        samples.sort_by(|a, b| (a.pid, &a.kernel_stack).cmp(&(b.pid, &b.kernel_stack)));

        log::debug!(
            "Sampled {} distinct stacks from {} processes",
            samples.len(),
            pids.len()
        );
        Ok(RawProfile { samples, period })
    }
}

fn read_stacks(proc_root: &Path, pids: &[u32]) -> Vec<(u32, Vec<u64>)> {
    pids.iter()
        .flat_map(|&pid| {
            read_process_stacks(proc_root, pid)
                .into_iter()
                .map(move |stack| (pid, stack))
        })
        .collect()
}

fn read_process_stacks(proc_root: &Path, pid: u32) -> Vec<Vec<u64>> {
    let task_dir = proc_root.join(pid.to_string()).join("task");
    let Ok(tasks) = fs::read_dir(&task_dir) else {
        return Vec::new();
    };

    tasks
        .filter_map(|task| task.ok())
        .filter_map(|task| fs::read_to_string(task.path().join("stack")).ok())
        .map(|content| parse_stack(&content))
        .filter(|stack| !stack.is_empty())
        .collect()
}

// "[<ffffffff81000100>] do_syscall_64+0x5b/0x1a0", leaf first.
fn parse_stack(content: &str) -> Vec<u64> {
    content
        .lines()
        .filter_map(|line| {
            let addr = line.trim_start().strip_prefix("[<")?.split_once(">]")?.0;
            u64::from_str_radix(addr, 16).ok()
        })
        .filter(|&addr| addr != u64::MAX)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: &str = "\
[<ffffffff81000300>] __schedule+0x2a/0x80
[<ffffffff81000100>] do_syscall_64+0x5b/0x1a0
[<ffffffffffffffff>] 0xffffffffffffffff
";

    fn write_stack(root: &Path, pid: u32, tid: u32, content: &str) {
        let dir = root.join(format!("{pid}/task/{tid}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stack"), content).unwrap();
    }

    #[test]
    fn test_parse_stack() {
        assert_eq!(
            parse_stack(STACK),
            vec![0xffffffff81000300, 0xffffffff81000100]
        );
        assert!(parse_stack("").is_empty());
        assert!(parse_stack("garbage\n[<zz>] nope\n").is_empty());
    }

    #[test]
    fn test_hidden_addresses_are_kept() {
        assert_eq!(parse_stack("[<0>] do_syscall_64+0x5b/0x1a0\n"), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_aggregates_identical_stacks() {
        let root = tempfile::tempdir().unwrap();
        write_stack(root.path(), 10, 10, STACK);
        write_stack(root.path(), 10, 11, STACK);
        write_stack(root.path(), 10, 12, "");
        write_stack(root.path(), 20, 20, "[<ffffffff81000100>] do_syscall_64+0x5b/0x1a0\n");

        let sampler = ProcStackSampler::new(10).with_proc_root(root.path());
        let raw = sampler
            .sample(&[10, 20, 30], Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(raw.period, Duration::from_millis(100));
        assert_eq!(raw.samples.len(), 2);

        assert_eq!(raw.samples[0].pid, 10);
        assert_eq!(
            raw.samples[0].kernel_stack,
            vec![0xffffffff81000300, 0xffffffff81000100]
        );
        assert_eq!(raw.samples[0].count, 20);

        assert_eq!(raw.samples[1].pid, 20);
        assert_eq!(raw.samples[1].count, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_waits_out_window_without_processes() {
        let root = tempfile::tempdir().unwrap();
        let sampler = ProcStackSampler::default().with_proc_root(root.path());

        let start = Instant::now();
        let raw = sampler.sample(&[], Duration::from_secs(10)).await.unwrap();

        assert!(raw.samples.is_empty());
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_ends_at_window_deadline() {
        let root = tempfile::tempdir().unwrap();
        write_stack(root.path(), 10, 10, STACK);
        let sampler = ProcStackSampler::default().with_proc_root(root.path());

        // 1s / 19 truncates, so a full tick schedule would run one tick past 10s.
        let start = Instant::now();
        let raw = sampler.sample(&[10], Duration::from_secs(10)).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(raw.samples.len(), 1);
        assert_eq!(raw.samples[0].count, 190);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_shorter_than_period_has_no_samples() {
        let root = tempfile::tempdir().unwrap();
        write_stack(root.path(), 10, 10, STACK);
        let sampler = ProcStackSampler::new(1).with_proc_root(root.path());

        let start = Instant::now();
        let raw = sampler
            .sample(&[10], Duration::from_millis(500))
            .await
            .unwrap();

        assert!(raw.samples.is_empty());
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }
}
