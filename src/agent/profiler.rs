use super::target::{SystemdUnitTarget, CGROUP_ROOT};
use super::{ExternalLabels, Record};
use crate::debuginfo::{DebuginfoClient, Uploader};
use crate::error::Error;
use crate::ksym::KernelSymbols;
use crate::pprofpb::Profile;
use crate::process::{self, JvmAttachConfig, PROC_ROOT};
use crate::profile::executableinfo::BuildIdCache;
use crate::profile::{encode_gzip, ObjectFile, ProfileBuilder};
use crate::profile_store::ProfileStoreClient;
use crate::sampler::{ProcStackSampler, Sampler};
use crate::symbolizer::SymbolResolver;
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Receives every finished record on the profiler's own task.
pub type Sink = Box<dyn Fn(Record) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilerState {
    Constructed,
    Running,
    /// Cancelled cleanly.
    Stopped,
    /// The target could not be profiled at all.
    Failed,
}

/// Profiles the processes of one systemd unit, one record per sampling window.
///
/// A profiler runs once. After [`CgroupProfiler::run`] returned, a new instance has to be
/// constructed to profile the target again.
pub struct CgroupProfiler {
    labels: ExternalLabels,
    resolver: SymbolResolver,
    profile_store: Arc<dyn ProfileStoreClient>,
    uploader: Uploader,
    target: SystemdUnitTarget,
    sampling_duration: Duration,
    sink: Sink,
    scratch_path: PathBuf,

    sampler: Arc<dyn Sampler>,
    jvm: JvmAttachConfig,
    proc_root: PathBuf,
    cgroup_root: PathBuf,
    kernel_build_id: Option<String>,
    build_ids: BuildIdCache,
    state: ProfilerState,
}

impl CgroupProfiler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        external_labels: ExternalLabels,
        ksyms: Arc<dyn KernelSymbols>,
        profile_store: Arc<dyn ProfileStoreClient>,
        debuginfo: Arc<dyn DebuginfoClient>,
        target: SystemdUnitTarget,
        sampling_duration: Duration,
        sink: Sink,
        scratch_path: impl Into<PathBuf>,
    ) -> Self {
        // External labels take precedence over the ones derived from the target.
        let mut labels = target.labels();
        labels.extend(external_labels);

        Self {
            labels,
            resolver: SymbolResolver::new(ksyms),
            profile_store,
            uploader: Uploader::new(debuginfo),
            target,
            sampling_duration,
            sink,
            scratch_path: scratch_path.into(),
            sampler: Arc::new(ProcStackSampler::default()),
            jvm: JvmAttachConfig::default(),
            proc_root: PathBuf::from(PROC_ROOT),
            cgroup_root: PathBuf::from(CGROUP_ROOT),
            kernel_build_id: None,
            build_ids: BuildIdCache::default(),
            state: ProfilerState::Constructed,
        }
    }

    #[must_use]
    pub fn with_sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    #[must_use]
    pub fn with_jvm_attach(mut self, jvm: JvmAttachConfig) -> Self {
        self.jvm = jvm;
        self
    }

    #[cfg(test)]
    #[must_use]
    pub fn with_roots(mut self, proc_root: impl Into<PathBuf>, cgroup_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self.cgroup_root = cgroup_root.into();
        self
    }

    #[must_use]
    pub fn with_kernel_build_id(mut self, build_id: Option<String>) -> Self {
        self.kernel_build_id = build_id;
        self
    }

    pub fn state(&self) -> ProfilerState {
        self.state
    }

    #[cfg(test)]
    pub fn labels(&self) -> &ExternalLabels {
        &self.labels
    }

    /// Profiles the target until `cancel` is triggered.
    ///
    /// Returns `Ok` on cancellation. Failures of single processes or cycles are logged and
    /// profiling continues; only a target whose cgroup cannot be found ends the loop with an
    /// error.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), Error> {
        if self.state != ProfilerState::Constructed {
            return Err(Error::AlreadyStarted);
        }
        self.state = ProfilerState::Running;

        let cgroup = self.target.cgroup_path(&self.cgroup_root);
        if !cgroup.is_dir() {
            self.state = ProfilerState::Failed;
            let err = Error::CgroupNotFound { path: cgroup };
            log::error!("Cannot profile {}: {}", self.target.name, err);
            return Err(err);
        }

        log::info!(
            "Profiling {} in {} every {:?}",
            self.target.name,
            cgroup.display(),
            self.sampling_duration
        );

        let mut ticker = tokio::time::interval(self.sampling_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.cycle() => result,
            };

            if let Err(e) = result {
                log::warn!("Skipping cycle of {}: {}", self.target.name, e);
            }
        }

        self.state = ProfilerState::Stopped;
        log::info!("Stopped profiling {}", self.target.name);
        Ok(())
    }

    async fn cycle(&mut self) -> Result<(), Error> {
        let pids = self.target.pids(&self.cgroup_root).map_err(Error::Cycle)?;

        for e in self.prepare(&pids).await {
            if e.is_not_found() {
                log::debug!("{}: {}", self.target.name, e);
            } else {
                log::warn!("{}: {}", self.target.name, e);
            }
        }

        let started_at = Utc::now();
        let raw = self
            .sampler
            .sample(&pids, self.sampling_duration)
            .await
            .map_err(Error::Cycle)?;

        // Reads /proc maps and object files.
        let builder = ProfileBuilder::new(
            self.resolver.clone(),
            self.proc_root.clone(),
            self.kernel_build_id.clone(),
            self.build_ids.clone(),
        );
        let duration = self.sampling_duration;
        let built =
            tokio::task::spawn_blocking(move || builder.build(&raw, started_at, duration))
                .await
                .map_err(|e| Error::Cycle(e.into()))?;

        log::debug!(
            "{}: {} processes, {} samples, {} locations",
            self.target.name,
            pids.len(),
            built.profile.sample.len(),
            built.profile.location.len()
        );

        let record = Record {
            profile: built.profile,
            labels: self.labels.clone(),
        };

        if let Err(e) = self.write_scratch(&record.profile).await {
            log::warn!(
                "{}: failed to write {}: {:#}",
                self.target.name,
                self.scratch_path.display(),
                e
            );
        }

        self.deliver(record, &built.objects).await;
        Ok(())
    }

    // Every process is prepared independently, failures are collected.
    async fn prepare(&self, pids: &[u32]) -> Vec<Error> {
        let mut failures = Vec::new();
        for &pid in pids {
            let result = match process::detect(&self.proc_root, pid) {
                Ok(process) => {
                    if process.is_jvm() {
                        log::debug!(
                            "{}: pid {} runs {}, attaching perf map agent",
                            self.target.name,
                            process.pid(),
                            process.executable().display()
                        );
                    }
                    process.prepare_to_profile(&self.jvm).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                failures.push(e);
            }
        }
        failures
    }

    async fn deliver(&mut self, record: Record, objects: &[ObjectFile]) {
        if let Err(e) = self.profile_store.store(&record).await {
            log::warn!("{}: {}", self.target.name, Error::Delivery(e));
        }

        for e in self.uploader.upload(objects).await {
            log::warn!("{}: {}", self.target.name, e);
        }

        (self.sink)(record);
    }

    async fn write_scratch(&self, profile: &Profile) -> anyhow::Result<()> {
        let data = encode_gzip(profile)?;
        let path = self.scratch_path.clone();
        tokio::task::spawn_blocking(move || replace_file(&path, &data)).await?
    }
}

// Replaced atomically so readers never see a partial profile.
fn replace_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    file.persist(path)?;
    Ok(())
}
