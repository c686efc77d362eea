use crate::agent::Record;
use crate::debuginfo::DebuginfoClient;
use crate::ksym::KernelSymbols;
use crate::profile::maps::{ExecutableMapping, ProcessMappings};
use crate::profile::RawProfile;
use crate::profile_store::ProfileStoreClient;
use crate::sampler::Sampler;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The mapping of this test binary's own executable, as seen through `/proc`.
pub fn own_executable_mapping() -> ExecutableMapping {
    let exe = std::env::current_exe().unwrap();
    ProcessMappings::read(Path::new("/proc"), std::process::id())
        .unwrap()
        .iter()
        .find(|m| Path::new(&m.path) == exe)
        .unwrap()
        .clone()
}

/// Kernel symbols known by their exact address only.
pub struct StaticKsyms(HashMap<u64, Arc<str>>);

impl StaticKsyms {
    pub fn new(syms: &[(u64, &str)]) -> Self {
        Self(
            syms.iter()
                .map(|&(addr, name)| (addr, Arc::from(name)))
                .collect(),
        )
    }
}

impl KernelSymbols for StaticKsyms {
    fn lookup(&self, addr: u64) -> Option<Arc<str>> {
        self.0.get(&addr).cloned()
    }
}

/// Waits out the window like a real sampler and answers from a script, then with empty profiles.
pub struct ScriptedSampler {
    script: Mutex<VecDeque<anyhow::Result<RawProfile>>>,
    calls: Mutex<Vec<Vec<u32>>>,
}

impl ScriptedSampler {
    pub fn new(script: Vec<anyhow::Result<RawProfile>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<u32>> {
        self.calls.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl Sampler for ScriptedSampler {
    async fn sample(&self, pids: &[u32], duration: Duration) -> anyhow::Result<RawProfile> {
        self.calls.lock().unwrap().push(pids.to_vec());
        tokio::time::sleep(duration).await;
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(RawProfile::default()))
    }
}

#[derive(Default)]
pub struct RecordingProfileStoreClient {
    records: Mutex<Vec<Record>>,
}

impl RecordingProfileStoreClient {
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl ProfileStoreClient for RecordingProfileStoreClient {
    async fn store(&self, record: &Record) -> anyhow::Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

pub struct FailingProfileStoreClient;

#[tonic::async_trait]
impl ProfileStoreClient for FailingProfileStoreClient {
    async fn store(&self, _record: &Record) -> anyhow::Result<()> {
        anyhow::bail!("store unavailable")
    }
}

/// Records upload checks and uploads, wanting every build ID when `wanted` is set.
pub struct RecordingDebuginfoClient {
    wanted: bool,
    checks: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(String, usize)>>,
}

impl RecordingDebuginfoClient {
    pub fn new(wanted: bool) -> Self {
        Self {
            wanted,
            checks: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn checks(&self) -> Vec<String> {
        self.checks.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(String, usize)> {
        self.uploads.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl DebuginfoClient for RecordingDebuginfoClient {
    async fn should_initiate_upload(&self, build_id: &str) -> anyhow::Result<bool> {
        self.checks.lock().unwrap().push(build_id.to_string());
        Ok(self.wanted)
    }

    async fn upload(&self, build_id: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((build_id.to_string(), payload.len()));
        Ok(())
    }
}
