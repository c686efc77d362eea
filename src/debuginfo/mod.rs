mod grpc;

pub use grpc::GrpcDebuginfoClient;

use crate::error::Error;
use crate::profile::ObjectFile;
use anyhow::Context;
use std::collections::HashSet;
use std::sync::Arc;

#[tonic::async_trait]
pub trait DebuginfoClient: Send + Sync {
    /// Asks the store whether debug information for a build ID is wanted.
    async fn should_initiate_upload(&self, build_id: &str) -> anyhow::Result<bool>;

    async fn upload(&self, build_id: &str, payload: Vec<u8>) -> anyhow::Result<()>;
}

/// Wants nothing and accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDebuginfoClient;

#[tonic::async_trait]
impl DebuginfoClient for NoopDebuginfoClient {
    async fn should_initiate_upload(&self, _build_id: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn upload(&self, _build_id: &str, _payload: Vec<u8>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Uploads every build ID at most once over the lifetime of one profiler.
///
/// A build ID is remembered once it was uploaded or the store declined it. Failed attempts are
/// forgotten and retried the next time the build ID shows up.
pub struct Uploader {
    client: Arc<dyn DebuginfoClient>,
    seen: HashSet<String>,
}

impl Uploader {
    pub fn new(client: Arc<dyn DebuginfoClient>) -> Self {
        Self {
            client,
            seen: HashSet::new(),
        }
    }

    /// Uploads all objects not seen before and returns the failures.
    pub async fn upload(&mut self, objects: &[ObjectFile]) -> Vec<Error> {
        let mut failures = Vec::new();

        for object in objects {
            if self.seen.contains(&object.build_id) {
                continue;
            }
            match self.upload_one(object).await {
                Ok(()) => {
                    self.seen.insert(object.build_id.clone());
                }
                Err(e) => failures.push(Error::Delivery(
                    e.context(format!("debug info for build ID {}", object.build_id)),
                )),
            }
        }

        failures
    }

    async fn upload_one(&self, object: &ObjectFile) -> anyhow::Result<()> {
        if !self.client.should_initiate_upload(&object.build_id).await? {
            return Ok(());
        }

        let payload = tokio::fs::read(&object.path)
            .await
            .with_context(|| format!("failed to read {}", object.path.display()))?;
        self.client.upload(&object.build_id, payload).await
    }

    #[cfg(test)]
    pub fn seen(&self, build_id: &str) -> bool {
        self.seen.contains(build_id)
    }
}
