use crate::agent::Record;
use crate::profile::encode_gzip;
use crate::profilestorepb::profile_store_service_client::ProfileStoreServiceClient;
use crate::profilestorepb::{Label, LabelSet, RawProfileSeries, RawSample, WriteRawRequest};
use tonic::codec::CompressionEncoding;
use tonic::transport::Channel;

pub const PROFILE_NAME: &str = "parca_agent_cpu";

/// Destination of finished records.
#[tonic::async_trait]
pub trait ProfileStoreClient: Send + Sync {
    async fn store(&self, record: &Record) -> anyhow::Result<()>;
}

/// Accepts every record and drops it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProfileStoreClient;

#[tonic::async_trait]
impl ProfileStoreClient for NoopProfileStoreClient {
    async fn store(&self, _record: &Record) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes records to a profile store with `WriteRaw`.
#[derive(Debug, Clone)]
pub struct GrpcProfileStoreClient {
    client: ProfileStoreServiceClient<Channel>,
}

impl GrpcProfileStoreClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: ProfileStoreServiceClient::new(channel)
                .send_compressed(CompressionEncoding::Gzip),
        }
    }
}

#[tonic::async_trait]
impl ProfileStoreClient for GrpcProfileStoreClient {
    async fn store(&self, record: &Record) -> anyhow::Result<()> {
        let request = write_raw_request(record)?;
        // Clients share one channel; cloning only clones the handle.
        let mut client = self.client.clone();
        client
            .write_raw(request)
            .await
            .map_err(|status| anyhow::anyhow!("WriteRaw failed: {}", status.message()))?;
        Ok(())
    }
}

fn write_raw_request(record: &Record) -> anyhow::Result<WriteRawRequest> {
    let mut labels: Vec<Label> = record
        .labels
        .iter()
        .filter(|(name, _)| name.as_str() != "__name__")
        .map(|(name, value)| Label {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();
    labels.push(Label {
        name: "__name__".to_string(),
        value: PROFILE_NAME.to_string(),
    });
    labels.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(WriteRawRequest {
        tenant: String::new(),
        series: vec![RawProfileSeries {
            labels: Some(LabelSet { labels }),
            samples: vec![RawSample {
                raw_profile: encode_gzip(&record.profile)?,
            }],
        }],
        normalized: false,
    })
}
