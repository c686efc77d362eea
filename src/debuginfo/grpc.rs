use super::DebuginfoClient;
use crate::debuginfopb::debuginfo_service_client::DebuginfoServiceClient;
use crate::debuginfopb::upload_instructions::UploadStrategy;
use crate::debuginfopb::{
    upload_request, BuildIdType, DebuginfoType, InitiateUploadRequest, MarkUploadFinishedRequest,
    ShouldInitiateUploadRequest, UploadInfo, UploadInstructions, UploadRequest,
};
use anyhow::{anyhow, bail, Context};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio_stream::Stream;
use tonic::transport::Channel;
use url::Url;

/// Largest chunk of object data sent in one `Upload` message.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Uploads executables to a debug info store over `parca.debuginfo.v1alpha1`.
#[derive(Debug, Clone)]
pub struct GrpcDebuginfoClient {
    client: DebuginfoServiceClient<Channel>,
    http: ureq::Agent,
}

impl GrpcDebuginfoClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: DebuginfoServiceClient::new(channel),
            http: ureq::AgentBuilder::new()
                .timeout_read(Duration::from_secs(30))
                .timeout_write(Duration::from_secs(30))
                .redirects(2)
                .build(),
        }
    }

    async fn upload_grpc(
        &self,
        instructions: &UploadInstructions,
        payload: Vec<u8>,
    ) -> anyhow::Result<()> {
        let size = payload.len() as u64;
        let info = UploadInfo {
            build_id: instructions.build_id.clone(),
            upload_id: instructions.upload_id.clone(),
            r#type: instructions.r#type,
        };

        let mut client = self.client.clone();
        let response = client
            .upload(upload_requests(info, payload))
            .await
            .map_err(rpc_error("Upload"))?
            .into_inner();

        if response.size != size {
            bail!(
                "store received {} of {} bytes for build ID {}",
                response.size,
                size,
                instructions.build_id
            );
        }
        Ok(())
    }

    async fn upload_signed_url(&self, signed_url: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let url = Url::parse(signed_url).context("invalid signed upload URL")?;
        let agent = self.http.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            agent
                .put(url.as_str())
                .send_bytes(&payload)
                .with_context(|| format!("failed to upload to {}", url.host_str().unwrap_or("")))?;
            Ok(())
        })
        .await?
    }
}

#[tonic::async_trait]
impl DebuginfoClient for GrpcDebuginfoClient {
    async fn should_initiate_upload(&self, build_id: &str) -> anyhow::Result<bool> {
        let mut client = self.client.clone();
        let response = client
            .should_initiate_upload(ShouldInitiateUploadRequest {
                build_id: build_id.to_string(),
                r#type: DebuginfoType::DebuginfoUnspecified as i32,
                build_id_type: BuildIdType::Gnu as i32,
                ..Default::default()
            })
            .await
            .map_err(rpc_error("ShouldInitiateUpload"))?
            .into_inner();

        if !response.should_initiate_upload {
            log::debug!(
                "Store does not need debug info for {}: {}",
                build_id,
                response.reason
            );
        }
        Ok(response.should_initiate_upload)
    }

    async fn upload(&self, build_id: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let mut client = self.client.clone();
        let instructions = client
            .initiate_upload(InitiateUploadRequest {
                build_id: build_id.to_string(),
                size: payload.len() as i64,
                hash: hash(&payload),
                force: false,
                r#type: DebuginfoType::DebuginfoUnspecified as i32,
                build_id_type: BuildIdType::Gnu as i32,
            })
            .await
            .map_err(rpc_error("InitiateUpload"))?
            .into_inner()
            .upload_instructions
            .ok_or_else(|| anyhow!("InitiateUpload returned no upload instructions"))?;

        match UploadStrategy::try_from(instructions.upload_strategy) {
            Ok(UploadStrategy::Grpc) => self.upload_grpc(&instructions, payload).await?,
            Ok(UploadStrategy::SignedUrl) => {
                self.upload_signed_url(&instructions.signed_url, payload)
                    .await?
            }
            _ => bail!(
                "unsupported upload strategy {}",
                instructions.upload_strategy
            ),
        }

        client
            .mark_upload_finished(MarkUploadFinishedRequest {
                build_id: build_id.to_string(),
                upload_id: instructions.upload_id,
                r#type: instructions.r#type,
            })
            .await
            .map_err(rpc_error("MarkUploadFinished"))?;

        log::info!("Uploaded debug info for build ID {}", build_id);
        Ok(())
    }
}

/// Hex encoded SHA-256 of the uploaded content.
fn hash(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

fn rpc_error(method: &'static str) -> impl FnOnce(tonic::Status) -> anyhow::Error {
    move |status| anyhow!("{} failed: {}", method, status.message())
}

// The info message opens the stream, data follows in chunks.
fn upload_requests(info: UploadInfo, payload: Vec<u8>) -> impl Stream<Item = UploadRequest> {
    async_stream::stream! {
        yield UploadRequest {
            data: Some(upload_request::Data::Info(info)),
        };
        for chunk in payload.chunks(CHUNK_SIZE) {
            yield UploadRequest {
                data: Some(upload_request::Data::ChunkData(chunk.to_vec())),
            };
        }
    }
}
