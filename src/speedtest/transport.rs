use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use super::download::open_download;
use super::upload::{open_upload, UploadPayload};
use super::{Phase, Server};
use crate::error::ConnectionError;
use crate::settings::Settings;

/// Byte counts as they cross one connection. The stream ends when the
/// current transfer completes cleanly; dropping it closes the connection.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<u64, ConnectionError>> + Send>>;

/// Opens one throughput connection for a phase.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, phase: Phase, server: &Server) -> Result<ByteStream, ConnectionError>;
}

/// Cloudflare-style `__down` / `__up` endpoints over HTTP/1.1, so every open
/// request gets its own TCP connection.
pub struct HttpConnector {
    client: reqwest::Client,
    download_bytes: u64,
    upload_bytes: u64,
    payload: UploadPayload,
}

impl HttpConnector {
    pub fn new(settings: &Settings) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .http1_only()
            .connect_timeout(settings.connect_timeout())
            .user_agent(settings.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            download_bytes: settings.download_request_bytes,
            upload_bytes: settings.upload_request_bytes,
            payload: UploadPayload::random(settings.upload_chunk_bytes),
        })
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn open(&self, phase: Phase, server: &Server) -> Result<ByteStream, ConnectionError> {
        match phase {
            Phase::Download => open_download(&self.client, server, self.download_bytes).await,
            Phase::Upload => Ok(open_upload(
                &self.client,
                server,
                self.payload.clone(),
                self.upload_bytes,
            )),
        }
    }
}
