use futures::{StreamExt, TryStreamExt};
use log::debug;

use super::transport::ByteStream;
use super::Server;
use crate::error::ConnectionError;

/// Requests `bytes` from the server and streams the body's chunk sizes.
pub async fn open_download(
    client: &reqwest::Client,
    server: &Server,
    bytes: u64,
) -> Result<ByteStream, ConnectionError> {
    let response = client
        .get(server.download_url())
        .query(&[("bytes", bytes)])
        .send()
        .await?
        .error_for_status()?;
    debug!(
        "Download stream from {} ({} bytes announced)",
        server.host,
        response.content_length().unwrap_or(bytes)
    );

    let stream = response
        .bytes_stream()
        .map_ok(|chunk| chunk.len() as u64)
        .map_err(ConnectionError::from);
    Ok(stream.boxed())
}
