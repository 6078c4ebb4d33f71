use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::debug;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::transport::ByteStream;
use super::Server;
use crate::error::ConnectionError;

/// Random bytes sent repeatedly as upload body chunks.
#[derive(Debug, Clone)]
pub struct UploadPayload {
    chunk: Bytes,
}

impl UploadPayload {
    pub fn random(size: usize) -> Self {
        let mut rng = rand::rngs::StdRng::from_entropy();
        let data: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
        Self {
            chunk: Bytes::from(data),
        }
    }

    /// Chunks totalling `total` bytes; the last one is cut short.
    fn chunks(&self, total: u64) -> impl Iterator<Item = Bytes> + Send + 'static {
        let chunk = self.chunk.clone();
        let size = chunk.len() as u64;
        let full = total / size;
        let rest = (total % size) as usize;
        let tail = (rest > 0).then(|| chunk.slice(..rest));
        (0..full).map(move |_| chunk.clone()).chain(tail)
    }
}

/// Streams `total` bytes of payload as one POST body. Chunks are counted as
/// the HTTP client pulls them, so counts follow socket write progress.
pub fn open_upload(
    client: &reqwest::Client,
    server: &Server,
    payload: UploadPayload,
    total: u64,
) -> ByteStream {
    let (tx, rx) = mpsc::unbounded_channel();
    let progress = tx.clone();
    let body = futures::stream::iter(payload.chunks(total)).map(move |chunk| {
        let _ = progress.send(Ok(chunk.len() as u64));
        Ok::<_, std::io::Error>(chunk)
    });
    let request = client
        .post(server.upload_url())
        .body(reqwest::Body::wrap_stream(body));
    let host = server.host.clone();

    let task = tokio::spawn(async move {
        match request.send().await.and_then(|r| r.error_for_status()) {
            Ok(_) => debug!("Upload request to {host} complete"),
            Err(err) => {
                let _ = tx.send(Err(ConnectionError::from(err)));
            }
        }
    });

    Box::pin(UploadStream { rx, task })
}

/// Receives byte counts from the in-flight request; dropping it aborts the
/// request and closes its connection.
struct UploadStream {
    rx: mpsc::UnboundedReceiver<Result<u64, ConnectionError>>,
    task: JoinHandle<()>,
}

impl Stream for UploadStream {
    type Item = Result<u64, ConnectionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for UploadStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}
