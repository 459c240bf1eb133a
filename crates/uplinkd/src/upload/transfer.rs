//! HTTP transfer of one upload item.
//!
//! The body is streamed from disk. After every chunk the caller's progress
//! callback decides whether to keep going; a `Break` ends the transfer with
//! [`TransferError::Aborted`], which is kept apart from network failures so
//! the worker can requeue without counting a retry.

use super::queue::UploadItem;
use futures_util::stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::debug;

const CHUNK_SIZE: usize = 64 * 1024;
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Called with `(bytes_sent, total)`; `Break` aborts the transfer.
pub type ProgressFn = Arc<dyn Fn(u64, u64) -> ControlFlow<()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer aborted")]
    Aborted,
    #[error("network error: {0}")]
    Network(String),
    /// The item can never be sent as given (bad header or URL).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that can PUT a file to a URL and report the HTTP status.
pub trait Uploader: Send + Sync {
    fn put<'a>(
        &'a self,
        item: &'a UploadItem,
        progress: ProgressFn,
    ) -> Pin<Box<dyn Future<Output = Result<u16, TransferError>> + Send + 'a>>;
}

pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new() -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|e| TransferError::Network(e.to_string()))?;
        Ok(Self { client })
    }

    async fn put_file(&self, item: &UploadItem, progress: ProgressFn) -> Result<u16, TransferError> {
        let file = tokio::fs::File::open(&item.path).await?;
        let total = file.metadata().await?.len();

        let mut headers = HeaderMap::new();
        for (k, v) in &item.headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| TransferError::InvalidRequest(format!("bad header name {k}: {e}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| TransferError::InvalidRequest(format!("bad header value for {k}: {e}")))?;
            headers.insert(name, value);
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(total));

        let aborted = Arc::new(AtomicBool::new(false));
        let body = reqwest::Body::wrap_stream(body_stream(
            file,
            total,
            progress,
            aborted.clone(),
        ));

        let result = self
            .client
            .put(&item.url)
            .headers(headers)
            .body(body)
            .send()
            .await;

        if aborted.load(Ordering::SeqCst) {
            return Err(TransferError::Aborted);
        }
        match result {
            Ok(resp) => Ok(resp.status().as_u16()),
            Err(e) if e.is_builder() => Err(TransferError::InvalidRequest(e.to_string())),
            Err(e) => Err(TransferError::Network(e.to_string())),
        }
    }
}

impl Uploader for HttpUploader {
    fn put<'a>(
        &'a self,
        item: &'a UploadItem,
        progress: ProgressFn,
    ) -> Pin<Box<dyn Future<Output = Result<u16, TransferError>> + Send + 'a>> {
        Box::pin(self.put_file(item, progress))
    }
}

struct BodyState {
    file: tokio::fs::File,
    sent: u64,
    total: u64,
    progress: ProgressFn,
    aborted: Arc<AtomicBool>,
}

/// Chunks of the file, consulting `progress` after each one.
fn body_stream(
    file: tokio::fs::File,
    total: u64,
    progress: ProgressFn,
    aborted: Arc<AtomicBool>,
) -> impl futures_util::Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
    let state = BodyState {
        file,
        sent: 0,
        total,
        progress,
        aborted,
    };
    stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = match state.file.read(&mut buf).await {
            Ok(0) => return None,
            Ok(n) => n,
            Err(e) => return Some((Err(e), None)),
        };
        buf.truncate(n);
        state.sent += n as u64;
        if (state.progress)(state.sent, state.total).is_break() {
            debug!(sent = state.sent, total = state.total, "upload aborted by callback");
            state.aborted.store(true, Ordering::SeqCst);
            return Some((
                Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "upload aborted",
                )),
                None,
            ));
        }
        Some((Ok(buf), Some(state)))
    })
}
