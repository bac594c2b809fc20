//! reqwest-based client for the depot server endpoints.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Response};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::{parse_retry_after, FileRecord, PutFileResponse, RemoteError, Token};

// Network writes happen in small chunks so a slow server applies
// backpressure to the disk read instead of ballooning memory.
const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Clone)]
pub struct ServerClient {
    http: Client,
    base_url: String,
    metadata_timeout: Duration,
    content_timeout: Duration,
}

impl ServerClient {
    pub fn new(
        base_url: &str,
        metadata_timeout: Duration,
        content_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            metadata_timeout,
            content_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchange stored credentials for a bearer token.
    pub async fn login(&self, username: &str, password: &str) -> Result<Token, RemoteError> {
        let response = self
            .http
            .post(format!("{}/api/login", self.base_url))
            .timeout(self.metadata_timeout)
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Ship one metadata record. The response says whether the server wants
    /// the content for this SHA-256.
    pub async fn put_file(
        &self,
        token: &str,
        record: &FileRecord,
    ) -> Result<PutFileResponse, RemoteError> {
        let response = self
            .http
            .post(format!("{}/put_file", self.base_url))
            .timeout(self.metadata_timeout)
            .bearer_auth(token)
            .json(record)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Stream a file's content as multipart. The file is never buffered
    /// whole; `bytes_sent` is bumped as chunks leave the disk so the caller
    /// can report progress. The handle closes on every exit path because the
    /// stream owns it.
    pub async fn upload_file(
        &self,
        token: &str,
        sha256: &str,
        hostname: &str,
        filepath: &Path,
        size: u64,
        bytes_sent: Arc<AtomicU64>,
    ) -> Result<(), RemoteError> {
        let file = tokio::fs::File::open(filepath).await?;
        let stream = ReaderStream::with_capacity(file, STREAM_CHUNK).inspect_ok(move |chunk| {
            bytes_sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        });
        let file_name = filepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let part = Part::stream_with_length(Body::wrap_stream(stream), size)
            .file_name(file_name)
            .mime_str("application/octet-stream")?;
        let form = Form::new().part("file", part);

        let filepath_str = filepath.to_string_lossy();
        let response = self
            .http
            .post(format!("{}/upload_file/{}", self.base_url, sha256))
            .timeout(self.content_timeout)
            .query(&[("hostname", hostname), ("filepath", filepath_str.as_ref())])
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        check_status(response).await?;
        debug!(sha256 = %sha256, size, "content uploaded");
        Ok(())
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body: String = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(512)
        .collect();
    Err(RemoteError::Status {
        status: status.as_u16(),
        retry_after,
        body,
    })
}
