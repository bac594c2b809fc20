//! HTTP client for the remote depot server.
//!
//! Covers the three endpoints the daemon consumes: login, put_file
//! (metadata), and upload_file (streamed content). Errors carry enough
//! structure for the uploader to classify them into retry classes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod client;
pub mod retry;

pub use client::ServerClient;
pub use retry::{backoff_delay, parse_retry_after, RetryPolicy};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status {
        status: u16,
        retry_after: Option<Duration>,
        body: String,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the uploader should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Network errors, 5xx, 408, 429: back off and retry.
    Transient,
    /// 401/403: refresh the token once, then give up on the entry.
    Auth,
    /// Any other 4xx: the entry will never succeed as-is.
    Terminal,
}

impl RemoteError {
    pub fn class(&self) -> RetryClass {
        match self {
            RemoteError::Request(_) | RemoteError::Io(_) => RetryClass::Transient,
            RemoteError::Status { status, .. } => match status {
                401 | 403 => RetryClass::Auth,
                408 | 429 => RetryClass::Transient,
                500..=599 => RetryClass::Transient,
                _ => RetryClass::Terminal,
            },
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Bearer token returned by the login endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// One file's metadata record as the server expects it. File times are
/// Unix-seconds floats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filepath: String,
    pub hostname: String,
    pub ip_address: String,
    pub sha256: String,
    pub file_size: u64,
    pub file_mode: u32,
    pub file_uid: u32,
    pub file_gid: u32,
    pub file_mtime: f64,
    pub file_atime: f64,
    pub file_ctime: f64,
    pub is_symlink: bool,
    pub link_target: Option<String>,
}

/// put_file response: whether the server already has content for this
/// SHA-256, and where to send it when it does not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutFileResponse {
    pub upload_required: bool,
    #[serde(default)]
    pub upload_url: Option<String>,
}
