use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Root {
    pub id: i64,
    pub path: String,
    pub recursive: bool,
    pub enabled: bool,
    pub created_at: i64,
    pub last_scanned_at: Option<i64>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Exclude {
    pub id: i64,
    pub pattern: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub is_default: bool,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub token_expiry: Option<i64>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FileRow {
    pub id: i64,
    pub path: String,
    pub root_id: Option<i64>,
    pub size: i64,
    pub mtime_ns: i64,
    pub mode: i64,
    pub uid: i64,
    pub gid: i64,
    pub is_symlink: bool,
    pub link_target: Option<String>,
    pub sha256: Option<String>,
    pub status: String,
    pub last_error: Option<String>,
    pub discovered_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub kind: String,
    pub file_id: i64,
    pub upload_content: bool,
    pub enqueued_at: i64,
    pub attempts: i64,
    pub next_visible_at: i64,
    pub claim_token: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ActivityRow {
    pub id: i64,
    pub created_at: String,
    pub kind: String,
    pub file_path: Option<String>,
    pub root_id: Option<i64>,
    pub message: Option<String>,
    pub details: Option<String>,
}

/// Lifecycle of a file row. Stored as TEXT; `as_str` is the canonical form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Discovered,
    Hashing,
    ReadyForUpload,
    Uploading,
    Completed,
    Failed,
    Deleted,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Discovered => "discovered",
            FileStatus::Hashing => "hashing",
            FileStatus::ReadyForUpload => "ready_for_upload",
            FileStatus::Uploading => "uploading",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
            FileStatus::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three durable work queues between pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    PendingChecksum,
    PendingUpload,
    PendingDeletion,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::PendingChecksum => "pending_checksum",
            QueueKind::PendingUpload => "pending_upload",
            QueueKind::PendingDeletion => "pending_deletion",
        }
    }

    pub const ALL: [QueueKind; 3] = [
        QueueKind::PendingChecksum,
        QueueKind::PendingUpload,
        QueueKind::PendingDeletion,
    ];
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activity event kinds shown in the GUI and streamed over SSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    ScanStarted,
    ScanComplete,
    ScanRecovered,
    FileDiscovered,
    FileChanged,
    FileDeleted,
    FileMissing,
    FingerprintUnchanged,
    FingerprintFailed,
    UploadStarted,
    UploadProgress,
    UploadComplete,
    UploadFailed,
    Error,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::ScanStarted => "scan_started",
            ActivityKind::ScanComplete => "scan_complete",
            ActivityKind::ScanRecovered => "scan_recovered",
            ActivityKind::FileDiscovered => "file_discovered",
            ActivityKind::FileChanged => "file_changed",
            ActivityKind::FileDeleted => "file_deleted",
            ActivityKind::FileMissing => "file_missing",
            ActivityKind::FingerprintUnchanged => "fingerprint_unchanged",
            ActivityKind::FingerprintFailed => "fingerprint_failed",
            ActivityKind::UploadStarted => "upload_started",
            ActivityKind::UploadProgress => "upload_progress",
            ActivityKind::UploadComplete => "upload_complete",
            ActivityKind::UploadFailed => "upload_failed",
            ActivityKind::Error => "error",
        }
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
