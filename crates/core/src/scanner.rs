//! File discovery: full walks of registered roots.
//!
//! The scanner only observes and enqueues; hashing is the fingerprinter's
//! job. Each observation is one Store transaction (upsert + enqueue +
//! activity), so the scanner never blocks on downstream stages.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use storage::models::{ActivityKind, Root};
use storage::store::{Discovery, ScannedFile};
use storage::Store;
use tokio::task;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Compiled exclude patterns. A pattern matches a file when it equals the
/// root-relative path, equals any path component, or (containing `*`)
/// glob-matches the relative path or any component.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    literals: Vec<String>,
    globs: Vec<GlobMatcher>,
}

impl ExcludeSet {
    pub fn new(patterns: &[String]) -> Self {
        let mut literals = Vec::new();
        let mut globs = Vec::new();
        for pattern in patterns {
            if pattern.is_empty() {
                continue;
            }
            if pattern.contains('*') {
                match Glob::new(pattern) {
                    Ok(glob) => globs.push(glob.compile_matcher()),
                    Err(err) => {
                        warn!(pattern = %pattern, error = %err, "ignoring invalid exclude pattern");
                    }
                }
            } else {
                literals.push(pattern.clone());
            }
        }
        Self { literals, globs }
    }

    pub async fn from_store(store: &Store) -> anyhow::Result<Self> {
        let patterns: Vec<String> = store
            .list_excludes()
            .await?
            .into_iter()
            .map(|e| e.pattern)
            .collect();
        Ok(Self::new(&patterns))
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty() && self.globs.is_empty()
    }

    /// `rel` is the path relative to the scanned root.
    pub fn matches(&self, rel: &Path) -> bool {
        let rel_str = rel.to_string_lossy();
        for literal in &self.literals {
            if rel_str == literal.as_str() {
                return true;
            }
            if rel
                .components()
                .any(|c| c.as_os_str().to_string_lossy() == literal.as_str())
            {
                return true;
            }
        }
        for glob in &self.globs {
            if glob.is_match(rel) {
                return true;
            }
            if rel.components().any(|c| glob.is_match(c.as_os_str())) {
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ScanSummary {
    pub root_id: i64,
    pub path: String,
    pub total_files: usize,
    pub logged_files: usize,
    pub skipped_files: usize,
    pub error_count: usize,
}

/// Stat one on-disk entry into the shape the store records. Symlinks are
/// recorded with their own stat and target, never followed.
pub fn stat_file(path: &Path) -> std::io::Result<ScannedFile> {
    let meta = std::fs::symlink_metadata(path)?;
    let is_symlink = meta.file_type().is_symlink();
    let link_target = if is_symlink {
        std::fs::read_link(path)
            .ok()
            .map(|t| t.to_string_lossy().into_owned())
    } else {
        None
    };
    Ok(ScannedFile {
        path: path.to_string_lossy().into_owned(),
        root_id: 0,
        size: meta.size() as i64,
        mtime_ns: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
        mode: meta.mode() as i64,
        uid: meta.uid() as i64,
        gid: meta.gid() as i64,
        is_symlink,
        link_target,
    })
}

/// Walk a root and collect stat records for every non-excluded file.
/// Unreadable entries are skipped and counted. Blocking; run off the
/// async runtime.
fn collect_files(
    root_path: &Path,
    recursive: bool,
    excludes: &ExcludeSet,
) -> (Vec<ScannedFile>, usize) {
    let mut files = Vec::new();
    let mut errors = 0usize;

    let mut walker = WalkDir::new(root_path).follow_links(false);
    if !recursive {
        walker = walker.max_depth(1);
    }
    let root_for_filter = root_path.to_path_buf();
    let excludes_for_filter = excludes.clone();
    let iter = walker.into_iter().filter_entry(move |entry| {
        // Skip excluded directories without descending into them.
        if entry.depth() == 0 {
            return true;
        }
        match entry.path().strip_prefix(&root_for_filter) {
            Ok(rel) => !excludes_for_filter.matches(rel),
            Err(_) => true,
        }
    });

    for entry in iter {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "unreadable entry during scan");
                errors += 1;
                continue;
            }
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        match stat_file(entry.path()) {
            Ok(scanned) => files.push(scanned),
            Err(err) => {
                warn!(path = %entry.path().display(), error = %err, "cannot stat file");
                errors += 1;
            }
        }
    }

    (files, errors)
}

/// Full scan of one root: walk, then record each observation through the
/// store. Bracketed by scan_started / scan_complete activity events.
pub async fn scan_root(
    store: &Store,
    root: &Root,
    excludes: &ExcludeSet,
) -> anyhow::Result<ScanSummary> {
    let root_path = PathBuf::from(&root.path);
    info!(root = %root.path, "scan started");
    store
        .append_activity(
            ActivityKind::ScanStarted,
            None,
            Some(root.id),
            Some(&format!("Started scanning {}", root.path)),
            Some(serde_json::json!({ "recursive": root.recursive })),
        )
        .await?;

    let recursive = root.recursive;
    let excludes_for_walk = excludes.clone();
    let walk_path = root_path.clone();
    let (files, mut error_count) =
        task::spawn_blocking(move || collect_files(&walk_path, recursive, &excludes_for_walk))
            .await?;
    let total_files = files.len();
    debug!(root = %root.path, total = total_files, "walk finished");

    let mut logged_files = 0usize;
    let mut skipped_files = 0usize;
    for mut file in files {
        file.root_id = root.id;
        match store.record_scanned(&file).await {
            Ok(Discovery::New) | Ok(Discovery::Changed) => logged_files += 1,
            Ok(Discovery::Unchanged) => skipped_files += 1,
            Err(err) => {
                warn!(path = %file.path, error = %err, "failed to record file");
                error_count += 1;
            }
        }
    }

    store.touch_root_scanned(root.id).await?;
    store
        .append_activity(
            ActivityKind::ScanComplete,
            None,
            Some(root.id),
            Some(&format!("Completed scanning {}", root.path)),
            Some(serde_json::json!({
                "total_files": total_files,
                "logged_files": logged_files,
                "skipped_files": skipped_files,
                "errors": error_count,
            })),
        )
        .await?;
    info!(
        root = %root.path,
        total = total_files,
        logged = logged_files,
        skipped = skipped_files,
        errors = error_count,
        "scan complete"
    );

    Ok(ScanSummary {
        root_id: root.id,
        path: root.path.clone(),
        total_files,
        logged_files,
        skipped_files,
        error_count,
    })
}

/// Scan every enabled root sequentially. Roots whose path is gone are
/// reported on the activity log and skipped.
pub async fn scan_all(store: &Store) -> anyhow::Result<Vec<ScanSummary>> {
    let excludes = ExcludeSet::from_store(store).await?;
    let mut results = Vec::new();
    for root in store.enabled_roots().await? {
        let path = Path::new(&root.path);
        if !path.is_dir() {
            warn!(root = %root.path, "root path is not a directory");
            store
                .append_activity(
                    ActivityKind::Error,
                    None,
                    Some(root.id),
                    Some(&format!("Path does not exist: {}", root.path)),
                    None,
                )
                .await?;
            continue;
        }
        results.push(scan_root(store, &root, &excludes).await?);
    }
    Ok(results)
}
