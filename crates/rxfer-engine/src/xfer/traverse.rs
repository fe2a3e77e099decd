//! Bounded breadth-first directory expansion.
//!
//! Each depth level is listed in parallel batches; the walk stops adding
//! entries once the entry or depth cap is hit and reports `truncated`.
//! Ignored entries are recorded and never descended into.

use crate::xfer::error::XferResult;
use crate::xfer::paths;
use crate::xfer::session::RemoteSession;
use crate::xfer::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use glob::Pattern;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

// ── Ignore globs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    patterns: Vec<Pattern>,
}

impl IgnoreMatcher {
    /// Invalid patterns are logged and dropped.
    pub fn new(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| match Pattern::new(p) {
                Ok(pat) => Some(pat),
                Err(e) => {
                    warn!("Ignoring invalid ignore pattern '{}': {}", p, e);
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Match against the relative path, the file name and every ancestor
    /// directory name.
    pub fn is_ignored(&self, relative_path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let rel = relative_path.trim_start_matches('/');
        let mut candidates = vec![rel];
        candidates.extend(rel.split('/').filter(|s| !s.is_empty()));
        self.patterns
            .iter()
            .any(|pat| candidates.iter().any(|c| pat.matches(c)))
    }
}

// ── Listing sources ──────────────────────────────────────────────────────────

/// One child of a listed directory.
#[derive(Debug, Clone)]
pub struct ListedEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Lists a directory given its path relative to the walk root.
#[async_trait]
pub trait DirLister: Send + Sync {
    async fn list(&self, relative_dir: &str) -> XferResult<Vec<ListedEntry>>;
}

pub struct LocalLister {
    root: PathBuf,
}

impl LocalLister {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DirLister for LocalLister {
    async fn list(&self, relative_dir: &str) -> XferResult<Vec<ListedEntry>> {
        let dir = if relative_dir.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative_dir)
        };
        let mut rd = tokio::fs::read_dir(&dir).await?;
        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = entry.file_type().await?;
            let (kind, meta) = if file_type.is_symlink() {
                // Follow links to files; linked directories are not descended.
                match tokio::fs::metadata(entry.path()).await {
                    Ok(m) if m.is_file() => (EntryKind::File, Some(m)),
                    Ok(m) => (EntryKind::Symlink, Some(m)),
                    Err(_) => (EntryKind::Symlink, None),
                }
            } else if file_type.is_dir() {
                (EntryKind::Directory, entry.metadata().await.ok())
            } else if file_type.is_file() {
                (EntryKind::File, entry.metadata().await.ok())
            } else {
                (EntryKind::Unknown, None)
            };
            out.push(ListedEntry {
                name,
                kind,
                size: meta.as_ref().map(|m| m.len()).unwrap_or(0),
                modified: meta
                    .and_then(|m| m.modified().ok())
                    .map(DateTime::<Utc>::from),
            });
        }
        Ok(out)
    }
}

pub struct RemoteLister {
    session: Arc<dyn RemoteSession>,
    root: String,
}

impl RemoteLister {
    pub fn new(session: Arc<dyn RemoteSession>, root: &str) -> Self {
        Self {
            session,
            root: paths::normalize(root),
        }
    }
}

#[async_trait]
impl DirLister for RemoteLister {
    async fn list(&self, relative_dir: &str) -> XferResult<Vec<ListedEntry>> {
        let dir = paths::join(&self.root, relative_dir);
        let entries = self.session.list(&dir).await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.name != "." && e.name != "..")
            .map(|e| ListedEntry {
                name: e.name,
                kind: e.kind,
                size: e.size,
                modified: e.modified,
            })
            .collect())
    }
}

// ── Walk ─────────────────────────────────────────────────────────────────────

/// A file or directory found below the walk root.
#[derive(Debug, Clone)]
pub struct CandidateEntry {
    /// `/`-separated path relative to the root.
    pub relative_path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct TraversalOutcome {
    pub entries: Vec<CandidateEntry>,
    /// Relative paths matched by an ignore pattern.
    pub skipped: Vec<String>,
    /// Sub-directories that could not be listed, with the error.
    pub unreadable: Vec<(String, String)>,
    pub truncated: bool,
}

impl TraversalOutcome {
    pub fn files(&self) -> impl Iterator<Item = &CandidateEntry> {
        self.entries.iter().filter(|e| e.kind == EntryKind::File)
    }

    pub fn directories(&self) -> impl Iterator<Item = &CandidateEntry> {
        self.entries.iter().filter(|e| e.kind == EntryKind::Directory)
    }

    /// Entries keyed by relative path.
    pub fn index(&self) -> HashMap<String, CandidateEntry> {
        self.entries
            .iter()
            .map(|e| (e.relative_path.clone(), e.clone()))
            .collect()
    }
}

/// Walk the tree below the lister's root. Failing to list the root itself
/// is an error; unreadable sub-directories are reported and skipped.
pub async fn walk(
    lister: &dyn DirLister,
    limits: &TraversalLimits,
    ignore: &IgnoreMatcher,
) -> XferResult<TraversalOutcome> {
    let mut outcome = TraversalOutcome::default();
    let batch = limits.batch_size.max(1);

    let root_entries = lister.list("").await?;
    let mut level: Vec<String> = Vec::new();
    let mut depth = 1;
    if collect_children(&mut outcome, "", root_entries, depth, limits, ignore, &mut level) {
        return Ok(outcome);
    }

    while !level.is_empty() {
        depth += 1;
        let mut next = Vec::new();
        for chunk in level.chunks(batch) {
            let listed = join_all(chunk.iter().map(|dir| lister.list(dir))).await;
            for (dir, result) in chunk.iter().zip(listed) {
                match result {
                    Ok(children) => {
                        if collect_children(&mut outcome, dir, children, depth, limits, ignore, &mut next) {
                            return Ok(outcome);
                        }
                    }
                    Err(e) => {
                        warn!("Cannot list {}: {}", dir, e);
                        outcome.unreadable.push((dir.clone(), e.to_string()));
                    }
                }
            }
        }
        level = next;
    }

    debug!(
        "Traversal found {} entries ({} skipped)",
        outcome.entries.len(),
        outcome.skipped.len()
    );
    Ok(outcome)
}

/// Record one directory's children. Returns `true` once the entry cap stops
/// the walk.
fn collect_children(
    outcome: &mut TraversalOutcome,
    parent: &str,
    children: Vec<ListedEntry>,
    depth: usize,
    limits: &TraversalLimits,
    ignore: &IgnoreMatcher,
    next_level: &mut Vec<String>,
) -> bool {
    for child in children {
        let rel = if parent.is_empty() {
            child.name.clone()
        } else {
            format!("{}/{}", parent, child.name)
        };
        if ignore.is_ignored(&rel) {
            outcome.skipped.push(rel);
            continue;
        }
        if outcome.entries.len() >= limits.max_entries {
            warn!("Traversal stopped at {} entries", limits.max_entries);
            outcome.truncated = true;
            return true;
        }
        if child.kind == EntryKind::Directory {
            if depth < limits.max_depth {
                next_level.push(rel.clone());
            } else {
                outcome.truncated = true;
            }
        }
        outcome.entries.push(CandidateEntry {
            relative_path: rel,
            kind: child.kind,
            size: child.size,
            modified: child.modified,
        });
    }
    false
}
