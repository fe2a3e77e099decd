//! Remote path helpers and the recursive-delete guard.
//!
//! Remote paths are always `/`-separated regardless of the local OS.

use crate::xfer::error::{XferError, XferResult};

/// Root-level system paths no recursive delete may touch.
const PROTECTED_PATHS: &[&str] = &[
    "/", "/bin", "/boot", "/dev", "/etc", "/home", "/lib", "/lib64", "/opt", "/proc", "/root",
    "/run", "/sbin", "/srv", "/sys", "/tmp", "/usr", "/var",
];

/// Collapse duplicate separators and `.` segments, resolve `..`, and strip
/// the trailing slash. Relative input stays relative.
pub fn normalize(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in unified.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Join a base directory and a relative path.
pub fn join(base: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        return normalize(base);
    }
    normalize(&format!("{}/{}", base.trim_end_matches('/'), rel))
}

/// Parent directory, or `None` for the root / a bare name.
pub fn parent(path: &str) -> Option<String> {
    let norm = normalize(path);
    if norm == "/" || norm.is_empty() {
        return None;
    }
    match norm.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(norm[..idx].to_string()),
        None => None,
    }
}

/// Final path segment.
pub fn file_name(path: &str) -> String {
    let norm = normalize(path);
    norm.rsplit('/').next().unwrap_or_default().to_string()
}

/// `path` relative to `root`, or `None` when it lies outside.
pub fn relative_to(root: &str, path: &str) -> Option<String> {
    let root = normalize(root);
    let path = normalize(path);
    if path == root {
        return Some(String::new());
    }
    let prefix = if root.ends_with('/') {
        root.clone()
    } else {
        format!("{}/", root)
    };
    path.strip_prefix(&prefix).map(str::to_string)
}

/// Number of segments below the root.
pub fn depth(rel: &str) -> usize {
    rel.split('/').filter(|s| !s.is_empty()).count()
}

pub fn is_protected(path: &str) -> bool {
    let mut norm = normalize(path);
    // Windows drive roots ("C:/") count as `/`.
    if norm.len() <= 3 && norm.chars().nth(1) == Some(':') {
        norm = "/".to_string();
    }
    if norm.is_empty() {
        return true;
    }
    PROTECTED_PATHS.contains(&norm.as_str())
}

/// Refuse recursive deletes of protected system paths.
pub fn guard_recursive_delete(path: &str) -> XferResult<()> {
    if is_protected(path) {
        return Err(XferError::DangerousPath {
            path: path.to_string(),
        });
    }
    Ok(())
}
