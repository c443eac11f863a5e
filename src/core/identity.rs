//! Deterministic runbook IDs.
//!
//! IDs are derived from as little of each runbook's path as is needed to tell
//! it apart from the others in the same batch: first the file name, then the
//! file name plus its parent directory, and so on.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use super::error::{Error, Result};

/// Prefix of IDs handed to runbooks without a path.
pub const RANDOM_ID_PREFIX: &str = "r-";

/// Hash used for runbook IDs.
pub fn hash_id(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A random ID for a runbook that has no path.
pub fn random_id() -> String {
    format!("{RANDOM_ID_PREFIX}{}", uuid::Uuid::new_v4().simple())
}

/// Absolute path with `.` and `..` resolved lexically.
pub fn clean_path(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

fn reversed_segments(path: &Path) -> Vec<String> {
    clean_path(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .rev()
        .collect()
}

/// Generate one ID per path.
///
/// Empty paths receive a random ID. All other IDs are the hash of the first
/// `i` reversed path segments joined by `/`, with `i` the smallest depth at
/// which every hash in the batch is distinct.
pub fn generate_ids_using_path(paths: &[PathBuf]) -> Result<Vec<String>> {
    let segments: Vec<Option<Vec<String>>> = paths
        .iter()
        .map(|p| if p.as_os_str().is_empty() { None } else { Some(reversed_segments(p)) })
        .collect();

    let max_depth = segments.iter().flatten().map(Vec::len).max().unwrap_or(0);

    let mut depth = 1;
    loop {
        let mut seen = HashSet::new();
        let mut collision = None;
        let ids: Vec<String> = segments
            .iter()
            .enumerate()
            .map(|(i, segs)| match segs {
                None => random_id(),
                Some(segs) => {
                    let take = depth.min(segs.len());
                    let id = hash_id(&segs[..take].join("/"));
                    if !seen.insert(id.clone()) {
                        collision.get_or_insert(i);
                    }
                    id
                }
            })
            .collect();

        let Some(i) = collision else {
            return Ok(ids);
        };
        if depth >= max_depth {
            return Err(Error::AmbiguousId(paths[i].display().to_string()));
        }
        depth += 1;
    }
}
