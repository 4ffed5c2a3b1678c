//! File-tree walking for persisted paths.
//!
//! A file's path is the chain of `name` attributes from the file's own tree
//! node up to a node with a null `parentId`, sanitized per segment. Cycles
//! (possible after mis-ordered merges) yield no path; the caller falls back
//! to a flat `files/` location. A parent lookup that misses mid-walk ends
//! the walk and accepts the collected segments; a miss on the very first
//! node yields no path.

use std::collections::HashSet;

use yrs::{Any, Map, MapRef, Out, ReadTxn};

const FORBIDDEN: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Replaces filesystem-hostile characters with `_`, trims whitespace, and
/// falls back to `untitled` for empty results.
#[must_use]
pub fn sanitize_segment(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if FORBIDDEN.contains(&c) { '_' } else { c })
        .collect();
    let trimmed = replaced.trim();
    if trimmed.is_empty() {
        "untitled".to_owned()
    } else {
        trimmed.to_owned()
    }
}

pub(crate) fn fallback_path(file_id: &str) -> String {
    format!("files/{}.txt", sanitize_segment(file_id))
}

pub(crate) fn file_path<T: ReadTxn>(txn: &T, nodes: &MapRef, file_id: &str) -> Option<String> {
    let mut segments: Vec<String> = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut current = file_id.to_owned();

    loop {
        let Some(Out::YMap(node)) = nodes.get(txn, &current) else {
            if segments.is_empty() {
                return None;
            }
            break;
        };
        if !visited.insert(current.clone()) {
            return None;
        }

        let name = match node.get(txn, "name") {
            Some(Out::Any(Any::String(name))) => name.to_string(),
            _ => String::new(),
        };
        segments.push(sanitize_segment(&name));

        match node.get(txn, "parentId") {
            Some(Out::Any(Any::String(parent_id))) => current = parent_id.to_string(),
            _ => break,
        }
    }

    segments.reverse();
    Some(segments.join("/"))
}
