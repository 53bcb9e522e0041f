//! Search over the shared file tree.
//!
//! Depth-first walk with a result cap. Include terms already matched
//! by a directory name are dropped from the search of its children, so
//! a query for `music flac` matches files inside a `music` directory
//! whose own names only contain `flac`.

use super::tree::{FileTree, NodeId};

/// Size predicate of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCond {
    Any,
    /// Strictly smaller than the threshold.
    Less(u64),
    /// Strictly larger than the threshold.
    Greater(u64),
}

/// A parsed search query.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub size: SizeCond,
    pub want_files: bool,
    pub want_dirs: bool,
    /// Extension whitelist, lowercased. Empty means any extension.
    pub exts: Vec<String>,
    /// Include substrings, matched case-insensitively.
    pub terms: Vec<String>,
}

impl SearchQuery {
    pub fn new(terms: Vec<String>) -> Self {
        SearchQuery {
            size: SizeCond::Any,
            want_files: true,
            want_dirs: false,
            exts: Vec::new(),
            terms,
        }
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn name_matches(name: &str, exts: &[String], terms: &[&str]) -> bool {
    for term in terms {
        if !contains_ci(name, term) {
            return false;
        }
    }
    if exts.is_empty() {
        return true;
    }
    let ext = match name.rsplit_once('.') {
        Some((_, e)) if !e.is_empty() => e,
        _ => return false,
    };
    exts.iter().any(|e| e.eq_ignore_ascii_case(ext))
}

/// Whether a single node satisfies the query with the given remaining
/// include terms. Only hashed files satisfy the file predicate.
pub fn node_matches(tree: &FileTree, id: NodeId, q: &SearchQuery, terms: &[&str]) -> bool {
    let node = tree.node(id);
    let kind_ok = if node.is_file() {
        q.want_files && node.tth().is_some()
    } else {
        q.want_dirs
    };
    if !kind_ok {
        return false;
    }
    let size_ok = match q.size {
        SizeCond::Any => true,
        SizeCond::Less(s) => node.size < s,
        SizeCond::Greater(s) => node.size > s,
    };
    size_ok && name_matches(&node.name, &q.exts, terms)
}

/// Search the subtree under `root`, returning at most `max` node ids
/// in depth-first order.
pub fn search(tree: &FileTree, root: NodeId, q: &SearchQuery, max: usize) -> Vec<NodeId> {
    let mut out = Vec::new();
    let terms: Vec<&str> = q.terms.iter().map(String::as_str).collect();
    walk(tree, root, q, &terms, max, &mut out);
    out
}

fn walk(
    tree: &FileTree,
    dir: NodeId,
    q: &SearchQuery,
    terms: &[&str],
    max: usize,
    out: &mut Vec<NodeId>,
) {
    // prune the terms this directory's name already satisfies
    let name = &tree.node(dir).name;
    let remaining: Vec<&str> = terms
        .iter()
        .copied()
        .filter(|t| name.is_empty() || !contains_ci(name, t))
        .collect();
    for &child in tree.children(dir) {
        if out.len() >= max {
            return;
        }
        if node_matches(tree, child, q, &remaining) {
            out.push(child);
        }
        if tree.node(child).is_dir() && out.len() < max {
            walk(tree, child, q, &remaining, max, out);
        }
    }
}
