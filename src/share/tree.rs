//! In-memory shared file tree.
//!
//! An arena of nodes addressed by [`NodeId`]; directories keep their
//! children sorted by byte-wise name comparison. Sizes roll up to the
//! root on every mutation, each directory counts the direct children
//! that are subdirectories or hashed files, and a secondary index maps
//! root digests to the nodes carrying them. Back-references are plain
//! ids, so peer-list copies and removals never fight the borrow
//! checker.

use std::collections::HashMap;
use std::fmt;

use crate::tth::TthRoot;

/// Handle to a node inside a [`FileTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

/// File- or directory-specific payload of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    File {
        /// Root digest, when the hasher has produced one.
        tth: Option<TthRoot>,
        /// Last-modified time in epoch seconds.
        last_modified: i64,
    },
    Dir {
        /// Children sorted by byte-wise name comparison.
        children: Vec<NodeId>,
        /// Direct children that are directories or hashed files.
        has_tth: u32,
        /// The directory is known to be partial (peer-sourced lists).
        incomplete: bool,
    },
}

/// One entry in the shared tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub name: String,
    pub parent: Option<NodeId>,
    /// File size, or the sum of children sizes for a directory.
    pub size: u64,
    pub kind: NodeKind,
}

impl FileNode {
    pub fn file(name: impl Into<String>, size: u64, tth: Option<TthRoot>, last_modified: i64) -> Self {
        FileNode {
            name: name.into(),
            parent: None,
            size,
            kind: NodeKind::File { tth, last_modified },
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        FileNode {
            name: name.into(),
            parent: None,
            size: 0,
            kind: NodeKind::Dir { children: Vec::new(), has_tth: 0, incomplete: false },
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir { .. })
    }

    pub fn tth(&self) -> Option<&TthRoot> {
        match &self.kind {
            NodeKind::File { tth, .. } => tth.as_ref(),
            NodeKind::Dir { .. } => None,
        }
    }

    pub fn incomplete(&self) -> bool {
        matches!(self.kind, NodeKind::Dir { incomplete: true, .. })
    }

    /// Whether this child bumps its parent's `has_tth` counter.
    fn counts_for_parent(&self) -> bool {
        match &self.kind {
            NodeKind::Dir { .. } => true,
            NodeKind::File { tth, .. } => tth.is_some(),
        }
    }
}

/// Error from a tree mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// A sibling with the same name already exists.
    DuplicateName(String),
    /// The target of an insert is not a directory.
    NotADirectory,
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeError::DuplicateName(name) => write!(f, "duplicate name: {}", name),
            TreeError::NotADirectory => write!(f, "not a directory"),
        }
    }
}

impl std::error::Error for TreeError {}

/// Arena-backed ordered file tree with a TTH secondary index.
#[derive(Debug)]
pub struct FileTree {
    nodes: Vec<Option<FileNode>>,
    free: Vec<u32>,
    root: NodeId,
    by_tth: HashMap<TthRoot, Vec<NodeId>>,
}

impl FileTree {
    /// Create a tree holding only an unnamed root directory.
    pub fn new() -> Self {
        FileTree {
            nodes: vec![Some(FileNode::dir(""))],
            free: Vec::new(),
            root: NodeId(0),
            by_tth: HashMap::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&FileNode> {
        self.nodes.get(id.0 as usize).and_then(|n| n.as_ref())
    }

    /// Like [`FileTree::get`] but panics on a stale id. Ids are only
    /// invalidated by `remove`, which callers drive themselves.
    pub fn node(&self, id: NodeId) -> &FileNode {
        self.get(id).expect("stale node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut FileNode {
        self.nodes[id.0 as usize].as_mut().expect("stale node id")
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match &self.node(id).kind {
            NodeKind::Dir { children, .. } => children,
            NodeKind::File { .. } => &[],
        }
    }

    /// Number of live nodes, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children(self.root).is_empty()
    }

    fn alloc(&mut self, node: FileNode) -> NodeId {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = Some(node);
                NodeId(idx)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId((self.nodes.len() - 1) as u32)
            }
        }
    }

    /// Insert a node under a directory, keeping siblings sorted and
    /// rolling size and `has_tth` updates up the tree.
    pub fn add(&mut self, parent: NodeId, mut node: FileNode) -> Result<NodeId, TreeError> {
        if !self.node(parent).is_dir() {
            return Err(TreeError::NotADirectory);
        }
        let pos = match self.child_position(parent, &node.name) {
            Ok(_) => return Err(TreeError::DuplicateName(node.name)),
            Err(pos) => pos,
        };
        node.parent = Some(parent);
        let counts = node.counts_for_parent();
        let size = node.size;
        let tth = node.tth().copied();
        let id = self.alloc(node);
        if let NodeKind::Dir { children, has_tth, .. } = &mut self.node_mut(parent).kind {
            children.insert(pos, id);
            if counts {
                *has_tth += 1;
            }
        }
        self.bubble_size(Some(parent), size as i64);
        if let Some(root) = tth {
            self.by_tth.entry(root).or_default().push(id);
        }
        Ok(id)
    }

    /// Remove a node and its whole subtree, updating parents and the
    /// TTH index. The root cannot be removed.
    pub fn remove(&mut self, id: NodeId) {
        if id == self.root {
            return;
        }
        let (parent, size, counts) = {
            let n = self.node(id);
            (n.parent, n.size, n.counts_for_parent())
        };
        if let Some(parent) = parent {
            let name = self.node(id).name.clone();
            if let Ok(pos) = self.child_position(parent, &name) {
                if let NodeKind::Dir { children, has_tth, .. } = &mut self.node_mut(parent).kind {
                    children.remove(pos);
                    if counts {
                        *has_tth -= 1;
                    }
                }
            }
            self.bubble_size(Some(parent), -(size as i64));
        }
        self.free_subtree(id);
    }

    fn free_subtree(&mut self, id: NodeId) {
        let node = self.nodes[id.0 as usize].take().expect("stale node id");
        if let Some(root) = node.tth() {
            if let Some(ids) = self.by_tth.get_mut(root) {
                ids.retain(|&n| n != id);
                if ids.is_empty() {
                    self.by_tth.remove(root);
                }
            }
        }
        if let NodeKind::Dir { children, .. } = node.kind {
            for child in children {
                self.free_subtree(child);
            }
        }
        self.free.push(id.0);
    }

    /// Attach a digest to (or detach one from) a file, adjusting the
    /// parent counter and the TTH index. Used by the hasher's deltas.
    pub fn set_file_tth(&mut self, id: NodeId, new: Option<TthRoot>) {
        let parent = self.node(id).parent;
        let old = match &mut self.node_mut(id).kind {
            NodeKind::File { tth, .. } => std::mem::replace(tth, new),
            NodeKind::Dir { .. } => return,
        };
        if let Some(root) = old {
            if let Some(ids) = self.by_tth.get_mut(&root) {
                ids.retain(|&n| n != id);
                if ids.is_empty() {
                    self.by_tth.remove(&root);
                }
            }
        }
        if let Some(root) = new {
            self.by_tth.entry(root).or_default().push(id);
        }
        if let Some(parent) = parent {
            let delta: i64 = match (old.is_some(), new.is_some()) {
                (false, true) => 1,
                (true, false) => -1,
                _ => 0,
            };
            if delta != 0 {
                if let NodeKind::Dir { has_tth, .. } = &mut self.node_mut(parent).kind {
                    *has_tth = (*has_tth as i64 + delta) as u32;
                }
            }
        }
    }

    fn bubble_size(&mut self, mut at: Option<NodeId>, delta: i64) {
        while let Some(id) = at {
            let n = self.node_mut(id);
            n.size = (n.size as i64 + delta) as u64;
            at = n.parent;
        }
    }

    fn child_position(&self, dir: NodeId, name: &str) -> Result<usize, usize> {
        let children = self.children(dir);
        children.binary_search_by(|&c| self.node(c).name.as_bytes().cmp(name.as_bytes()))
    }

    /// Look a direct child up by (case-sensitive) name.
    pub fn child_by_name(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        self.child_position(dir, name)
            .ok()
            .map(|pos| self.children(dir)[pos])
    }

    /// Resolve a `/`-separated path relative to `root`. `/x` and `x`
    /// are equivalent; `..` is not supported and simply fails to
    /// resolve. Case-sensitive.
    pub fn resolve_path(&self, root: NodeId, path: &str) -> Option<NodeId> {
        let mut cur = root;
        for part in path.split('/') {
            if part.is_empty() {
                continue;
            }
            if !self.node(cur).is_dir() {
                return None;
            }
            cur = self.child_by_name(cur, part)?;
        }
        Some(cur)
    }

    /// Render the virtual path of a node, `/` for the root.
    pub fn path(&self, id: NodeId) -> String {
        if id == self.root {
            return "/".to_string();
        }
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            if n == self.root {
                break;
            }
            let node = self.node(n);
            parts.push(node.name.as_str());
            cur = node.parent;
        }
        let mut out = String::new();
        for part in parts.iter().rev() {
            out.push('/');
            out.push_str(part);
        }
        out
    }

    /// Whether `ancestor` lies on the parent chain of `id`.
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut cur = self.node(id).parent;
        while let Some(n) = cur {
            if n == ancestor {
                return true;
            }
            cur = self.node(n).parent;
        }
        false
    }

    /// Nodes currently carrying a given root digest.
    pub fn from_tth(&self, root: &TthRoot) -> &[NodeId] {
        self.by_tth.get(root).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Recursively copy the subtree at `src` in this tree into `dst`
    /// under `dst_parent`.
    pub fn copy_into(
        &self,
        src: NodeId,
        dst: &mut FileTree,
        dst_parent: NodeId,
    ) -> Result<NodeId, TreeError> {
        let node = self.node(src);
        let mut copy = node.clone();
        copy.parent = None;
        copy.size = if node.is_file() { node.size } else { 0 };
        if let NodeKind::Dir { children, has_tth, .. } = &mut copy.kind {
            children.clear();
            *has_tth = 0;
        }
        let new_id = dst.add(dst_parent, copy)?;
        for &child in self.children(src) {
            self.copy_into(child, dst, new_id)?;
        }
        Ok(new_id)
    }

    /// Walk the subtree depth-first, directories before their contents.
    pub fn walk(&self, id: NodeId, f: &mut impl FnMut(NodeId, &FileNode)) {
        let node = self.node(id);
        f(id, node);
        if node.is_dir() {
            for &child in self.children(id) {
                self.walk(child, f);
            }
        }
    }

    /// Check invariants I1-I4; returns a description of the first
    /// violation found. Exercised by the property tests.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> Result<(), String> {
        self.check_dir(self.root)?;
        for (root, ids) in &self.by_tth {
            for id in ids {
                let node = self.get(*id).ok_or("index points at freed node")?;
                if node.tth() != Some(root) {
                    return Err(format!("index mismatch for {}", node.name));
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn check_dir(&self, id: NodeId) -> Result<(), String> {
        let node = self.node(id);
        let (children, has_tth) = match &node.kind {
            NodeKind::Dir { children, has_tth, .. } => (children, *has_tth),
            NodeKind::File { tth, .. } => {
                if tth.is_some() && !self.from_tth(tth.as_ref().unwrap()).contains(&id) {
                    return Err(format!("{} missing from TTH index", node.name));
                }
                return Ok(());
            }
        };
        let mut size = 0u64;
        let mut counted = 0u32;
        let mut prev: Option<&str> = None;
        for &child in children {
            let c = self.node(child);
            if c.parent != Some(id) {
                return Err(format!("{} has wrong parent", c.name));
            }
            if let Some(p) = prev {
                if p.as_bytes() >= c.name.as_bytes() {
                    return Err(format!("siblings out of order at {}", c.name));
                }
            }
            prev = Some(c.name.as_str());
            size += c.size;
            if c.counts_for_parent() {
                counted += 1;
            }
            self.check_dir(child)?;
        }
        if size != node.size {
            return Err(format!("size rollup wrong at {}", node.name));
        }
        if counted != has_tth {
            return Err(format!("has_tth wrong at {}", node.name));
        }
        Ok(())
    }
}

impl Default for FileTree {
    fn default() -> Self {
        FileTree::new()
    }
}
