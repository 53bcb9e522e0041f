//! Shared file tree: in-memory structure, search, and file-list
//! persistence.
//!
//! The tree is process-wide with a single writer (the hasher's
//! off-loop worker posts deltas); hub and client-client sessions read
//! it to answer searches and resolve upload requests.

pub mod filelist;
pub mod search;
pub mod tree;

pub use filelist::{load, parse, save, write_list, FileListError};
pub use search::{search, node_matches, SearchQuery, SizeCond};
pub use tree::{FileNode, FileTree, NodeId, NodeKind, TreeError};
