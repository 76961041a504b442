//! In-memory B-tree whose subtrees may be absent.
//!
//! This module provides the classic B-tree algorithms over an arena of
//! nodes, any of which may be a ghost standing in for a subtree that lives
//! only in the backing store.
//!
//! # Structure
//!
//! The tree consists of:
//! - Loaded nodes: a key range, sorted entries, and child ids
//! - Ghost nodes: a key range, a cached subtree size, and a location
//!
//! Reading through a ghost yields [`BTreeError::NotLoaded`] naming the
//! ghost, so a caller can load it and retry.
//!
//! # Order
//!
//! With order `NODE_MIN` every non-root node holds between `NODE_MIN - 1`
//! and `2 * NODE_MIN - 1` entries, and every leaf sits at the same depth.
//!
//! # Usage
//!
//! ```
//! use btree_index::btree::BTree;
//!
//! let mut tree = BTree::new(2).expect("valid order");
//! for i in 1..=7 {
//!     tree.put(i, i * 10).expect("put");
//! }
//! assert_eq!(tree.get(&4).expect("get"), Some(&40));
//! assert_eq!(tree.len(), 7);
//! ```

mod bulk;
mod iter;
mod node;
mod tree;
mod verify;

pub use bulk::allocate_evenly;
pub use iter::{Entries, Iter, Keys};
pub use node::{Ghost, Node, NodeId, NodeRange, Slot, TreeNode};
pub use tree::BTree;
pub(crate) use tree::Target;

/// What a read ran into that was not loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unloaded {
    /// The node itself is a ghost.
    Node(NodeId),
    /// The node is loaded but its values are not.
    Values(NodeId),
}

/// Errors that can occur during tree operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BTreeError {
    /// A read reached data that is not in memory.
    NotLoaded { target: Unloaded, range: String },
    /// Positional lookup past the end of the tree.
    IndexOutOfBounds { index: usize, size: usize },
    /// Bad parameter.
    IllegalArgument(String),
    /// The node graph broke one of its invariants.
    Verification(String),
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLoaded {
                target: Unloaded::Node(_),
                range,
            } => write!(f, "node {range} not loaded"),
            Self::NotLoaded {
                target: Unloaded::Values(_),
                range,
            } => write!(f, "values of node {range} not loaded"),
            Self::IndexOutOfBounds { index, size } => {
                write!(f, "index {index} out of bounds (size: {size})")
            }
            Self::IllegalArgument(msg) => write!(f, "illegal argument: {msg}"),
            Self::Verification(msg) => write!(f, "tree verification failed: {msg}"),
        }
    }
}

impl std::error::Error for BTreeError {}

impl BTreeError {
    #[must_use]
    pub const fn is_not_loaded(&self) -> bool {
        matches!(self, Self::NotLoaded { .. })
    }
}
